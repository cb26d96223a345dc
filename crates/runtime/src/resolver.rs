//! Locating module source text
//!
//! `import Name` asks a [`SourceResolver`] for the text of `Name`. The file
//! system resolver walks the configured import path; hosts with their own
//! file index implement the trait themselves.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Source text of a module and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub path: String,
    pub text: String,
}

pub trait SourceResolver {
    /// Finds the source of module `name` imported from the script at
    /// `importer` (empty when the importer has no path). `Ok(None)` means
    /// the module does not exist; errors are reserved for unreadable files.
    fn find_module_source(
        &self,
        name: &str,
        importer: &str,
        config: &EngineConfig,
    ) -> Result<Option<ModuleSource>>;
}

/// Resolves modules from files following `EngineConfig::import_path`.
#[derive(Debug, Default, Clone)]
pub struct FileSystemResolver;

impl FileSystemResolver {
    pub fn new() -> Self {
        FileSystemResolver
    }

    /// Most recently modified file called `file_name` under any of `roots`.
    fn newest_match(file_name: &str, roots: &[PathBuf]) -> Option<PathBuf> {
        let mut best: Option<(SystemTime, PathBuf)> = None;
        for root in roots {
            for entry in WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() || entry.file_name().to_str() != Some(file_name) {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                if best.as_ref().is_none_or(|(newest, _)| modified > *newest) {
                    best = Some((modified, entry.into_path()));
                }
            }
        }
        best.map(|(_, path)| path)
    }

    fn read(path: &Path) -> Result<ModuleSource> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::NotFound(format!("cannot read module '{}': {}", path.display(), e))
        })?;
        Ok(ModuleSource {
            path: path.to_string_lossy().into_owned(),
            text,
        })
    }
}

impl SourceResolver for FileSystemResolver {
    fn find_module_source(
        &self,
        name: &str,
        importer: &str,
        config: &EngineConfig,
    ) -> Result<Option<ModuleSource>> {
        let file_name = config.module_file_name(name);
        for entry in &config.import_path {
            let candidate = match entry.as_str() {
                "" => {
                    if importer.is_empty() {
                        continue;
                    }
                    let dir = Path::new(importer).parent().unwrap_or(Path::new(""));
                    Some(dir.join(&file_name))
                }
                "*" => Self::newest_match(&file_name, &config.search_roots),
                dir => Some(Path::new(dir).join(&file_name)),
            };
            if let Some(path) = candidate.filter(|p| p.is_file()) {
                debug!(module = name, path = %path.display(), entry = %entry, "module found");
                return Self::read(&path).map(Some);
            }
        }
        debug!(module = name, importer, "module not found on import path");
        Ok(None)
    }
}

/// Modules kept in memory, keyed by module name.
#[derive(Debug, Default, Clone)]
pub struct MemoryResolver {
    modules: HashMap<String, String>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.modules.insert(name.into(), text.into());
    }
}

impl SourceResolver for MemoryResolver {
    fn find_module_source(
        &self,
        name: &str,
        _importer: &str,
        config: &EngineConfig,
    ) -> Result<Option<ModuleSource>> {
        Ok(self.modules.get(name).map(|text| ModuleSource {
            path: config.module_file_name(name),
            text: text.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(entries: &[&str], roots: Vec<PathBuf>) -> EngineConfig {
        EngineConfig {
            import_path: entries.iter().map(|e| e.to_string()).collect(),
            search_roots: roots,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_importer_directory_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Util.qs"), "x = 1").unwrap();
        let importer = dir.path().join("main.qs");
        let config = config_for(&[""], vec![]);
        let found = FileSystemResolver::new()
            .find_module_source("Util", &importer.to_string_lossy(), &config)
            .unwrap()
            .unwrap();
        assert_eq!(found.text, "x = 1");

        // Without an importer path the entry is skipped.
        assert!(FileSystemResolver::new()
            .find_module_source("Util", "", &config)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_explicit_directory_entry_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(second.path().join("Lib.qs"), "second").unwrap();
        let config = config_for(
            &[
                &first.path().to_string_lossy(),
                &second.path().to_string_lossy(),
            ],
            vec![],
        );
        let found = FileSystemResolver::new()
            .find_module_source("Lib", "", &config)
            .unwrap()
            .unwrap();
        assert_eq!(found.text, "second");

        fs::write(first.path().join("Lib.qs"), "first").unwrap();
        let found = FileSystemResolver::new()
            .find_module_source("Lib", "", &config)
            .unwrap()
            .unwrap();
        assert_eq!(found.text, "first");
    }

    #[test]
    fn test_wildcard_searches_roots() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("Deep.qs"), "deep").unwrap();
        let config = config_for(&["*"], vec![root.path().to_path_buf()]);
        let found = FileSystemResolver::new()
            .find_module_source("Deep", "", &config)
            .unwrap()
            .unwrap();
        assert_eq!(found.text, "deep");
        assert!(FileSystemResolver::new()
            .find_module_source("Missing", "", &config)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_memory_resolver() {
        let resolver = MemoryResolver::new().with_module("M", "y = 2");
        let config = EngineConfig::default();
        let found = resolver.find_module_source("M", "", &config).unwrap().unwrap();
        assert_eq!(found.path, "M.qs");
        assert!(resolver.find_module_source("N", "", &config).unwrap().is_none());
    }
}
