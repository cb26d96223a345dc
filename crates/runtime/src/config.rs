//! Engine configuration
//!
//! Loaded from TOML, e.g.
//!
//! ```toml
//! import_path = ["", "*", "/usr/share/quill/modules"]
//! module_extension = "qs"
//! search_roots = ["/usr/share/quill"]
//! max_call_depth = 256
//! step_mode = "per-iteration"
//! ```
//!
//! Every key is optional; missing keys take the [`Default`] values.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// When a running process hands control back to its host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepMode {
    /// Run until the script finishes or fails.
    #[default]
    Continuous,
    /// Suspend after every iteration of a top-level loop.
    PerIteration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Where `import` looks for script modules, in order. `""` is the
    /// importing script's directory; `"*"` searches every file under
    /// `search_roots` and picks the most recently modified match.
    pub import_path: Vec<String>,
    /// File extension of script modules, without the dot.
    pub module_extension: String,
    /// Directories indexed for the `"*"` import path entry.
    pub search_roots: Vec<PathBuf>,
    /// Nesting limit for script function calls.
    pub max_call_depth: usize,
    pub step_mode: StepMode,
    /// Overrides the compiled-script cache location.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            import_path: vec![String::new(), "*".to_string()],
            module_extension: "qs".to_string(),
            search_roots: Vec::new(),
            max_call_depth: 128,
            step_mode: StepMode::Continuous,
            cache_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)
            .map_err(|e| Error::Invalid(format!("invalid engine configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::NotFound(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.max_call_depth == 0 {
            return Err(Error::Invalid(
                "max_call_depth must be at least 1".to_string(),
            ));
        }
        if self.module_extension.is_empty() || self.module_extension.starts_with('.') {
            return Err(Error::Invalid(format!(
                "module_extension '{}' must be a bare extension such as \"qs\"",
                self.module_extension
            )));
        }
        Ok(())
    }

    /// `name` with the module extension appended.
    pub fn module_file_name(&self, name: &str) -> String {
        format!("{}.{}", name, self.module_extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.import_path, vec!["", "*"]);
        assert_eq!(config.module_file_name("Config"), "Config.qs");
        assert_eq!(config.step_mode, StepMode::Continuous);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            max_call_depth = 16
            step_mode = "per-iteration"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_call_depth, 16);
        assert_eq!(config.step_mode, StepMode::PerIteration);
        assert_eq!(config.module_extension, "qs");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::from_toml("max_call_depth = 0").is_err());
        assert!(EngineConfig::from_toml("module_extension = \".qs\"").is_err());
        assert!(EngineConfig::from_toml("unknown_key = 1").is_err());
        assert!(EngineConfig::from_toml("step_mode = \"sometimes\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.toml");
        std::fs::write(&path, "import_path = [\"lib\"]\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.import_path, vec!["lib"]);
        assert!(EngineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
