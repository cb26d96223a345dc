//! Compiled-script cache
//!
//! Parsed scripts are stored as binary files named by the SHA-256 of their
//! source text, in `$XDG_CACHE_HOME/quill/` or `~/.cache/quill/`. A stale
//! or damaged entry is never an error: it is ignored and the script is
//! parsed again.

use crate::ast::Script;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::script_codec;
use quill_core::{ProtocolVersion, Reader, Writer};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const MAGIC: &str = "quill-script";

/// `$XDG_CACHE_HOME/quill/` or `~/.cache/quill/`.
pub fn default_cache_dir() -> Option<PathBuf> {
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        let path = PathBuf::from(xdg_cache);
        if path.is_absolute() {
            return Some(path.join("quill"));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".cache").join("quill"));
    }
    None
}

/// Blanks out a `#!` first line, keeping line numbers intact.
fn strip_shebang(source: &str) -> Cow<'_, str> {
    if !source.starts_with("#!") {
        return Cow::Borrowed(source);
    }
    match source.find('\n') {
        Some(newline) => {
            let mut result = String::with_capacity(source.len());
            result.push('#');
            result.push_str(&" ".repeat(newline - 1));
            result.push_str(&source[newline..]);
            Cow::Owned(result)
        }
        None => Cow::Borrowed("#"),
    }
}

/// Hex SHA-256 of the source with any shebang line removed.
pub fn cache_key(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strip_shebang(source).as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct ScriptCache {
    dir: PathBuf,
}

impl ScriptCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ScriptCache { dir: dir.into() }
    }

    /// Cache in `config.cache_dir`, or the default location.
    pub fn from_config(config: &EngineConfig) -> Option<Self> {
        config
            .cache_dir
            .clone()
            .or_else(default_cache_dir)
            .map(ScriptCache::new)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.qsc", key))
    }

    /// The cached parse of `source`, if there is a usable one.
    pub fn load(&self, source: &str) -> Option<Script> {
        let key = cache_key(source);
        let bytes = fs::read(self.entry_path(&key)).ok()?;
        match decode_entry(&bytes, &key) {
            Ok(script) => {
                debug!(key = %key, "compiled script cache hit");
                Some(script)
            }
            Err(error) => {
                debug!(key = %key, "ignoring cache entry: {}", error);
                None
            }
        }
    }

    pub fn store(&self, source: &str, script: &Script) -> Result<()> {
        let key = cache_key(source);
        let mut writer = Writer::new();
        writer.write_header();
        writer.write_text(MAGIC)?.write_text(&key)?;
        script_codec::write_script(script, &mut writer)?;

        let io_error = |e: std::io::Error| Error::Invalid(format!("script cache: {}", e));
        fs::create_dir_all(&self.dir).map_err(io_error)?;
        // Written under a temporary name so readers never see a partial entry.
        let temp = self
            .dir
            .join(format!("{}.{}.tmp", key, std::process::id()));
        fs::write(&temp, writer.as_bytes()).map_err(io_error)?;
        if let Err(error) = fs::rename(&temp, self.entry_path(&key)) {
            let _ = fs::remove_file(&temp);
            return Err(io_error(error));
        }
        Ok(())
    }
}

fn decode_entry(bytes: &[u8], key: &str) -> Result<Script> {
    let mut reader = Reader::with_header(bytes)?;
    if reader.version() != ProtocolVersion::LATEST {
        return Err(Error::Deserialization(format!(
            "entry written with protocol version {}",
            reader.version().as_byte()
        )));
    }
    if reader.read_text()? != MAGIC || reader.read_text()? != key {
        return Err(Error::Deserialization("not a cache entry for this source".to_string()));
    }
    let script = script_codec::read_script(&mut reader)?;
    if !reader.at_end() {
        return Err(Error::Deserialization("trailing bytes in cache entry".to_string()));
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_script;
    use serial_test::serial;
    use tempfile::tempdir;

    fn restore(name: &str, value: Option<String>) {
        // SAFETY: callers are #[serial]
        unsafe {
            match value {
                Some(v) => std::env::set_var(name, v),
                None => std::env::remove_var(name),
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_dir_prefers_xdg() {
        let orig_xdg = std::env::var("XDG_CACHE_HOME").ok();
        let orig_home = std::env::var("HOME").ok();
        // SAFETY: serial test
        unsafe {
            std::env::set_var("XDG_CACHE_HOME", "/tmp/test-xdg-cache");
        }
        assert_eq!(default_cache_dir(), Some(PathBuf::from("/tmp/test-xdg-cache/quill")));

        // SAFETY: serial test
        unsafe {
            std::env::remove_var("XDG_CACHE_HOME");
            std::env::set_var("HOME", "/tmp/test-home");
        }
        assert_eq!(default_cache_dir(), Some(PathBuf::from("/tmp/test-home/.cache/quill")));

        restore("XDG_CACHE_HOME", orig_xdg);
        restore("HOME", orig_home);
    }

    #[test]
    fn test_key_ignores_shebang() {
        let shebang = "#!/usr/bin/env quill\nprint 1\n";
        let blanked = format!("#{}\nprint 1\n", " ".repeat(19));
        assert_eq!(strip_shebang(shebang), blanked);
        assert_eq!(cache_key(shebang).len(), 64);
        assert_eq!(cache_key(shebang), cache_key(&blanked));
        assert_ne!(cache_key(shebang), cache_key("print 1\n"));
    }

    #[test]
    fn test_store_and_load() {
        let temp = tempdir().unwrap();
        let cache = ScriptCache::new(temp.path());
        let source = "x = 1\nwhile x < 10: x *= 2\nprint x";
        assert!(cache.load(source).is_none());

        let script = parse_script(source).unwrap();
        cache.store(source, &script).unwrap();
        assert_eq!(cache.load(source).unwrap(), script);
        assert!(cache.load("x = 2").is_none());
    }

    #[test]
    fn test_corrupt_entry_is_ignored() {
        let temp = tempdir().unwrap();
        let cache = ScriptCache::new(temp.path());
        let source = "a = [1, 2, 3]";
        fs::write(cache.entry_path(&cache_key(source)), b"garbage").unwrap();
        assert!(cache.load(source).is_none());

        let script = parse_script(source).unwrap();
        cache.store(source, &script).unwrap();
        assert!(cache.load(source).is_some());
    }
}
