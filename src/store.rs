//! ==============================================================================
//! store.rs - settings persistence
//! ==============================================================================
//!
//! purpose:
//!     loads the settings document from non-volatile storage and writes it back
//!     atomically. persisting never restarts anything; the caller decides.
//!
//! write protocol:
//!     1. serialize and write `<file>.tmp`
//!     2. fsync the temp file
//!     3. rename over the target (remove + rename where the platform refuses
//!        to replace an existing file)
//!
//!     a crash at any point leaves either the old or the new file, never a
//!     partial one.
//!
//! relationships:
//!     - uses: settings.rs (parse / to_text)
//!     - used by: runtime.rs (startup load), http/routes.rs (persist on update)
//!
//! ==============================================================================

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::settings::SettingsDocument;

/// Linux `EROFS`, for toolchains that report it as an uncategorized error.
const EROFS: i32 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file not found or empty: {0}")]
    NotFound(PathBuf),

    #[error("malformed settings at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("settings storage is read-only: {0}")]
    StorageReadOnly(PathBuf),

    #[error("settings I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<crate::settings::ParseError> for ConfigError {
    fn from(err: crate::settings::ParseError) -> Self {
        ConfigError::Malformed { line: err.line, reason: err.reason }
    }
}

/// Where the settings document lives.
pub trait SettingsStore {
    fn load(&self) -> Result<SettingsDocument, ConfigError>;
    fn persist(&self, document: &SettingsDocument) -> Result<(), ConfigError>;
}

/// File-backed settings store.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn write_temp(&self, tmp: &Path, text: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()
    }

    fn replace_target(&self, tmp: &Path) -> io::Result<()> {
        match fs::rename(tmp, &self.path) {
            Ok(()) => Ok(()),
            Err(_) if self.path.exists() => {
                fs::remove_file(&self.path)?;
                fs::rename(tmp, &self.path)
            }
            Err(err) => Err(err),
        }
    }
}

impl SettingsStore for ConfigStore {
    fn load(&self) -> Result<SettingsDocument, ConfigError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.clone()));
            }
            Err(err) => return Err(classify(&self.path, err)),
        };

        let text = String::from_utf8(bytes).map_err(|err| {
            let valid = &err.as_bytes()[..err.utf8_error().valid_up_to()];
            ConfigError::Malformed {
                line: valid.iter().filter(|b| **b == b'\n').count() + 1,
                reason: "not valid UTF-8".to_string(),
            }
        })?;

        if text.trim().is_empty() {
            return Err(ConfigError::NotFound(self.path.clone()));
        }

        let document = SettingsDocument::parse(&text)?;
        debug!(path = %self.path.display(), keys = document.len(), "Settings loaded");
        Ok(document)
    }

    fn persist(&self, document: &SettingsDocument) -> Result<(), ConfigError> {
        let tmp = self.temp_path();
        let text = document.to_text();

        let result = self
            .write_temp(&tmp, &text)
            .and_then(|()| self.replace_target(&tmp));

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(classify(&self.path, err));
        }

        // directory entry durability is best effort
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(handle) = File::open(dir) {
                let _ = handle.sync_all();
            }
        }

        debug!(path = %self.path.display(), bytes = text.len(), "Settings persisted");
        Ok(())
    }
}

fn classify(path: &Path, err: io::Error) -> ConfigError {
    if err.kind() == ErrorKind::ReadOnlyFilesystem || err.raw_os_error() == Some(EROFS) {
        ConfigError::StorageReadOnly(path.to_path_buf())
    } else {
        ConfigError::Io { path: path.to_path_buf(), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingValue;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("settings.toml"))
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(store_in(&dir).load(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_blank_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "  \n\n\t\n").unwrap();
        assert!(matches!(store.load(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_malformed_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "device_id = \"a\"\n\nthis line is wrong\n").unwrap();
        match store.load() {
            Err(ConfigError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"a = 1\nb = \"\xff\"\n").unwrap();
        match store.load() {
            Err(ConfigError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut doc = SettingsDocument::defaults();
        doc.insert("wifi_password", SettingValue::Str("p\"a#ss".into()));
        doc.insert("reading_interval_seconds", SettingValue::Float(2.5));
        store.persist(&doc).unwrap();

        assert_eq!(store.load().unwrap(), doc);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_persist_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "old = 1\n").unwrap();

        let mut doc = SettingsDocument::new();
        doc.insert("new", SettingValue::Int(2));
        store.persist(&doc).unwrap();

        assert_eq!(fs::read_to_string(store.path()).unwrap(), "new = 2\n");
    }

    #[test]
    fn test_persist_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join("settings.toml"));
        store.persist(&SettingsDocument::defaults()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_read_only_errors_are_classified() {
        let path = Path::new("/flash/settings.toml");
        let by_kind = classify(path, io::Error::from(ErrorKind::ReadOnlyFilesystem));
        assert!(matches!(by_kind, ConfigError::StorageReadOnly(_)));

        let by_errno = classify(path, io::Error::from_raw_os_error(EROFS));
        assert!(matches!(by_errno, ConfigError::StorageReadOnly(_)));

        let other = classify(path, io::Error::from(ErrorKind::PermissionDenied));
        assert!(matches!(other, ConfigError::Io { .. }));
    }
}
