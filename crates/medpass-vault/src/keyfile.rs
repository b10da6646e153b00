//! Master key file for the session cache.
//!
//! The cache key is 32 random bytes kept in a file next to the database,
//! readable by the current user only (mode 0600 on Unix). It is created on
//! first use and never rotated by this crate; deleting it invalidates every
//! cached entry, which the vault then treats as absent.

use std::path::{Path, PathBuf};

use crate::crypto;
use crate::error::{Result, VaultError};

/// A file holding the cache encryption key.
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default key file location: `<data_dir>/session.key`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("session.key")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the key, generating and writing a new one if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKeyFile`] if the file exists with the
    /// wrong length, or [`VaultError::Io`] on filesystem failures.
    pub fn load_or_create(&self) -> Result<Vec<u8>> {
        if self.path.exists() {
            let key = std::fs::read(&self.path)?;
            if key.len() != crypto::KEY_LEN {
                return Err(VaultError::InvalidKeyFile {
                    path: self.path.display().to_string(),
                    reason: format!("expected {} bytes, got {}", crypto::KEY_LEN, key.len()),
                });
            }
            tracing::debug!(path = %self.path.display(), "loaded session cache key");
            return Ok(key);
        }

        let key = crypto::random_bytes(crypto::KEY_LEN)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %self.path.display(), "created session cache key");
        Ok(key)
    }

    /// Remove the key file if present.
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            tracing::info!(path = %self.path.display(), "deleted session cache key");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_then_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = KeyFile::new(KeyFile::default_path(dir.path()));

        let first = keyfile.load_or_create().unwrap();
        let second = keyfile.load_or_create().unwrap();

        assert_eq!(first.len(), crypto::KEY_LEN);
        assert_eq!(first, second);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = KeyFile::new(dir.path().join("nested/deeper/session.key"));
        keyfile.load_or_create().unwrap();
        assert!(keyfile.path().exists());
    }

    #[test]
    fn rejects_truncated_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.key");
        std::fs::write(&path, b"short").unwrap();

        let err = KeyFile::new(&path).load_or_create().unwrap_err();
        assert!(matches!(err, VaultError::InvalidKeyFile { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let keyfile = KeyFile::new(dir.path().join("session.key"));
        keyfile.load_or_create().unwrap();

        let mode = std::fs::metadata(keyfile.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = KeyFile::new(dir.path().join("session.key"));
        keyfile.load_or_create().unwrap();
        keyfile.delete().unwrap();
        keyfile.delete().unwrap();
        assert!(!keyfile.path().exists());
    }
}
