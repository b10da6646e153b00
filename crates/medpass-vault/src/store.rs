//! SQLite-backed encrypted session cache.
//!
//! The [`Vault`] wraps a `rusqlite::Connection` and the cache key. Entries
//! are JSON values sealed with AES-256-GCM before they are written and
//! opened on read. Flags are small plaintext markers (such as
//! `netid.verified`) that carry no secret material.
//!
//! # Schema
//!
//! - `entries`: encrypted JSON blobs keyed by name.
//! - `flags`: plaintext name/value pairs.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::crypto;
use crate::error::{Result, VaultError};

/// A decrypted cache entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted session cache backed by SQLite.
///
/// # Example
///
/// ```rust,no_run
/// # use medpass_vault::{KeyFile, Vault};
/// # fn example() -> medpass_vault::Result<()> {
/// let key = KeyFile::new("data/session.key").load_or_create()?;
/// let vault = Vault::open("data/session.db", &key)?;
///
/// vault.put("session", &serde_json::json!({ "refresh_token": "..." }))?;
/// vault.set_flag("netid.verified", "true")?;
/// # Ok(())
/// # }
/// ```
pub struct Vault {
    conn: Connection,
    key: Vec<u8>,
}

impl Vault {
    /// Open (or create) a cache database at `path` sealed with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the database cannot be opened,
    /// or [`VaultError::MigrationFailed`] if schema setup fails.
    pub fn open(path: impl AsRef<std::path::Path>, key: &[u8]) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening session cache");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;

        let vault = Self {
            conn,
            key: key.to_vec(),
        };
        vault.run_migrations()?;
        Ok(vault)
    }

    /// Open an in-memory cache (useful for testing).
    pub fn open_in_memory(key: &[u8]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;

        let vault = Self {
            conn,
            key: key.to_vec(),
        };
        vault.run_migrations()?;
        Ok(vault)
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        tracing::debug!("running session cache migrations");

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS entries (
                    key        TEXT PRIMARY KEY,
                    data       BLOB NOT NULL,
                    nonce      BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS flags (
                    name   TEXT PRIMARY KEY,
                    value  TEXT NOT NULL,
                    set_at INTEGER NOT NULL
                );",
            )
            .map_err(|e| VaultError::MigrationFailed {
                reason: e.to_string(),
            })?;

        Ok(())
    }

    // -- Entries ------------------------------------------------------------

    /// Insert or replace an encrypted entry.
    pub fn put(&self, key: &str, data: &serde_json::Value) -> Result<()> {
        let plaintext = serde_json::to_vec(data)?;
        let (nonce, ciphertext) = crypto::encrypt(&plaintext, &self.key)?;
        let now = Utc::now().timestamp();

        self.conn.execute(
            "INSERT INTO entries (key, data, nonce, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET data = excluded.data, nonce = excluded.nonce,
                                            updated_at = excluded.updated_at",
            params![key, ciphertext, nonce.as_slice(), now],
        )?;

        tracing::debug!(key = key, "cached entry");
        Ok(())
    }

    /// Read and decrypt an entry. `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DecryptionFailed`] if the entry was sealed with
    /// a different key or has been tampered with.
    pub fn get(&self, key: &str) -> Result<Option<Entry>> {
        let row = self
            .conn
            .query_row(
                "SELECT data, nonce, updated_at FROM entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((ciphertext, nonce_vec, updated_at)) = row else {
            return Ok(None);
        };

        let nonce: [u8; crypto::NONCE_LEN_BYTES] =
            nonce_vec
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::DecryptionFailed {
                    reason: format!("stored nonce has length {}", nonce_vec.len()),
                })?;

        let plaintext = crypto::decrypt(&nonce, &ciphertext, &self.key)?;
        let data = serde_json::from_slice(&plaintext)?;

        Ok(Some(Entry {
            key: key.to_string(),
            data,
            updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
        }))
    }

    /// Delete an entry. Returns whether anything was removed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        if rows > 0 {
            tracing::debug!(key = key, "removed cached entry");
        }
        Ok(rows > 0)
    }

    // -- Flags --------------------------------------------------------------

    /// Set (or overwrite) a plaintext flag.
    pub fn set_flag(&self, name: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO flags (name, value, set_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, set_at = excluded.set_at",
            params![name, value, Utc::now().timestamp()],
        )?;
        tracing::debug!(flag = name, value = value, "set flag");
        Ok(())
    }

    /// Read a flag value.
    pub fn flag(&self, name: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM flags WHERE name = ?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn clear_flag(&self, name: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM flags WHERE name = ?1", params![name])?;
        Ok(())
    }
}
