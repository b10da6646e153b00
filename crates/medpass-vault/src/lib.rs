//! Encrypted local session cache for MedPASS.
//!
//! The session core keeps the refresh token, the decoded identity and a
//! few plaintext flags across restarts. Entries are sealed with AES-256-GCM
//! under a per-installation key held in a user-only key file. Access tokens
//! are never written here.
//!
//! # Modules
//!
//! - [`crypto`]: AES-256-GCM encryption/decryption and random bytes.
//! - [`keyfile`]: load-or-create the cache key.
//! - [`store`]: SQLite-backed encrypted entries and flags.
//! - [`error`]: unified error type.

pub mod crypto;
pub mod error;
pub mod keyfile;
pub mod store;

pub use error::{Result, VaultError};
pub use keyfile::KeyFile;
pub use store::{Entry, Vault};
