//! Session persistence across restarts.
//!
//! Only the refresh token and the identity are cached; the access token is
//! rebuilt through a refresh on [`Session::restore`](crate::Session::restore).

use std::sync::{Mutex, PoisonError};

use medpass_vault::Vault;
use serde::{Deserialize, Serialize};

use crate::credential::{Credential, Identity};
use crate::error::Result;

/// Vault entry key holding the persisted session.
const SESSION_ENTRY: &str = "session";

/// Flag recording that the user confirmed their NetID.
pub const NET_ID_VERIFIED_FLAG: &str = "netid.verified";

/// The part of a credential worth keeping on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub refresh_token: String,
    pub identity: Identity,
}

impl PersistedSession {
    /// `None` when the credential has no refresh token to persist.
    pub fn from_credential(credential: &Credential) -> Option<Self> {
        credential
            .refresh_token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|refresh_token| Self {
                refresh_token: refresh_token.clone(),
                identity: credential.identity.clone(),
            })
    }
}

/// Where the session controller keeps state between runs.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>>;
    fn save(&self, session: &PersistedSession) -> Result<()>;
    /// Forget the persisted session and every flag tied to it.
    fn clear(&self) -> Result<()>;
    fn set_flag(&self, name: &str, value: bool) -> Result<()>;
    fn flag(&self, name: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Vault-backed
// ---------------------------------------------------------------------------

/// [`SessionPersistence`] backed by the encrypted MedPASS vault.
///
/// `rusqlite::Connection` is not `Sync`, so the vault sits behind a mutex
/// held only for the duration of each call.
pub struct VaultPersistence {
    vault: Mutex<Vault>,
}

impl VaultPersistence {
    pub fn new(vault: Vault) -> Self {
        Self {
            vault: Mutex::new(vault),
        }
    }

    fn with_vault<T>(&self, f: impl FnOnce(&Vault) -> medpass_vault::Result<T>) -> Result<T> {
        let vault = self.vault.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&vault)?)
    }
}

impl SessionPersistence for VaultPersistence {
    fn load(&self) -> Result<Option<PersistedSession>> {
        let Some(entry) = self.with_vault(|v| v.get(SESSION_ENTRY))? else {
            return Ok(None);
        };
        match serde_json::from_value(entry.data) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable cached session");
                self.with_vault(|v| v.remove(SESSION_ENTRY))?;
                Ok(None)
            }
        }
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        let data = serde_json::to_value(session)?;
        self.with_vault(|v| v.put(SESSION_ENTRY, &data))
    }

    fn clear(&self) -> Result<()> {
        self.with_vault(|v| {
            v.remove(SESSION_ENTRY)?;
            v.clear_flag(NET_ID_VERIFIED_FLAG)
        })
    }

    fn set_flag(&self, name: &str, value: bool) -> Result<()> {
        self.with_vault(|v| {
            if value {
                v.set_flag(name, "true")
            } else {
                v.clear_flag(name)
            }
        })
    }

    fn flag(&self, name: &str) -> Result<bool> {
        Ok(self.with_vault(|v| v.flag(name))?.as_deref() == Some("true"))
    }
}

// ---------------------------------------------------------------------------
// No-op
// ---------------------------------------------------------------------------

/// Keeps nothing. Flags live in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct NoPersistence {
    flags: Mutex<Vec<String>>,
}

impl SessionPersistence for NoPersistence {
    fn load(&self) -> Result<Option<PersistedSession>> {
        Ok(None)
    }

    fn save(&self, _session: &PersistedSession) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn set_flag(&self, name: &str, value: bool) -> Result<()> {
        let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
        flags.retain(|f| f != name);
        if value {
            flags.push(name.to_string());
        }
        Ok(())
    }

    fn flag(&self, name: &str) -> Result<bool> {
        Ok(self
            .flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|f| f == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Claims;

    fn vault_persistence() -> VaultPersistence {
        VaultPersistence::new(Vault::open_in_memory(&[7u8; 32]).unwrap())
    }

    fn session() -> PersistedSession {
        PersistedSession {
            refresh_token: "BBB".to_string(),
            identity: Identity::from_claims(Claims::default(), "jdoe", Some(true)),
        }
    }

    #[test]
    fn save_then_load() {
        let p = vault_persistence();
        assert!(p.load().unwrap().is_none());

        p.save(&session()).unwrap();
        assert_eq!(p.load().unwrap(), Some(session()));
    }

    #[test]
    fn clear_removes_session_and_netid_flag() {
        let p = vault_persistence();
        p.save(&session()).unwrap();
        p.set_flag(NET_ID_VERIFIED_FLAG, true).unwrap();

        p.clear().unwrap();
        assert!(p.load().unwrap().is_none());
        assert!(!p.flag(NET_ID_VERIFIED_FLAG).unwrap());
    }

    #[test]
    fn flags_round_trip() {
        let p = vault_persistence();
        assert!(!p.flag(NET_ID_VERIFIED_FLAG).unwrap());
        p.set_flag(NET_ID_VERIFIED_FLAG, true).unwrap();
        assert!(p.flag(NET_ID_VERIFIED_FLAG).unwrap());
        p.set_flag(NET_ID_VERIFIED_FLAG, false).unwrap();
        assert!(!p.flag(NET_ID_VERIFIED_FLAG).unwrap());
    }

    #[test]
    fn unreadable_entry_is_discarded() {
        let p = vault_persistence();
        p.with_vault(|v| v.put(SESSION_ENTRY, &serde_json::json!({"unexpected": 1})))
            .unwrap();
        assert!(p.load().unwrap().is_none());
        assert!(p.with_vault(|v| v.get(SESSION_ENTRY)).unwrap().is_none());
    }

    #[test]
    fn credential_without_refresh_token_is_not_persisted() {
        let identity = Identity::from_claims(Claims::default(), "jdoe", None);
        let credential = Credential::issue("AAA".into(), None, None, identity.clone());
        assert!(PersistedSession::from_credential(&credential).is_none());

        let credential = Credential::issue("AAA".into(), Some("BBB".into()), None, identity);
        assert_eq!(
            PersistedSession::from_credential(&credential).map(|s| s.refresh_token),
            Some("BBB".to_string())
        );
    }

    #[test]
    fn no_persistence_keeps_flags_in_memory() {
        let p = NoPersistence::default();
        p.save(&session()).unwrap();
        assert!(p.load().unwrap().is_none());

        p.set_flag(NET_ID_VERIFIED_FLAG, true).unwrap();
        assert!(p.flag(NET_ID_VERIFIED_FLAG).unwrap());
        p.clear().unwrap();
        assert!(!p.flag(NET_ID_VERIFIED_FLAG).unwrap());
    }
}
