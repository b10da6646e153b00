//! In-memory credential register.
//!
//! The [`CredentialStore`] is a `tokio::sync::watch` channel in disguise:
//! readers always see the latest committed value, subscribers are woken on
//! every commit, and a replace is a single atomic swap so no reader can
//! observe half of a token pair. Only the session controller writes to it;
//! the mutating methods are crate-private.

use std::sync::Arc;

use tokio::sync::watch;

use crate::credential::Credential;

/// Read/subscribe handle to the current credential.
///
/// Cloning is cheap; all clones observe the same register.
#[derive(Clone)]
pub struct CredentialStore {
    tx: Arc<watch::Sender<Option<Credential>>>,
}

impl CredentialStore {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Latest committed credential, if any. Never blocks on writers.
    pub fn get(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    /// Current access token, if any.
    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|c| c.access_token.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Receive every committed state from now on.
    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }

    /// Replace the credential. Last writer wins.
    pub(crate) fn set(&self, credential: Credential) {
        tracing::debug!(subject = %credential.identity.subject_id, "credential committed");
        self.tx.send_replace(Some(credential));
    }

    pub(crate) fn clear(&self) {
        if self.tx.send_replace(None).is_some() {
            tracing::debug!("credential cleared");
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("present", &!self.is_empty())
            .finish()
    }
}
