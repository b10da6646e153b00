//! Two-phase identity-provider redirect.
//!
//! Phase 1 ([`ProviderRedirect::begin`]) mints an opaque, single-use state
//! token, remembers the PKCE verifier and the page to return to, and hands
//! back the authorization URL. Phase 2 ([`ProviderRedirect::validate`])
//! consumes the state that came back on the callback. A callback whose
//! state is unknown, reused or older than the TTL is refused before any
//! code exchange happens.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::config::ProviderConfig;
use crate::error::{AuthError, Result};
use crate::oauth::{authorization_url, generate_pkce_verifier, pkce_challenge};

/// What phase 1 hands to the caller.
#[derive(Debug, Clone)]
pub struct RedirectTicket {
    /// Where to send the user.
    pub url: String,
    /// The state token embedded in `url`.
    pub state: String,
}

/// What phase 2 recovers from a valid state.
#[derive(Debug, Clone)]
pub struct ValidatedCallback {
    pub code_verifier: String,
    pub return_path: Option<String>,
}

#[derive(Debug)]
struct PendingRedirect {
    code_verifier: String,
    return_path: Option<String>,
    expires_at: DateTime<Utc>,
}

/// Issues and validates provider redirect state tokens.
pub struct ProviderRedirect {
    config: ProviderConfig,
    pending: Mutex<HashMap<String, PendingRedirect>>,
    ttl: Duration,
}

impl ProviderRedirect {
    pub fn new(config: ProviderConfig, ttl: Duration) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Phase 1: create a state token and the authorization URL carrying it.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidConfig`] when no provider client id is configured.
    pub fn begin(&self, return_path: Option<&str>) -> Result<RedirectTicket> {
        if !self.config.is_configured() {
            return Err(AuthError::InvalidConfig {
                reason: "identity provider client id is not configured".to_string(),
            });
        }

        let code_verifier = generate_pkce_verifier()?;
        let state = uuid::Uuid::new_v4().simple().to_string();
        let url = authorization_url(&self.config, &state, &pkce_challenge(&code_verifier))?;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        pending.retain(|_, p| p.expires_at > now);
        pending.insert(
            state.clone(),
            PendingRedirect {
                code_verifier,
                return_path: return_path.map(String::from),
                expires_at: now + self.ttl,
            },
        );

        tracing::info!(pending = pending.len(), "issued provider redirect");
        Ok(RedirectTicket { url, state })
    }

    /// Phase 2: consume `state`. Succeeds at most once per state token.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidState`] for unknown, reused or expired tokens.
    pub fn validate(&self, state: &str) -> Result<ValidatedCallback> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(state);

        match entry {
            Some(p) if Utc::now() <= p.expires_at => Ok(ValidatedCallback {
                code_verifier: p.code_verifier,
                return_path: p.return_path,
            }),
            Some(_) => {
                tracing::warn!("provider callback state expired");
                Err(AuthError::InvalidState)
            }
            None => {
                tracing::warn!("provider callback with unknown state");
                Err(AuthError::InvalidState)
            }
        }
    }

    /// Number of redirects still awaiting their callback.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ProviderConfig {
        ProviderConfig {
            client_id: "client".to_string(),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn begin_embeds_state_in_url() {
        let redirect = ProviderRedirect::new(configured(), Duration::minutes(10));
        let ticket = redirect.begin(Some("/calendar")).unwrap();

        let url = url::Url::parse(&ticket.url).unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned());
        assert_eq!(state.as_deref(), Some(ticket.state.as_str()));
        assert_eq!(redirect.pending(), 1);
    }

    #[test]
    fn validate_returns_verifier_and_return_path_once() {
        let redirect = ProviderRedirect::new(configured(), Duration::minutes(10));
        let ticket = redirect.begin(Some("/calendar")).unwrap();

        let validated = redirect.validate(&ticket.state).unwrap();
        assert_eq!(validated.return_path.as_deref(), Some("/calendar"));
        assert_eq!(validated.code_verifier.len(), 43);

        assert!(matches!(
            redirect.validate(&ticket.state),
            Err(AuthError::InvalidState)
        ));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let redirect = ProviderRedirect::new(configured(), Duration::minutes(10));
        assert!(matches!(
            redirect.validate("forged"),
            Err(AuthError::InvalidState)
        ));
    }

    #[test]
    fn expired_state_is_rejected() {
        let redirect = ProviderRedirect::new(configured(), Duration::seconds(-1));
        let ticket = redirect.begin(None).unwrap();
        assert!(matches!(
            redirect.validate(&ticket.state),
            Err(AuthError::InvalidState)
        ));
    }

    #[test]
    fn begin_requires_client_id() {
        let redirect = ProviderRedirect::new(ProviderConfig::default(), Duration::minutes(10));
        assert!(matches!(
            redirect.begin(None),
            Err(AuthError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn states_are_unique() {
        let redirect = ProviderRedirect::new(configured(), Duration::minutes(10));
        let a = redirect.begin(None).unwrap();
        let b = redirect.begin(None).unwrap();
        assert_ne!(a.state, b.state);
        assert_eq!(redirect.pending(), 2);
    }
}
