//! Session data model: credentials, identities, status and requests.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::claims::Claims;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Who the current credential belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Platform subject identifier (username or NetID).
    pub subject_id: String,
    pub display_name: String,
    /// Administrator access to the dashboard.
    pub is_privileged: bool,
    /// Decoded access token payload, if the token was a JWT.
    #[serde(default)]
    pub claims: Claims,
    /// Student record returned by the provider link endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
}

impl Identity {
    /// Derive an identity from token claims.
    ///
    /// `fallback_subject` is used when the token carries neither `sub` nor
    /// `net_id` (opaque tokens). `privileged` overrides the claim when the
    /// response body states it explicitly.
    pub fn from_claims(claims: Claims, fallback_subject: &str, privileged: Option<bool>) -> Self {
        let subject_id = claims
            .sub
            .clone()
            .or_else(|| claims.net_id.clone())
            .unwrap_or_else(|| fallback_subject.to_string());

        let display_name = claims
            .name
            .clone()
            .or_else(|| claims.email.clone())
            .unwrap_or_else(|| subject_id.clone());

        let is_privileged = privileged.or(claims.issuperuser).unwrap_or(false);

        Self {
            subject_id,
            display_name,
            is_privileged,
            claims,
            profile: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// The token pair and identity held for the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token expiry, Unix seconds. `None` when unknown.
    pub expires_at: Option<i64>,
    pub identity: Identity,
}

impl Credential {
    /// Build a credential from a freshly issued access token.
    ///
    /// `expires_at` falls back to the token's own `exp` claim.
    pub fn issue(
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<i64>,
        identity: Identity,
    ) -> Self {
        let expires_at = expires_at.or(identity.claims.exp);
        Self {
            access_token,
            refresh_token,
            expires_at,
            identity,
        }
    }

    /// Whether the access token expires at or before `now + window`.
    ///
    /// An unknown expiry counts as already expired: a premature refresh is
    /// cheaper than a rejected API call.
    pub fn expires_within_at(&self, window: Duration, now: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + window.num_seconds(),
            None => true,
        }
    }

    /// [`expires_within_at`](Self::expires_within_at) against the wall clock.
    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_within_at(window, Utc::now().timestamp())
    }

    /// Apply a successful refresh on top of this credential.
    ///
    /// The access token is replaced. The refresh token and identity are
    /// kept unless the refresh supplied newer ones, and the expiry never
    /// moves backward.
    pub fn refreshed_with(&self, fresh: Credential) -> Credential {
        let expires_at = match (self.expires_at, fresh.expires_at) {
            (Some(old), Some(new)) if new < old => {
                tracing::warn!(old, new, "refresh returned an earlier expiry, keeping the later one");
                Some(old)
            }
            (old, new) => new.or(old),
        };

        let mut identity = self.identity.clone();
        if fresh.identity.claims != Claims::default() {
            identity.claims = fresh.identity.claims;
        }

        Credential {
            access_token: fresh.access_token,
            refresh_token: fresh.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at,
            identity,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Observable authentication status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    /// Transient: emitted just before the session falls back to
    /// `Unauthenticated` after the refresh token was rejected.
    RefreshFailed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::RefreshFailed => "refresh_failed",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Input to a sign-in. Each variant maps to one exchange.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthRequest {
    /// Username/password against the MedPASS API.
    CredentialLogin { subject_id: String, secret: String },
    /// Return leg of the identity-provider redirect.
    ProviderCallback { code: String, state: String },
    /// Trade a known refresh token for a new access token.
    RefreshRequest { refresh_token: String },
}

impl AuthRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CredentialLogin { .. } => "credential_login",
            Self::ProviderCallback { .. } => "provider_callback",
            Self::RefreshRequest { .. } => "refresh_request",
        }
    }
}

// Secrets stay out of logs and panic messages.
impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CredentialLogin { subject_id, .. } => f
                .debug_struct("CredentialLogin")
                .field("subject_id", subject_id)
                .field("secret", &"<redacted>")
                .finish(),
            Self::ProviderCallback { state, .. } => f
                .debug_struct("ProviderCallback")
                .field("code", &"<redacted>")
                .field("state", state)
                .finish(),
            Self::RefreshRequest { .. } => f
                .debug_struct("RefreshRequest")
                .field("refresh_token", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(subject: &str) -> Identity {
        Identity::from_claims(Claims::default(), subject, None)
    }

    fn credential(expires_at: Option<i64>) -> Credential {
        Credential::issue("AAA".into(), Some("BBB".into()), expires_at, identity("jdoe"))
    }

    #[test]
    fn identity_prefers_sub_then_net_id_then_fallback() {
        let claims = Claims {
            net_id: Some("abc123".into()),
            ..Claims::default()
        };
        assert_eq!(Identity::from_claims(claims, "x", None).subject_id, "abc123");

        let claims = Claims {
            sub: Some("jdoe".into()),
            net_id: Some("abc123".into()),
            ..Claims::default()
        };
        assert_eq!(Identity::from_claims(claims, "x", None).subject_id, "jdoe");

        assert_eq!(identity("fallback").subject_id, "fallback");
        assert_eq!(identity("fallback").display_name, "fallback");
    }

    #[test]
    fn explicit_privilege_overrides_claim() {
        let claims = Claims {
            issuperuser: Some(true),
            ..Claims::default()
        };
        assert!(Identity::from_claims(claims.clone(), "x", None).is_privileged);
        assert!(!Identity::from_claims(claims, "x", Some(false)).is_privileged);
        assert!(!identity("x").is_privileged);
    }

    #[test]
    fn issue_falls_back_to_exp_claim() {
        let mut id = identity("jdoe");
        id.claims.exp = Some(2_000);
        let cred = Credential::issue("AAA".into(), None, None, id.clone());
        assert_eq!(cred.expires_at, Some(2_000));

        let cred = Credential::issue("AAA".into(), None, Some(3_000), id);
        assert_eq!(cred.expires_at, Some(3_000));
    }

    #[test]
    fn expiry_exactly_now_is_expiring() {
        let cred = credential(Some(1_000));
        assert!(cred.expires_within_at(Duration::zero(), 1_000));
        assert!(!cred.expires_within_at(Duration::zero(), 999));
    }

    #[test]
    fn window_pulls_refresh_forward() {
        let cred = credential(Some(1_000 + 300));
        assert!(cred.expires_within_at(Duration::minutes(5), 1_000));
        assert!(!cred.expires_within_at(Duration::minutes(4), 1_000));
    }

    #[test]
    fn unknown_expiry_is_expiring() {
        assert!(credential(None).expires_within_at(Duration::zero(), 0));
    }

    #[test]
    fn refresh_keeps_refresh_token_and_identity() {
        let old = credential(Some(1_000));
        let fresh = Credential::issue("CCC".into(), None, Some(2_000), identity(""));

        let merged = old.refreshed_with(fresh);
        assert_eq!(merged.access_token, "CCC");
        assert_eq!(merged.refresh_token.as_deref(), Some("BBB"));
        assert_eq!(merged.expires_at, Some(2_000));
        assert_eq!(merged.identity.subject_id, "jdoe");
    }

    #[test]
    fn refresh_never_moves_expiry_backward() {
        let old = credential(Some(5_000));
        let fresh = Credential::issue("CCC".into(), None, Some(4_000), identity(""));
        assert_eq!(old.refreshed_with(fresh).expires_at, Some(5_000));
    }

    #[test]
    fn debug_redacts_secrets() {
        let request = AuthRequest::CredentialLogin {
            subject_id: "jdoe".into(),
            secret: "correct-pw".into(),
        };
        let printed = format!("{request:?}");
        assert!(printed.contains("jdoe"));
        assert!(!printed.contains("correct-pw"));
    }

    #[test]
    fn status_serialization() {
        let json = serde_json::to_string(&SessionStatus::RefreshFailed).unwrap();
        assert_eq!(json, "\"refresh_failed\"");
        assert_eq!(SessionStatus::Authenticated.to_string(), "authenticated");
    }
}
