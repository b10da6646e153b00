//! Typed JWT payload decoding.
//!
//! The session core never verifies signatures; the API does that on every
//! request. Claims are read only to learn the subject, display name,
//! privilege flag and expiry of a token the API just handed out.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Result};

/// Decoded token payload.
///
/// Well-known fields are typed; anything else the issuer adds is kept in
/// `extra` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identifier (the MedPASS username or NetID).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Expiry, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Issued-at, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<String>,

    /// Administrator flag as issued by the MedPASS API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuperuser: Option<bool>,

    /// Remaining claims, opaque to the session core.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// Decode the payload segment of a compact JWT (`header.payload.sig`).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedToken`] if the token does not have three
    /// segments, the payload is not base64url, or it is not a JSON object.
    pub fn decode(token: &str) -> Result<Self> {
        let mut segments = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuthError::MalformedToken {
                reason: "expected three dot-separated segments".to_string(),
            });
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::MalformedToken {
                reason: format!("payload is not base64url: {e}"),
            })?;

        serde_json::from_slice(&bytes).map_err(|e| AuthError::MalformedToken {
            reason: format!("payload is not a claims object: {e}"),
        })
    }

    /// Decode, returning `None` instead of an error. Opaque tokens are
    /// legitimate; callers decide what a missing payload means.
    pub fn try_decode(token: &str) -> Option<Self> {
        match Self::decode(token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                tracing::debug!(error = %e, "token payload not decodable");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an unsigned compact JWT carrying `payload`.
    pub(crate) fn jwt(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    #[test]
    fn decodes_typed_fields() {
        let token = jwt(serde_json::json!({
            "sub": "jdoe",
            "exp": 1_900_000_000,
            "iat": 1_899_996_400,
            "name": "Jane Doe",
            "issuperuser": true
        }));

        let claims = Claims::decode(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("jdoe"));
        assert_eq!(claims.exp, Some(1_900_000_000));
        assert_eq!(claims.iat, Some(1_899_996_400));
        assert_eq!(claims.name.as_deref(), Some("Jane Doe"));
        assert_eq!(claims.issuperuser, Some(true));
        assert!(claims.extra.is_empty());
    }

    #[test]
    fn keeps_unknown_claims() {
        let token = jwt(serde_json::json!({"sub": "jdoe", "cohort": 2027}));
        let claims = Claims::decode(&token).unwrap();
        assert_eq!(claims.extra.get("cohort"), Some(&serde_json::json!(2027)));
    }

    #[test]
    fn accepts_padded_payload() {
        let token = jwt(serde_json::json!({"sub": "a"}));
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        parts[1].push_str("==");
        let padded = parts.join(".");
        assert_eq!(Claims::decode(&padded).unwrap().sub.as_deref(), Some("a"));
    }

    #[test]
    fn rejects_opaque_token() {
        let err = Claims::decode("AAA").unwrap_err();
        assert!(matches!(err, AuthError::MalformedToken { .. }));
        assert!(Claims::try_decode("AAA").is_none());
    }

    #[test]
    fn rejects_non_json_payload() {
        let payload = URL_SAFE_NO_PAD.encode(b"not json");
        let err = Claims::decode(&format!("h.{payload}.s")).unwrap_err();
        assert!(err.to_string().contains("not a claims object"));
    }

    #[test]
    fn rejects_too_many_segments() {
        assert!(Claims::decode("a.b.c.d").is_err());
    }
}
