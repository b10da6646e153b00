//! Identity-provider authorization code flow with PKCE.
//!
//! Covers the provider side of Google sign-in: building the authorization
//! URL and trading the returned code for provider tokens. Linking those
//! tokens to a MedPASS account is the exchanger's job.
//!
//! # Flow Overview
//!
//! 1. Generate a PKCE code verifier and its S256 challenge.
//! 2. Send the user to [`authorization_url`] with an opaque `state`.
//! 3. Receive `code` + `state` on the redirect URI.
//! 4. [`ProviderFlow::exchange_code`] with the original verifier.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use url::Url;

use crate::config::ProviderConfig;
use crate::error::{AuthError, Result};

/// Length of the PKCE code verifier in bytes (before base64 encoding).
const PKCE_VERIFIER_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

/// Tokens returned by the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    /// OpenID Connect identity token; carries the verified e-mail.
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl ProviderTokens {
    /// The token the MedPASS link endpoint should verify: the identity token
    /// when present, otherwise the access token.
    pub fn link_token(&self) -> &str {
        self.id_token.as_deref().unwrap_or(&self.access_token)
    }
}

/// Raw error response from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// PKCE helpers
// ---------------------------------------------------------------------------

/// Generate a PKCE code verifier (random 32 bytes, base64url encoded).
///
/// # Errors
///
/// Returns an error if the system CSPRNG fails.
pub fn generate_pkce_verifier() -> Result<String> {
    let mut bytes = [0u8; PKCE_VERIFIER_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| AuthError::ProviderError {
            reason: "failed to generate PKCE verifier: CSPRNG error".to_string(),
        })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Build the authorization URL the user should be sent to.
///
/// # Errors
///
/// Returns [`AuthError::UrlParse`] if `auth_url` is not a valid URL.
pub fn authorization_url(config: &ProviderConfig, state: &str, code_challenge: &str) -> Result<String> {
    let mut url = Url::parse(&config.auth_url)?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair("client_id", &config.client_id);
        params.append_pair("redirect_uri", &config.redirect_uri);
        params.append_pair("state", state);
        params.append_pair("code_challenge", code_challenge);
        params.append_pair("code_challenge_method", "S256");

        if !config.scopes.is_empty() {
            params.append_pair("scope", &config.scopes.join(" "));
        }
    }

    Ok(url.to_string())
}

// ---------------------------------------------------------------------------
// Code exchange
// ---------------------------------------------------------------------------

/// Trades authorization codes for provider tokens.
pub struct ProviderFlow {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl ProviderFlow {
    pub fn new(config: ProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Exchange an authorization code for provider tokens.
    ///
    /// `code_verifier` must be the verifier whose challenge went into the
    /// authorization URL.
    ///
    /// # Errors
    ///
    /// [`AuthError::ProviderLinkError`] if the provider rejects the code,
    /// [`AuthError::NetworkError`] on transport failure.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<ProviderTokens> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        tracing::debug!(token_url = %self.config.token_url, "exchanging provider authorization code");

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => err.error_description.unwrap_or(err.error),
                Err(_) => format!("HTTP {status}: {body}"),
            };
            return Err(AuthError::ProviderLinkError { reason });
        }

        let tokens: ProviderTokens =
            serde_json::from_str(&body).map_err(|e| AuthError::ProviderLinkError {
                reason: format!("malformed provider token response: {e}"),
            })?;

        if tokens.access_token.is_empty() {
            return Err(AuthError::ProviderLinkError {
                reason: "provider returned an empty access token".to_string(),
            });
        }

        tracing::debug!("provider code exchange successful");
        Ok(tokens)
    }
}
