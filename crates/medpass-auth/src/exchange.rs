//! Token exchanges against the MedPASS API.
//!
//! [`TokenExchanger`] is the seam between the session controller and the
//! network: one async method per [`AuthRequest`](crate::AuthRequest)
//! variant, each returning a complete [`Credential`] or a typed failure.
//! [`HttpExchanger`] implements it over `reqwest`.
//!
//! Every method is cancel-safe: dropping the future abandons the request
//! and nothing outside the future has been touched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::claims::Claims;
use crate::config::AuthConfig;
use crate::credential::{Credential, Identity};
use crate::error::{AuthError, Result};
use crate::oauth::ProviderFlow;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Turns sign-in inputs into credentials.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Username/password login.
    ///
    /// Fails with `InvalidCredentials`, `NetworkError` or `ProviderError`.
    async fn exchange_credentials(&self, subject_id: &str, secret: &str) -> Result<Credential>;

    /// Identity-provider code exchange followed by account linking.
    ///
    /// Fails with `ProviderLinkError` or `NetworkError`.
    async fn exchange_provider_callback(&self, code: &str, code_verifier: &str)
    -> Result<Credential>;

    /// Trade a refresh token for a new access token.
    ///
    /// An expected rejection is `RefreshExpired`; transport failure is
    /// `NetworkError`.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// `POST /auth/login` success body.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    issuperuser: Option<bool>,
}

/// `POST /auth/refresh` success body.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// `POST /auth/google/link` request body.
#[derive(Debug, Serialize)]
struct LinkRequest<'a> {
    google_token: &'a str,
    email: &'a str,
}

/// `POST /auth/google/link` success body.
#[derive(Debug, Deserialize)]
struct LinkResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    net_id: Option<String>,
    #[serde(default)]
    student_data: Option<serde_json::Value>,
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// [`TokenExchanger`] backed by the MedPASS HTTP API.
pub struct HttpExchanger {
    api_base_url: String,
    client: reqwest::Client,
    provider: ProviderFlow,
}

impl HttpExchanger {
    /// Build an exchanger with a client using the configured timeout.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidConfig`] if the HTTP client cannot be built.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(concat!("medpass/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuthError::InvalidConfig {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            provider: ProviderFlow::new(config.provider.clone(), client.clone()),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    /// Call the link endpoint. Any failure other than transport is a link
    /// failure.
    async fn link_account(&self, google_token: &str, email: &str) -> Result<Credential> {
        let response = self
            .client
            .post(self.endpoint("/auth/google/link"))
            .json(&LinkRequest {
                google_token,
                email,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::ProviderLinkError {
                reason: format!("link endpoint returned HTTP {status}: {body}"),
            });
        }

        let link: LinkResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::ProviderLinkError {
                reason: format!("malformed link response: {e}"),
            })?;

        let access_token =
            non_empty(link.access_token).ok_or_else(|| AuthError::ProviderLinkError {
                reason: "link response has no access token".to_string(),
            })?;
        let net_id = link
            .net_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthError::ProviderLinkError {
                reason: "link response has no net_id".to_string(),
            })?;

        let claims = Claims::try_decode(&access_token).unwrap_or_default();
        let mut identity = Identity::from_claims(claims, &net_id, None);
        identity.subject_id = net_id;
        if let Some(name) = link
            .student_data
            .as_ref()
            .and_then(|d| d.get("name"))
            .and_then(|n| n.as_str())
        {
            identity.display_name = name.to_string();
        } else if identity.display_name == identity.subject_id {
            identity.display_name = email.to_string();
        }
        identity.profile = link.student_data;

        Ok(Credential::issue(
            access_token,
            non_empty(link.refresh_token),
            None,
            identity,
        ))
    }
}

#[async_trait]
impl TokenExchanger for HttpExchanger {
    async fn exchange_credentials(&self, subject_id: &str, secret: &str) -> Result<Credential> {
        if subject_id.trim().is_empty() || secret.is_empty() {
            return Err(AuthError::InvalidCredentials {
                reason: "username and password are required".to_string(),
            });
        }

        tracing::debug!(subject = subject_id, "exchanging credentials");

        let response = self
            .client
            .post(self.endpoint("/auth/login"))
            .form(&[("username", subject_id), ("password", secret)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::InvalidCredentials {
                reason: format!("login rejected with HTTP {status}"),
            });
        }

        let body = response.text().await?;
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| AuthError::ProviderError {
                reason: format!("login response is not JSON: {e}"),
            })?;
        let login: LoginResponse =
            serde_json::from_value(value).map_err(|e| AuthError::InvalidCredentials {
                reason: format!("login response is missing token fields: {e}"),
            })?;

        let access_token =
            non_empty(login.access_token).ok_or_else(|| AuthError::InvalidCredentials {
                reason: "login response has no access token".to_string(),
            })?;

        let claims = Claims::try_decode(&access_token).unwrap_or_default();
        let identity = Identity::from_claims(claims, subject_id.trim(), login.issuperuser);

        tracing::info!(subject = %identity.subject_id, "credential login accepted");
        Ok(Credential::issue(
            access_token,
            non_empty(login.refresh_token),
            None,
            identity,
        ))
    }

    async fn exchange_provider_callback(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<Credential> {
        let tokens = self.provider.exchange_code(code, code_verifier).await?;

        let email = tokens
            .id_token
            .as_deref()
            .and_then(Claims::try_decode)
            .and_then(|c| c.email)
            .ok_or_else(|| AuthError::ProviderLinkError {
                reason: "provider did not return an e-mail address".to_string(),
            })?;

        tracing::debug!("provider code accepted, linking account");
        let credential = self.link_account(tokens.link_token(), &email).await?;

        tracing::info!(subject = %credential.identity.subject_id, "provider account linked");
        Ok(credential)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        if refresh_token.is_empty() {
            return Err(AuthError::RefreshExpired {
                reason: "no refresh token".to_string(),
            });
        }

        let response = self
            .client
            .post(self.endpoint("/auth/refresh"))
            .bearer_auth(refresh_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::RefreshExpired {
                reason: format!("refresh rejected with HTTP {status}"),
            });
        }

        let body = response.text().await?;
        let refreshed: RefreshResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::RefreshExpired {
                reason: format!("malformed refresh response: {e}"),
            })?;
        let access_token =
            non_empty(refreshed.access_token).ok_or_else(|| AuthError::RefreshExpired {
                reason: "refresh response has no access token".to_string(),
            })?;

        let claims = Claims::try_decode(&access_token).unwrap_or_default();
        let identity = Identity::from_claims(claims, "", None);

        tracing::debug!("access token refreshed");
        Ok(Credential::issue(
            access_token,
            Some(refresh_token.to_string()),
            refreshed.exp,
            identity,
        ))
    }
}
