//! Error types for the session core.
//!
//! Every operation in this crate reports failures through [`AuthError`].
//! The first four variants are the sign-in taxonomy the views care about;
//! [`AuthError::user_message`] turns any variant into the text a login form
//! or banner should show.

/// Unified error type for the MedPASS session core.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The API rejected the username/password, or a field was empty.
    #[error("invalid credentials: {reason}")]
    InvalidCredentials {
        /// What was wrong with the submitted credentials.
        reason: String,
    },

    /// An HTTP request could not be completed (connect, timeout, body read).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The refresh token was rejected; the user has to sign in again.
    #[error("refresh token expired: {reason}")]
    RefreshExpired {
        /// Why the refresh was rejected.
        reason: String,
    },

    /// Linking the identity-provider account to a MedPASS subject failed.
    #[error("provider link failed: {reason}")]
    ProviderLinkError {
        /// Raw provider or link-endpoint failure. Logged, never shown.
        reason: String,
    },

    /// The API answered with something that is not a token response.
    #[error("unexpected response from authentication service: {reason}")]
    ProviderError {
        /// Description of the malformed response.
        reason: String,
    },

    /// The redirect state returned by the identity provider is unknown,
    /// already consumed, or expired.
    #[error("invalid or expired sign-in state")]
    InvalidState,

    /// A refresh this caller waited on failed without signing out.
    #[error("refresh unavailable: {reason}")]
    RefreshUnavailable {
        /// The failure reported by the refresh that was shared.
        reason: String,
    },

    /// Another login or refresh holds the session.
    #[error("another authentication operation is already in progress")]
    OperationInProgress,

    /// The operation was superseded by a logout or an explicit cancel.
    #[error("authentication operation was canceled")]
    Canceled,

    /// An access token was requested while no credential is held.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A token could not be decoded as a JWT.
    #[error("malformed token: {reason}")]
    MalformedToken {
        /// What failed while decoding.
        reason: String,
    },

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The local callback listener gave up waiting for the redirect.
    #[error("callback timed out after {timeout_secs} seconds")]
    CallbackTimeout {
        /// How long we waited.
        timeout_secs: u64,
    },

    /// The redirect reached the callback listener but was unusable.
    #[error("callback failed: {reason}")]
    CallbackFailed {
        /// Why the callback request was rejected.
        reason: String,
    },

    /// An error from the local session cache.
    #[error("session cache error: {0}")]
    Vault(#[from] medpass_vault::VaultError),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (e.g. from the callback TCP listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    /// Human-readable text for the view layer.
    ///
    /// Provider failures collapse into one generic sentence; their details
    /// only go to the log.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials { .. } => "Invalid username or password.",
            Self::NetworkError(_) | Self::Io(_) | Self::RefreshUnavailable { .. } => {
                "Could not reach the MedPASS server. Please try again."
            }
            Self::RefreshExpired { .. } | Self::NotAuthenticated => {
                "Your session has expired. Please sign in again."
            }
            Self::OperationInProgress => "A sign-in is already in progress.",
            Self::Canceled => "Sign-in was canceled.",
            Self::ProviderLinkError { .. }
            | Self::ProviderError { .. }
            | Self::InvalidState
            | Self::MalformedToken { .. }
            | Self::CallbackTimeout { .. }
            | Self::CallbackFailed { .. } => "Could not complete sign-in.",
            Self::InvalidConfig { .. }
            | Self::Vault(_)
            | Self::Serialization(_)
            | Self::UrlParse(_) => "Sign-in is unavailable right now.",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::Io(_)
                | Self::RefreshUnavailable { .. }
                | Self::OperationInProgress
        )
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;
