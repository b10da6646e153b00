//! Session and token lifecycle for MedPASS.
//!
//! This crate obtains, stores, validates, refreshes and invalidates the
//! credential a MedPASS client uses against the API, and gates protected
//! routes on the resulting session status. Two sign-in strategies feed the
//! same controller:
//!
//! - **Credential login**: username/password against `POST /auth/login`.
//! - **Provider login**: Google authorization code with PKCE, then account
//!   linking through `POST /auth/google/link`.
//!
//! # Architecture
//!
//! ```text
//! Session (controller, single writer)
//! ├── TokenExchanger      (HTTP exchanges; HttpExchanger)
//! ├── CredentialStore     (watch-backed register, read/subscribe)
//! ├── ProviderRedirect    (single-use expiring state tokens)
//! └── SessionPersistence  (refresh token + identity; VaultPersistence)
//! RouteGuard              (navigation decisions from SessionStatus)
//! CallbackListener        (loopback redirect receiver)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use medpass_auth::{AuthConfig, AuthRequest, NoPersistence, Session};
//!
//! # async fn example() -> medpass_auth::Result<()> {
//! let config = AuthConfig::from_env()?;
//! let session = Session::from_config(config, Arc::new(NoPersistence::default()))?;
//!
//! let destination = session
//!     .login(AuthRequest::CredentialLogin {
//!         subject_id: "jdoe".to_string(),
//!         secret: "correct-pw".to_string(),
//!     })
//!     .await?;
//! let token = session.access_token().await?;
//! # let _ = (destination, token);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod claims;
pub mod config;
pub mod credential;
pub mod error;
pub mod exchange;
pub mod guard;
pub mod oauth;
pub mod persistence;
pub mod redirect;
pub mod session;
pub mod store;

pub use callback::{CallbackListener, CallbackParams};
pub use claims::Claims;
pub use config::{AuthConfig, ProviderConfig};
pub use credential::{AuthRequest, Credential, Identity, SessionStatus};
pub use error::{AuthError, Result};
pub use exchange::{HttpExchanger, TokenExchanger};
pub use guard::{GuardConfig, GuardDecision, RouteGuard};
pub use persistence::{NoPersistence, PersistedSession, SessionPersistence, VaultPersistence};
pub use redirect::{ProviderRedirect, RedirectTicket};
pub use session::Session;
pub use store::CredentialStore;
