//! Session controller.
//!
//! [`Session`] is the single owner of the credential lifecycle. Every
//! mutation of the [`CredentialStore`] goes through it, and it publishes the
//! resulting [`SessionStatus`] to subscribers.
//!
//! # Concurrency
//!
//! Logins and refreshes are serialized by one operation lock:
//!
//! - a login while anything is in flight fails with
//!   [`AuthError::OperationInProgress`];
//! - a refresh while another refresh is in flight waits and reuses that
//!   result instead of calling the network again;
//! - a refresh while a login is in flight fails with
//!   [`AuthError::OperationInProgress`].
//!
//! Login, logout and [`Session::cancel_pending`] bump a session epoch. An
//! exchange commits only if the epoch it started under is still current,
//! and an in-flight exchange is abandoned as soon as the epoch moves.
//! Dropping a `login` future has the same effect as canceling it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};

use crate::config::AuthConfig;
use crate::credential::{AuthRequest, Credential, SessionStatus};
use crate::error::{AuthError, Result};
use crate::exchange::{HttpExchanger, TokenExchanger};
use crate::guard::{GuardDecision, RouteGuard};
use crate::persistence::{NET_ID_VERIFIED_FLAG, PersistedSession, SessionPersistence};
use crate::redirect::{ProviderRedirect, RedirectTicket};
use crate::store::CredentialStore;

/// Capacity of the status transition channel.
const TRANSITION_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Login,
    Refresh,
}

/// Bookkeeping guarded by a short-lived synchronous lock. Never held
/// across an await point.
#[derive(Debug, Default)]
struct Inner {
    in_flight: Option<OpKind>,
    destination: Option<String>,
    message: Option<&'static str>,
    /// Why the most recent refresh failed, for callers that shared it.
    refresh_failure: Option<String>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The authentication session of one user agent.
///
/// Construct one per process and share it (typically behind an `Arc`).
pub struct Session {
    config: AuthConfig,
    exchanger: Arc<dyn TokenExchanger>,
    persistence: Arc<dyn SessionPersistence>,
    redirect: ProviderRedirect,
    store: CredentialStore,
    status: watch::Sender<SessionStatus>,
    transitions: broadcast::Sender<SessionStatus>,
    epoch: watch::Sender<u64>,
    refresh_generation: AtomicU64,
    op_lock: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl Session {
    /// Create an unauthenticated session.
    pub fn new(
        config: AuthConfig,
        exchanger: Arc<dyn TokenExchanger>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Unauthenticated);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (epoch, _) = watch::channel(0);

        Self {
            redirect: ProviderRedirect::new(config.provider.clone(), config.state_ttl()),
            config,
            exchanger,
            persistence,
            store: CredentialStore::new(),
            status,
            transitions,
            epoch,
            refresh_generation: AtomicU64::new(0),
            op_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a session talking HTTP to the configured MedPASS API.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidConfig`] if the configuration does not validate.
    pub fn from_config(
        config: AuthConfig,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Result<Self> {
        config.validate()?;
        let exchanger = Arc::new(HttpExchanger::new(&config)?);
        Ok(Self::new(config, exchanger, persistence))
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    // -- Observation --------------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Latest status. Intermediate values may be coalesced; use
    /// [`subscribe_transitions`](Self::subscribe_transitions) to see each one.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Every status change, in order, including the transient
    /// [`SessionStatus::RefreshFailed`].
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SessionStatus> {
        self.transitions.subscribe()
    }

    /// Read-only handle to the credential register.
    pub fn credentials(&self) -> CredentialStore {
        self.store.clone()
    }

    /// User-facing text for the most recent failure, cleared on success.
    pub fn message(&self) -> Option<&'static str> {
        self.inner().message
    }

    // -- Login --------------------------------------------------------------

    /// Phase 1 of provider sign-in. The returned URL must be opened by the
    /// user; the callback it produces goes to [`login`](Self::login) as an
    /// [`AuthRequest::ProviderCallback`].
    pub fn begin_provider_login(&self, return_path: Option<&str>) -> Result<RedirectTicket> {
        self.redirect.begin(return_path)
    }

    /// Sign in and return the path to resume at.
    ///
    /// The destination is the provider redirect's return path, else the
    /// remembered destination, else the configured home page.
    ///
    /// # Errors
    ///
    /// The exchange failure for the request kind, [`AuthError::InvalidState`]
    /// for a bad provider callback, [`AuthError::OperationInProgress`] if
    /// another operation holds the session, [`AuthError::Canceled`] if the
    /// attempt was superseded.
    pub async fn login(&self, request: AuthRequest) -> Result<String> {
        let _op = self.try_begin_login()?;

        let kind = request.kind();
        let (verifier, return_path) = match &request {
            AuthRequest::ProviderCallback { state, .. } => {
                let validated = self.redirect.validate(state)?;
                (Some(validated.code_verifier), validated.return_path)
            }
            _ => (None, None),
        };

        let attempt = self.start_attempt();
        tracing::info!(kind, "sign-in started");

        let result = match (&request, verifier.as_deref()) {
            (AuthRequest::CredentialLogin { subject_id, secret }, _) => {
                self.supervised(
                    attempt.epoch,
                    self.exchanger.exchange_credentials(subject_id, secret),
                )
                .await
            }
            (AuthRequest::ProviderCallback { code, .. }, Some(verifier)) => {
                self.supervised(
                    attempt.epoch,
                    self.exchanger.exchange_provider_callback(code, verifier),
                )
                .await
            }
            (AuthRequest::ProviderCallback { .. }, None) => Err(AuthError::InvalidState),
            (AuthRequest::RefreshRequest { refresh_token }, _) => {
                self.supervised(attempt.epoch, self.exchanger.refresh(refresh_token))
                    .await
            }
        };

        self.finish_attempt(attempt, result, None)?;

        let remembered = self.take_destination();
        Ok(return_path
            .or(remembered)
            .unwrap_or_else(|| self.config.guard.home_path.clone()))
    }

    /// Rebuild the session from persisted state, if any.
    ///
    /// Returns `Ok(true)` when a session was restored. A rejected refresh
    /// token forgets the persisted state and returns `Ok(false)`.
    pub async fn restore(&self) -> Result<bool> {
        let persisted = match self.persistence.load() {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!(error = %e, "cached session unreadable, starting signed out");
                self.forget_persisted();
                return Ok(false);
            }
        };

        let _op = self.try_begin_login()?;
        let attempt = self.start_attempt();
        tracing::info!(subject = %persisted.identity.subject_id, "restoring cached session");

        let result = self
            .supervised(
                attempt.epoch,
                self.exchanger.refresh(&persisted.refresh_token),
            )
            .await;

        let base = Credential::issue(
            String::new(),
            Some(persisted.refresh_token),
            None,
            persisted.identity,
        );
        match self.finish_attempt(attempt, result, Some(base)) {
            Ok(()) => Ok(true),
            Err(AuthError::RefreshExpired { reason }) => {
                tracing::info!(%reason, "cached session expired");
                self.forget_persisted();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // -- Access -------------------------------------------------------------

    /// A usable access token, refreshed first if it is within the
    /// near-expiry window.
    ///
    /// When the refresh fails transiently and the current token has not
    /// actually expired yet, the current token is returned.
    pub async fn access_token(&self) -> Result<String> {
        let current = self.store.get().ok_or(AuthError::NotAuthenticated)?;
        if !current.expires_within(self.config.refresh_window()) {
            return Ok(current.access_token);
        }

        if let Err(e) = self.refresh_shared(false).await {
            if e.is_transient() && !current.expires_within(chrono::Duration::zero()) {
                tracing::warn!(error = %e, "refresh failed, using the current token");
                return Ok(current.access_token);
            }
            return Err(e);
        }

        self.store.access_token().ok_or(AuthError::NotAuthenticated)
    }

    /// Refresh the access token now.
    ///
    /// Concurrent callers share one network call.
    ///
    /// # Errors
    ///
    /// [`AuthError::RefreshExpired`] signs the session out;
    /// [`AuthError::NetworkError`] leaves the credential untouched.
    pub async fn refresh(&self) -> Result<()> {
        self.refresh_shared(true).await
    }

    async fn refresh_shared(&self, force: bool) -> Result<()> {
        let observed = self.refresh_generation.load(Ordering::Acquire);
        let busy = self.inner().in_flight;
        if busy == Some(OpKind::Login) {
            return Err(AuthError::OperationInProgress);
        }

        let _op = self.begin_refresh().await;

        if self.refresh_generation.load(Ordering::Acquire) != observed {
            tracing::debug!("refresh finished while waiting, reusing its result");
            if self.store.is_empty() {
                return Err(AuthError::NotAuthenticated);
            }
            let failure = self.inner().refresh_failure.clone();
            return match failure {
                Some(reason) => Err(AuthError::RefreshUnavailable { reason }),
                None => Ok(()),
            };
        }

        let current = self.store.get().ok_or(AuthError::NotAuthenticated)?;
        if !force && !current.expires_within(self.config.refresh_window()) {
            return Ok(());
        }

        let epoch = *self.epoch.borrow();
        let result = match current.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => self.supervised(epoch, self.exchanger.refresh(token)).await,
            None => Err(AuthError::RefreshExpired {
                reason: "credential has no refresh token".to_string(),
            }),
        };
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);

        let mut inner = self.inner();
        let outcome = if *self.epoch.borrow() != epoch {
            tracing::debug!("discarding refresh result from a previous session");
            Err(AuthError::Canceled)
        } else {
            self.commit_refresh(&mut inner, &current, result)
        };
        inner.refresh_failure = outcome.as_ref().err().map(ToString::to_string);
        outcome
    }

    fn commit_refresh(
        &self,
        inner: &mut Inner,
        current: &Credential,
        result: Result<Credential>,
    ) -> Result<()> {
        match result {
            Ok(fresh) => {
                let refreshed = current.refreshed_with(fresh);
                self.store.set(refreshed.clone());
                self.persist(Some(current.identity.subject_id.as_str()), &refreshed);
                inner.message = None;
                tracing::debug!(expires_at = ?refreshed.expires_at, "session refreshed");
                Ok(())
            }
            Err(e @ AuthError::RefreshExpired { .. }) => {
                tracing::warn!(error = %e, "refresh token rejected, signing out");
                self.set_status(SessionStatus::RefreshFailed);
                self.store.clear();
                self.forget_persisted();
                self.set_status(SessionStatus::Unauthenticated);
                inner.message = Some(e.user_message());
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "refresh failed, keeping current credential");
                inner.message = Some(e.user_message());
                Err(e)
            }
        }
    }

    // -- Teardown -----------------------------------------------------------

    /// Sign out. Any in-flight exchange is abandoned.
    pub fn logout(&self) {
        let mut inner = self.inner();
        self.bump_epoch();
        self.store.clear();
        self.forget_persisted();
        inner.destination = None;
        inner.message = None;
        self.set_status(SessionStatus::Unauthenticated);
        tracing::info!("signed out");
    }

    /// Abandon the in-flight login or refresh, if any. Its result will not
    /// be committed. Returns whether anything was canceled.
    pub fn cancel_pending(&self) -> bool {
        let inner = self.inner();
        let Some(kind) = inner.in_flight else {
            return false;
        };

        self.bump_epoch();
        if self.status() == SessionStatus::Authenticating {
            self.set_status(self.resting_status());
        }
        tracing::info!(?kind, "pending operation canceled");
        true
    }

    // -- Navigation ---------------------------------------------------------

    /// Remember where to go after the next successful login.
    pub fn remember_destination(&self, path: impl Into<String>) {
        self.inner().destination = Some(path.into());
    }

    pub fn take_destination(&self) -> Option<String> {
        self.inner().destination.take()
    }

    /// Run `guard` against the current status. A login redirect also
    /// remembers the requested path.
    pub fn check_route(&self, guard: &RouteGuard, path: &str) -> GuardDecision {
        let decision = guard.decide(path, self.status());
        if let GuardDecision::RedirectToLogin { return_path } = &decision {
            self.remember_destination(return_path.clone());
        }
        decision
    }

    // -- NetID verification -------------------------------------------------

    /// Record that the signed-in user confirmed their NetID.
    pub fn mark_net_id_verified(&self) -> Result<()> {
        if self.store.is_empty() {
            return Err(AuthError::NotAuthenticated);
        }
        self.persistence.set_flag(NET_ID_VERIFIED_FLAG, true)?;
        tracing::info!("netid verified");
        Ok(())
    }

    pub fn net_id_verified(&self) -> Result<bool> {
        self.persistence.flag(NET_ID_VERIFIED_FLAG)
    }

    // -- Internals ----------------------------------------------------------

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_begin_login(&self) -> Result<OpGuard<'_>> {
        let lock = self
            .op_lock
            .try_lock()
            .map_err(|_| AuthError::OperationInProgress)?;
        self.inner().in_flight = Some(OpKind::Login);
        Ok(OpGuard {
            session: self,
            _lock: lock,
        })
    }

    async fn begin_refresh(&self) -> OpGuard<'_> {
        let lock = self.op_lock.lock().await;
        self.inner().in_flight = Some(OpKind::Refresh);
        OpGuard {
            session: self,
            _lock: lock,
        }
    }

    /// Bump the epoch and enter `Authenticating`.
    fn start_attempt(&self) -> Attempt<'_> {
        let _inner = self.inner();
        let epoch = self.bump_epoch();
        let resting = self.resting_status();
        self.set_status(SessionStatus::Authenticating);
        Attempt {
            session: self,
            epoch,
            resting,
            settled: false,
        }
    }

    /// Commit or roll back a login attempt.
    fn finish_attempt(
        &self,
        mut attempt: Attempt<'_>,
        result: Result<Credential>,
        base: Option<Credential>,
    ) -> Result<()> {
        attempt.settled = true;
        let mut inner = self.inner();

        if *self.epoch.borrow() != attempt.epoch {
            tracing::debug!("discarding superseded sign-in result");
            return Err(AuthError::Canceled);
        }

        match result {
            Ok(credential) => {
                let credential = match base {
                    Some(base) => base.refreshed_with(credential),
                    None => credential,
                };
                let subject = credential.identity.subject_id.clone();
                let previous = self.store.get().map(|c| c.identity.subject_id);
                self.store.set(credential.clone());
                self.persist(previous.as_deref(), &credential);
                inner.message = None;
                self.set_status(SessionStatus::Authenticated);
                tracing::info!(subject = %subject, "signed in");
                Ok(())
            }
            Err(e) => {
                match &e {
                    AuthError::ProviderLinkError { reason } | AuthError::ProviderError { reason } => {
                        tracing::error!(%reason, "provider sign-in failed");
                    }
                    other => tracing::warn!(error = %other, "sign-in failed"),
                }
                inner.message = Some(e.user_message());
                self.set_status(attempt.resting);
                Err(e)
            }
        }
    }

    /// Run `exchange` until it finishes or the epoch moves past `epoch`.
    async fn supervised<F>(&self, epoch: u64, exchange: F) -> Result<Credential>
    where
        F: Future<Output = Result<Credential>>,
    {
        let mut epochs = self.epoch.subscribe();
        tokio::select! {
            result = exchange => result,
            _ = epochs.wait_for(|current| *current != epoch) => Err(AuthError::Canceled),
        }
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.send_modify(|e| *e += 1);
        *self.epoch.borrow()
    }

    fn resting_status(&self) -> SessionStatus {
        if self.store.is_empty() {
            SessionStatus::Unauthenticated
        } else {
            SessionStatus::Authenticated
        }
    }

    fn set_status(&self, next: SessionStatus) {
        let previous = self.status.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "session status changed");
            // No receivers is fine.
            let _ = self.transitions.send(next);
        }
    }

    /// Cache `credential` in place of whatever was cached before.
    ///
    /// `previous` is the subject held in memory before this commit. The
    /// NetID flag survives only if the credential belongs to that subject,
    /// or to the cached one when nothing was held.
    fn persist(&self, previous: Option<&str>, credential: &Credential) {
        let subject = credential.identity.subject_id.as_str();
        let owner = match previous {
            Some(previous) => Some(previous.to_string()),
            None => self.cached_subject(),
        };
        if owner.as_deref() != Some(subject) {
            if let Err(e) = self.persistence.set_flag(NET_ID_VERIFIED_FLAG, false) {
                tracing::warn!(error = %e, "failed to reset netid flag");
            }
        }

        let Some(persisted) = PersistedSession::from_credential(credential) else {
            tracing::debug!("credential has no refresh token, dropping cached session");
            self.forget_persisted();
            return;
        };
        if let Err(e) = self.persistence.save(&persisted) {
            tracing::warn!(error = %e, "failed to cache session");
        }
    }

    fn cached_subject(&self) -> Option<String> {
        match self.persistence.load() {
            Ok(cached) => cached.map(|c| c.identity.subject_id),
            Err(e) => {
                tracing::warn!(error = %e, "cached session unreadable");
                None
            }
        }
    }

    fn forget_persisted(&self) {
        if let Err(e) = self.persistence.clear() {
            tracing::warn!(error = %e, "failed to clear cached session");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Holds the operation lock and clears the in-flight marker on release.
struct OpGuard<'a> {
    session: &'a Session,
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.session.inner().in_flight = None;
    }
}

/// A login attempt in the `Authenticating` state. Dropped unsettled, it
/// puts the status back where it was.
struct Attempt<'a> {
    session: &'a Session,
    epoch: u64,
    resting: SessionStatus,
    settled: bool,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let session = self.session;
        let _inner = session.inner();
        if *session.epoch.borrow() == self.epoch
            && session.status() == SessionStatus::Authenticating
        {
            tracing::info!("sign-in abandoned");
            session.set_status(self.resting);
        }
    }
}
