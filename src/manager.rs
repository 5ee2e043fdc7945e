//! Session lifecycle: the one object the host application holds on to.

use std::future::Future;
use std::sync::{Arc, Mutex};

use cookie::Cookie;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::activity::{ActivityTracker, InteractionKind, is_within_inactivity_window};
use crate::backend::AuthBackend;
use crate::config::SessionConfig;
use crate::cookies::CookieMirror;
use crate::credentials::{CredentialStore, SessionRecord};
use crate::error::Error;
use crate::guard::{GuardDecision, GuardMachine, GuardState, RouteKind, decide};
use crate::refresh::{RefreshCoordinator, RefreshOutcome, should_refresh};
use crate::store::SessionStore;
use crate::token;
use crate::types::{
    ActiveSession, LoginRequest, PasswordChange, ProfileUpdate, RegisterRequest, SecurityInfo,
    SessionId, UserProfile,
};

struct Inner<D, E, B> {
    config: SessionConfig,
    credentials: CredentialStore<D, E>,
    backend: B,
    coordinator: RefreshCoordinator,
    activity: ActivityTracker,
    machine: GuardMachine,
}

/// Owns the credential store, refresh coordinator, activity tracker and guard state
/// for one client context.
///
/// Create one per browser tab / client, call [`init`](Self::init) once, and
/// [`dispose`](Self::dispose) when done. Dropping the manager also stops its
/// background check.
///
/// Client-side checks only decode tokens; the API re-validates every request.
///
/// # Example
///
/// ```rust,ignore
/// let config = SessionConfig::from_env()?;
/// let manager = SessionManager::new(
///     config.clone(),
///     FileStore::new("session.json"),
///     MemoryStore::new(),
///     ApiClient::new(config),
/// );
/// manager.init().await;
///
/// match manager.guard("/dashboard").await {
///     GuardDecision::RedirectToLogin(url) => redirect(url),
///     _ => render(),
/// }
/// ```
pub struct SessionManager<D, E, B> {
    inner: Arc<Inner<D, E, B>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<D, E, B> SessionManager<D, E, B>
where
    D: SessionStore,
    E: SessionStore,
    B: AuthBackend,
{
    pub fn new(config: SessionConfig, durable: D, ephemeral: E, backend: B) -> Self {
        let cookies = CookieMirror::new(config.cookie_name(), config.secure_cookies());
        let inner = Inner {
            credentials: CredentialStore::new(durable, ephemeral, cookies),
            backend,
            coordinator: RefreshCoordinator::new(),
            activity: ActivityTracker::new(config.touch_throttle()),
            machine: GuardMachine::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
            ticker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore<D, E> {
        &self.inner.credentials
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Restore the stored session and start the periodic validity check.
    ///
    /// Moves the guard to `Loading`, then to `Authenticated`, `Unauthenticated` or
    /// `LoggedOut`. Calling it again restarts the check task.
    pub async fn init(&self) -> GuardState {
        self.inner.machine.transition(GuardState::Loading);
        let state = self.inner.evaluate().await;

        if state == GuardState::Authenticated && self.user().is_none() {
            if let Err(e) = self.fetch_user().await {
                tracing::warn!(error = %e, "Could not refetch user during init");
            }
        }

        self.start_ticker();
        let state = self.inner.machine.state();
        tracing::info!(?state, "Session manager initialized");
        state
    }

    fn start_ticker(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime; periodic session check disabled");
            return;
        };
        let inner = Arc::clone(&self.inner);
        let period = inner.config.refresh_interval();
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                inner.periodic_check().await;
            }
        });

        let mut ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = ticker.replace(task) {
            previous.abort();
        }
    }

    /// Stop the periodic check. The stored session is left alone.
    pub fn dispose(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = ticker.take() {
            task.abort();
            tracing::debug!("Session manager disposed");
        }
    }

    /// Whether the periodic check task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .map(|t| t.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn state(&self) -> GuardState {
        self.inner.machine.state()
    }

    /// Watch guard state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<GuardState> {
        self.inner.machine.subscribe()
    }

    /// Whether a usable access token is stored.
    ///
    /// Decodes the token without verifying it. Inactivity is enforced by
    /// [`check_token_validity`](Self::check_token_validity), not here.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        match self.inner.credentials.read() {
            Ok(Some(session)) => session
                .access_token
                .as_deref()
                .is_some_and(token::is_token_valid),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read session");
                false
            }
        }
    }

    /// Cached user profile.
    #[must_use]
    pub fn user(&self) -> Option<UserProfile> {
        self.inner
            .credentials
            .read()
            .ok()
            .flatten()
            .and_then(|session| session.user)
    }

    /// Drain `Set-Cookie` values for the token mirror, for hosts that render responses.
    pub fn take_cookies(&self) -> Vec<Cookie<'static>> {
        self.inner.credentials.cookies().take_pending()
    }

    /// Sign in and store the session in the store picked by `remember_me`.
    ///
    /// # Errors
    ///
    /// Returns the API error (state unchanged) or [`Error::Store`] if the session could
    /// not be saved.
    pub async fn login(&self, request: LoginRequest) -> Result<UserProfile, Error> {
        let remember_me = request.remember_me;
        let tokens = self.inner.backend.login(&request).await.inspect_err(|e| {
            tracing::info!(error = %e, status = ?e.status(), "Login rejected");
        })?;

        let user = tokens.user.clone();
        let record = SessionRecord::from_tokens(tokens, remember_me, OffsetDateTime::now_utc());
        self.inner.credentials.save(&record, remember_me)?;
        self.inner.activity.reset();
        self.inner.machine.settle(GuardState::Authenticated);

        tracing::info!(user_id = %user.id, remember_me, "Logged in");
        Ok(user)
    }

    /// Where to navigate after [`login`](Self::login), given the `redirect` parameter.
    #[must_use]
    pub fn login_target(&self, redirect: Option<&str>) -> String {
        self.inner.config.routes().post_login_target(redirect)
    }

    /// Create an account. No tokens are issued; the user is kept as an unauthenticated
    /// record until they sign in.
    ///
    /// # Errors
    ///
    /// Returns the API error or [`Error::Store`].
    pub async fn register(&self, request: RegisterRequest) -> Result<UserProfile, Error> {
        let user = self.inner.backend.register(&request).await?;
        self.inner
            .credentials
            .save(&SessionRecord::user_only(user.clone()), false)?;
        tracing::info!(user_id = %user.id, "Registered");
        Ok(user)
    }

    /// End the session locally, then revoke the refresh token server side.
    ///
    /// The server call is best effort: its failure is logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the local session could not be fully removed.
    pub async fn logout(&self) -> Result<(), Error> {
        let session = self.inner.credentials.read().ok().flatten();
        let cleared = self.inner.end_session();
        self.inner.machine.settle(GuardState::LoggedOut);

        if let Some(SessionRecord {
            access_token: Some(access),
            refresh_token: Some(refresh),
            ..
        }) = session
        {
            if let Err(e) = self.inner.backend.logout(&access, &refresh).await {
                tracing::warn!(error = %e, "Server logout failed; local session already cleared");
            }
        }

        tracing::info!("Logged out");
        cleared.map_err(Into::into)
    }

    /// Revoke every session of the user, then end this one locally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] without a stored token, otherwise the API
    /// error. The local session is cleared either way.
    pub async fn logout_all(&self) -> Result<(), Error> {
        let access = self.inner.access_token()?;
        let result = self.inner.backend.logout_all(&access).await;
        let cleared = self.inner.end_session();
        self.inner.machine.settle(GuardState::LoggedOut);
        result?;
        tracing::info!("Logged out of all sessions");
        cleared.map_err(Into::into)
    }

    /// Change the password. The server revokes all refresh tokens, so the local session
    /// ends and the user signs in again.
    ///
    /// # Errors
    ///
    /// Returns the API error with the session untouched.
    pub async fn change_password(&self, change: PasswordChange) -> Result<(), Error> {
        let backend = &self.inner.backend;
        let change = &change;
        self.inner
            .authorized(move |token| async move { backend.change_password(&token, change).await })
            .await?;
        let cleared = self.inner.end_session();
        self.inner.machine.settle(GuardState::LoggedOut);
        tracing::info!("Password changed; session ended");
        cleared.map_err(Into::into)
    }

    /// Refetch the user from `GET /auth/me` and update the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionCleared`] if the session ended while recovering from a
    /// rejected token, or the API error.
    pub async fn fetch_user(&self) -> Result<UserProfile, Error> {
        let backend = &self.inner.backend;
        let user = self
            .inner
            .authorized(move |token| async move { backend.current_user(&token).await })
            .await?;
        self.inner.credentials.update_user(&user)?;
        Ok(user)
    }

    /// Update the profile via `PATCH /auth/me` and cache the result.
    ///
    /// # Errors
    ///
    /// See [`fetch_user`](Self::fetch_user).
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserProfile, Error> {
        let backend = &self.inner.backend;
        let update = &update;
        let user = self
            .inner
            .authorized(move |token| async move { backend.update_user(&token, update).await })
            .await?;
        self.inner.credentials.update_user(&user)?;
        Ok(user)
    }

    /// Sessions of this user that the server still honours (`GET /auth/sessions`).
    ///
    /// # Errors
    ///
    /// See [`fetch_user`](Self::fetch_user).
    pub async fn sessions(&self) -> Result<Vec<ActiveSession>, Error> {
        let backend = &self.inner.backend;
        self.inner
            .authorized(move |token| async move { backend.sessions(&token).await })
            .await
    }

    /// Revoke one server-side session, typically another device. The local session is
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns the API error (404 for an unknown or already revoked id), or see
    /// [`fetch_user`](Self::fetch_user).
    pub async fn revoke_session(&self, session: SessionId) -> Result<(), Error> {
        let backend = &self.inner.backend;
        self.inner
            .authorized(move |token| async move { backend.revoke_session(&token, session).await })
            .await?;
        tracing::info!(session_id = %session, "Revoked session");
        Ok(())
    }

    /// Account security overview (`GET /auth/security`).
    ///
    /// # Errors
    ///
    /// See [`fetch_user`](Self::fetch_user).
    pub async fn security_info(&self) -> Result<SecurityInfo, Error> {
        let backend = &self.inner.backend;
        self.inner
            .authorized(move |token| async move { backend.security_info(&token).await })
            .await
    }

    /// Re-evaluate the stored session: log out when inactive or unusable, refresh when
    /// near expiry. Returns whether the session survived.
    pub async fn check_token_validity(&self) -> bool {
        self.inner.evaluate().await == GuardState::Authenticated
    }

    /// Refresh the access token now. Concurrent calls share one request.
    pub async fn refresh_auth_token(&self) -> RefreshOutcome {
        self.inner.refresh().await
    }

    /// Note a user interaction. Persists the timestamp at most once per throttle period;
    /// returns whether it was written.
    pub fn record_interaction(&self, kind: InteractionKind) -> bool {
        let now = OffsetDateTime::now_utc();
        if !self.inner.activity.should_record(now) {
            return false;
        }
        match self.inner.credentials.touch(now) {
            Ok(written) => {
                tracing::trace!(?kind, written, "Recorded interaction");
                written
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record interaction");
                false
            }
        }
    }

    /// Guard decision for the current state, without side effects.
    #[must_use]
    pub fn decide(&self, path: &str) -> GuardDecision {
        decide(self.inner.config.routes(), self.inner.machine.state(), path)
    }

    /// Guard a navigation to `path`.
    ///
    /// Protected routes re-check the session first, which may refresh the token or end
    /// the session.
    pub async fn guard(&self, path: &str) -> GuardDecision {
        let routes = self.inner.config.routes();
        if routes.classify(path) == RouteKind::Protected
            && self.inner.machine.state() == GuardState::Authenticated
        {
            self.inner.evaluate().await;
        }
        let decision = self.decide(path);
        tracing::debug!(path, ?decision, "Guard decision");
        decision
    }
}

impl<D, E, B> Drop for SessionManager<D, E, B> {
    fn drop(&mut self) {
        if let Ok(mut ticker) = self.ticker.lock() {
            if let Some(task) = ticker.take() {
                task.abort();
            }
        }
    }
}

#[cfg(feature = "client")]
impl<D: SessionStore, E: SessionStore> SessionManager<D, E, crate::ApiClient> {
    /// Manager talking to the HTTP API described by `config`.
    pub fn with_api_client(config: SessionConfig, durable: D, ephemeral: E) -> Self {
        let client = crate::ApiClient::new(config.clone());
        Self::new(config, durable, ephemeral, client)
    }
}

impl<D, E, B> Inner<D, E, B>
where
    D: SessionStore,
    E: SessionStore,
    B: AuthBackend,
{
    async fn periodic_check(&self) {
        if self.machine.state() != GuardState::Authenticated {
            return;
        }
        let state = self.evaluate().await;
        if state != GuardState::Authenticated {
            tracing::info!(?state, "Periodic check ended the session");
        }
    }

    /// Apply the session rules to the stored record and settle the guard state.
    async fn evaluate(&self) -> GuardState {
        let now = OffsetDateTime::now_utc();
        let session = match self.credentials.read() {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Unreadable session; clearing");
                let _ = self.end_session();
                return self.settle(self.signed_out_state());
            }
        };

        let Some(session) = session.filter(|s| s.has_access_token() || s.refresh_token.is_some())
        else {
            return self.settle(self.signed_out_state());
        };

        if !is_within_inactivity_window(session.last_activity, session.remember_me, now) {
            tracing::info!(
                remember_me = session.remember_me,
                last_activity = ?session.last_activity,
                "Session inactive; logging out"
            );
            let _ = self.end_session();
            return self.settle(GuardState::LoggedOut);
        }

        let horizon = self.config.refresh_horizon();
        if should_refresh(&session, now, horizon) {
            self.refresh().await;
            return self.machine.state();
        }

        let usable = session
            .access_token
            .as_deref()
            .is_some_and(|t| token::inspect_at(t, now, horizon).is_usable());
        if usable {
            self.settle(GuardState::Authenticated)
        } else {
            tracing::info!("Access token unusable and no refresh token; clearing");
            let _ = self.end_session();
            self.settle(self.signed_out_state())
        }
    }

    async fn refresh(&self) -> RefreshOutcome {
        if self.machine.state() == GuardState::Authenticated {
            self.machine.transition(GuardState::Refreshing);
        }
        let outcome = self.coordinator.refresh(&self.credentials, &self.backend).await;

        let next = match outcome {
            RefreshOutcome::Refreshed => GuardState::Authenticated,
            RefreshOutcome::LoggedOut => {
                self.activity.reset();
                GuardState::LoggedOut
            }
            // someone else wrote the store; follow what they left behind
            RefreshOutcome::Superseded => {
                let live = self
                    .credentials
                    .read()
                    .ok()
                    .flatten()
                    .is_some_and(|s| s.has_access_token());
                if live { GuardState::Authenticated } else { GuardState::LoggedOut }
            }
        };
        self.machine.settle(next);
        outcome
    }

    fn settle(&self, next: GuardState) -> GuardState {
        self.machine.settle(next);
        self.machine.state()
    }

    fn signed_out_state(&self) -> GuardState {
        match self.machine.state() {
            GuardState::Authenticated | GuardState::Refreshing | GuardState::LoggedOut => {
                GuardState::LoggedOut
            }
            _ => GuardState::Unauthenticated,
        }
    }

    fn end_session(&self) -> Result<(), crate::store::StoreError> {
        self.activity.reset();
        self.credentials.clear().inspect_err(|e| {
            tracing::error!(error = %e, "Failed to clear session");
        })
    }

    fn access_token(&self) -> Result<String, Error> {
        self.credentials
            .read()?
            .and_then(|s| s.access_token)
            .ok_or(Error::Unauthenticated)
    }

    /// Run `call` with a fresh access token, refreshing first when the token is near
    /// expiry and once more if the API rejects it with 401.
    async fn authorized<T, F, Fut>(&self, call: F) -> Result<T, Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let session = self.credentials.read()?.ok_or(Error::Unauthenticated)?;
        if !session.has_access_token() && session.refresh_token.is_none() {
            return Err(Error::Unauthenticated);
        }
        if should_refresh(&session, OffsetDateTime::now_utc(), self.config.refresh_horizon()) {
            self.refreshed_or_cleared().await?;
        }

        match call(self.access_token()?).await {
            Err(e) if e.status() == Some(401) => {
                tracing::info!("Access token rejected; refreshing once");
                self.refreshed_or_cleared().await?;
                call(self.access_token()?).await
            }
            result => result,
        }
    }

    async fn refreshed_or_cleared(&self) -> Result<(), Error> {
        match self.refresh().await {
            RefreshOutcome::Refreshed => Ok(()),
            RefreshOutcome::Superseded if self.machine.state() == GuardState::Authenticated => {
                Ok(())
            }
            _ => Err(Error::SessionCleared),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::testing::{FakeBackend, sample_sessions};
    use crate::credentials::testing::{sample_record, sample_user};
    use crate::store::{FileStore, MemoryStore};
    use crate::token::testing::token_expiring_in;

    type TestManager = SessionManager<MemoryStore, MemoryStore, FakeBackend>;

    fn config() -> SessionConfig {
        SessionConfig::new("http://api.test/api/v1/".parse().unwrap()).with_secure_cookies(false)
    }

    fn manager_with(backend: FakeBackend) -> TestManager {
        SessionManager::new(config(), MemoryStore::new(), MemoryStore::new(), backend)
    }

    fn manager() -> TestManager {
        manager_with(FakeBackend::new())
    }

    fn active_record(access_token: &str, remember_me: bool) -> SessionRecord {
        SessionRecord {
            last_activity: Some(OffsetDateTime::now_utc()),
            ..sample_record(access_token, remember_me)
        }
    }

    #[tokio::test]
    async fn init_without_session_is_unauthenticated() {
        let manager = manager();
        let mut rx = manager.subscribe();

        assert_eq!(manager.init().await, GuardState::Unauthenticated);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), GuardState::Unauthenticated);
        assert!(manager.is_running());

        manager.dispose();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn init_restores_active_session() {
        let manager = manager();
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();

        assert_eq!(manager.init().await, GuardState::Authenticated);
        assert!(manager.is_authenticated());
        assert_eq!(manager.user(), Some(sample_user()));
        assert_eq!(manager.backend().refresh_calls(), 0);
        manager.dispose();
    }

    #[tokio::test]
    async fn login_without_remember_me_stays_ephemeral() {
        let manager = manager();
        manager.init().await;

        let user = manager
            .login(LoginRequest::new("Ada@Example.com", "secret", false))
            .await
            .unwrap();

        assert_eq!(user, sample_user());
        assert_eq!(manager.state(), GuardState::Authenticated);
        assert!(manager.is_authenticated());
        assert!(manager.credentials().durable().is_empty());

        // closing the tab drops the ephemeral store
        manager.credentials().ephemeral().clear_all();
        assert!(!manager.is_authenticated());
        assert!(!manager.check_token_validity().await);
        assert_eq!(manager.state(), GuardState::LoggedOut);
        assert!(manager.credentials().durable().is_empty());
        manager.dispose();
    }

    #[tokio::test]
    async fn failed_login_leaves_state_alone() {
        let manager = manager();
        manager.init().await;

        let err = manager
            .login(LoginRequest::new("ada@example.com", "wrong", true))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(manager.state(), GuardState::Unauthenticated);
        assert_eq!(manager.credentials().read().unwrap(), None);
        manager.dispose();
    }

    #[tokio::test]
    async fn near_expiry_refreshes_once_for_concurrent_callers() {
        let manager = manager();
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(100), true), true)
            .unwrap();

        let (a, b) = tokio::join!(manager.refresh_auth_token(), manager.refresh_auth_token());

        assert_eq!((a, b), (RefreshOutcome::Refreshed, RefreshOutcome::Refreshed));
        assert_eq!(manager.backend().refresh_calls(), 1);
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn refresh_failure_logs_out_and_redirects() {
        let manager = manager_with(FakeBackend::failing_refresh());
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(100), false), false)
            .unwrap();
        manager.init().await;

        assert_eq!(manager.state(), GuardState::LoggedOut);
        assert_eq!(manager.credentials().read().unwrap(), None);
        assert_eq!(
            manager.guard("/dashboard").await,
            GuardDecision::RedirectToLogin("/login?redirect=/dashboard".into())
        );
        manager.dispose();
    }

    #[tokio::test]
    async fn missing_activity_forces_logout() {
        let manager = manager();
        let record = SessionRecord {
            last_activity: None,
            ..sample_record(&token_expiring_in(3600), true)
        };
        manager.credentials().save(&record, true).unwrap();
        assert!(manager.is_authenticated());

        assert!(!manager.check_token_validity().await);

        assert!(!manager.is_authenticated());
        assert_eq!(manager.credentials().read().unwrap(), None);
        assert_eq!(manager.backend().refresh_calls(), 0);
    }

    #[tokio::test]
    async fn stale_activity_forces_logout() {
        let manager = manager();
        let record = SessionRecord {
            last_activity: Some(OffsetDateTime::now_utc() - time::Duration::days(3)),
            ..sample_record(&token_expiring_in(3600), false)
        };
        manager.credentials().save(&record, false).unwrap();

        assert_eq!(manager.init().await, GuardState::LoggedOut);
        manager.dispose();
    }

    #[tokio::test]
    async fn logout_clears_even_when_server_fails() {
        let backend = FakeBackend::new();
        backend.fail_logout.store(true, Ordering::SeqCst);
        let manager = manager_with(backend);
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();
        manager.init().await;

        manager.logout().await.unwrap();

        assert_eq!(manager.state(), GuardState::LoggedOut);
        assert_eq!(manager.credentials().read().unwrap(), None);
        assert_eq!(manager.backend().logout_calls.load(Ordering::SeqCst), 1);
        let cookies = manager.take_cookies();
        assert!(cookies.iter().any(|c| c.value().is_empty()));
        manager.dispose();
    }

    #[tokio::test]
    async fn logout_all_requires_session() {
        let manager = manager();
        assert!(matches!(manager.logout_all().await, Err(Error::Unauthenticated)));

        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();
        manager.logout_all().await.unwrap();
        assert_eq!(manager.backend().logout_all_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.credentials().read().unwrap(), None);
    }

    #[tokio::test]
    async fn change_password_ends_session_only_on_success() {
        let manager = manager();
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();

        let err = manager
            .change_password(PasswordChange::new("wrong", "n3w-secret"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(manager.is_authenticated());

        manager
            .change_password(PasswordChange::new("secret", "n3w-secret"))
            .await
            .unwrap();
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn register_keeps_user_without_login() {
        let manager = manager();
        manager.init().await;

        let user = manager
            .register(RegisterRequest::new("grace@example.com", "grace", "hunter22"))
            .await
            .unwrap();

        assert_eq!(user.email, "grace@example.com");
        assert_eq!(manager.user(), Some(user));
        assert!(!manager.is_authenticated());
        assert_eq!(manager.state(), GuardState::Unauthenticated);
        manager.dispose();
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_and_retried() {
        let manager = manager();
        let access = token_expiring_in(3600);
        manager
            .credentials()
            .save(&active_record(&access, true), true)
            .unwrap();
        manager.backend().revoke(&access);

        let user = manager.fetch_user().await.unwrap();

        assert_eq!(user, sample_user());
        assert_eq!(manager.backend().refresh_calls(), 1);
        let stored = manager.credentials().read().unwrap().unwrap();
        assert_ne!(stored.access_token.as_deref(), Some(access.as_str()));
    }

    #[tokio::test]
    async fn update_profile_caches_result() {
        let manager = manager();
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), false), false)
            .unwrap();

        let update = ProfileUpdate {
            full_name: Some("Augusta Ada King".into()),
            ..ProfileUpdate::default()
        };
        let user = manager.update_profile(update).await.unwrap();

        assert_eq!(user.full_name.as_deref(), Some("Augusta Ada King"));
        assert_eq!(manager.user(), Some(user));
    }

    #[tokio::test]
    async fn interactions_are_throttled() {
        let manager = manager();
        assert!(!manager.record_interaction(InteractionKind::Click));

        manager
            .credentials()
            .save(&sample_record(&token_expiring_in(3600), true), true)
            .unwrap();
        manager.inner.activity.reset();

        assert!(manager.record_interaction(InteractionKind::PointerMove));
        assert!(!manager.record_interaction(InteractionKind::Scroll));

        let recorded = manager.credentials().read().unwrap().unwrap().last_activity;
        assert!(recorded.is_some_and(|at| OffsetDateTime::now_utc() - at < time::Duration::minutes(1)));
    }

    #[tokio::test]
    async fn guard_bounces_signed_in_user_from_login() {
        let manager = manager();
        manager.init().await;
        assert_eq!(manager.decide("/dashboard"), GuardDecision::RedirectToLogin("/login?redirect=/dashboard".into()));

        manager
            .login(LoginRequest::new("ada@example.com", "secret", true))
            .await
            .unwrap();

        assert_eq!(manager.guard("/dashboard").await, GuardDecision::Render);
        assert_eq!(
            manager.guard("/login?redirect=/dashboard").await,
            GuardDecision::Redirect("/dashboard".into())
        );
        assert_eq!(manager.login_target(Some("/dashboard")), "/dashboard");
        manager.dispose();
    }

    #[tokio::test]
    async fn uninitialized_guard_shows_placeholder() {
        let manager = manager();
        assert_eq!(manager.guard("/dashboard").await, GuardDecision::Placeholder);
        assert_eq!(manager.guard("/").await, GuardDecision::Render);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_check_refreshes_near_expiry() {
        let manager = manager();
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();
        manager.init().await;

        // replace with a token about to expire, as if time had passed
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(60), true), true)
            .unwrap();
        tokio::time::sleep(manager.config().refresh_interval() + std::time::Duration::from_secs(1))
            .await;

        assert_eq!(manager.backend().refresh_calls(), 1);
        assert_eq!(manager.state(), GuardState::Authenticated);
        manager.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_manager_stops_periodic_checks() {
        let manager = manager();
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();
        manager.init().await;
        manager.dispose();

        manager
            .credentials()
            .save(&active_record(&token_expiring_in(60), true), true)
            .unwrap();
        tokio::time::sleep(manager.config().refresh_interval() * 3).await;

        assert_eq!(manager.backend().refresh_calls(), 0);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn refresh_passes_through_refreshing_state() {
        let manager = manager();
        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();
        manager.init().await;
        let mut rx = manager.subscribe();
        assert_eq!(*rx.borrow_and_update(), GuardState::Authenticated);

        let observe = async {
            rx.changed().await.unwrap();
            let mid = *rx.borrow_and_update();
            (mid, manager.decide("/dashboard"))
        };
        let (outcome, (mid, decision)) = tokio::join!(manager.refresh_auth_token(), observe);

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(mid, GuardState::Refreshing);
        assert_eq!(decision, GuardDecision::Refreshing);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), GuardState::Authenticated);
        assert_eq!(manager.decide("/dashboard"), GuardDecision::Render);
        manager.dispose();
    }

    #[tokio::test]
    async fn corrupt_durable_file_does_not_block_login_or_logout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{not json").unwrap();
        let manager = SessionManager::new(
            config(),
            FileStore::new(&path),
            MemoryStore::new(),
            FakeBackend::new(),
        );
        assert_eq!(manager.init().await, GuardState::Unauthenticated);

        manager
            .login(LoginRequest::new("ada@example.com", "secret", false))
            .await
            .unwrap();
        assert!(manager.is_authenticated());
        manager.logout().await.unwrap();
        assert!(!manager.is_authenticated());

        manager
            .login(LoginRequest::new("ada@example.com", "secret", true))
            .await
            .unwrap();
        let reopened = FileStore::new(&path);
        assert!(reopened.get("access_token").unwrap().is_some());
        manager.dispose();
    }

    #[tokio::test]
    async fn lists_and_revokes_server_sessions() {
        let manager = manager();
        assert!(matches!(manager.sessions().await, Err(Error::Unauthenticated)));

        manager
            .credentials()
            .save(&active_record(&token_expiring_in(3600), true), true)
            .unwrap();
        let sessions = manager.sessions().await.unwrap();
        assert_eq!(sessions, sample_sessions());

        manager.revoke_session(sessions[1].id).await.unwrap();
        assert_eq!(manager.sessions().await.unwrap().len(), 1);

        let err = manager.revoke_session(sessions[1].id).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn security_info_retries_after_rejected_token() {
        let manager = manager();
        let access = token_expiring_in(3600);
        manager
            .credentials()
            .save(&active_record(&access, false), false)
            .unwrap();
        manager.backend().revoke(&access);

        let info = manager.security_info().await.unwrap();

        assert_eq!(info.active_sessions, 2);
        assert!(!info.is_locked_at(OffsetDateTime::now_utc()));
        assert_eq!(manager.backend().refresh_calls(), 1);
    }
}
