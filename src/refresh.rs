//! Access token renewal with a single-flight guarantee.

use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::backend::AuthBackend;
use crate::credentials::{CredentialStore, SessionRecord};
use crate::store::SessionStore;
use crate::token;

/// Result of a refresh attempt, shared by every caller that joined it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were stored.
    Refreshed,
    /// The session is gone; the caller should send the user to login.
    LoggedOut,
    /// The session was replaced or cleared while the request was in flight; the
    /// response was discarded and the store reflects the newer writer.
    Superseded,
}

/// Whether `session` should be refreshed at `now`.
///
/// True when a refresh token is present and the access token is missing, invalid,
/// expired, or expires within `horizon`.
#[must_use]
pub fn should_refresh(session: &SessionRecord, now: OffsetDateTime, horizon: Duration) -> bool {
    if session.refresh_token.as_deref().is_none_or(str::is_empty) {
        return false;
    }
    session
        .access_token
        .as_deref()
        .is_none_or(|t| token::inspect_at(t, now, horizon).wants_refresh())
}

/// Coordinates token refreshes so that at most one is in flight.
///
/// Callers arriving while a refresh runs wait for it and receive its outcome instead of
/// issuing their own request. A failed refresh is never retried here.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    flight: Mutex<()>,
    completed: AtomicU64,
    last_outcome: StdMutex<Option<RefreshOutcome>>,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a refresh is running right now.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.flight.try_lock().is_err()
    }

    /// Number of refresh attempts that ran to completion.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Run `attempt` unless another caller's attempt finishes while we wait for the
    /// slot, in which case its outcome is returned.
    pub async fn single_flight<F, Fut>(&self, attempt: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome>,
    {
        let seen = self.completed.load(Ordering::Acquire);
        let _slot = self.flight.lock().await;

        if self.completed.load(Ordering::Acquire) != seen {
            let joined = self.last_outcome.lock().ok().and_then(|last| *last);
            if let Some(outcome) = joined {
                tracing::debug!(?outcome, "Joined in-flight token refresh");
                return outcome;
            }
        }

        let outcome = attempt().await;
        if let Ok(mut last) = self.last_outcome.lock() {
            *last = Some(outcome);
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Exchange the stored refresh token for a new session.
    ///
    /// On success the new tokens replace the stored ones (unless the session changed in
    /// the meantime). On any failure the session is cleared and
    /// [`RefreshOutcome::LoggedOut`] is returned.
    pub async fn refresh<D, E, B>(
        &self,
        credentials: &CredentialStore<D, E>,
        backend: &B,
    ) -> RefreshOutcome
    where
        D: SessionStore,
        E: SessionStore,
        B: AuthBackend,
    {
        self.single_flight(|| exchange(credentials, backend)).await
    }
}

async fn exchange<D, E, B>(credentials: &CredentialStore<D, E>, backend: &B) -> RefreshOutcome
where
    D: SessionStore,
    E: SessionStore,
    B: AuthBackend,
{
    let generation = credentials.generation();

    let session = match credentials.read() {
        Ok(Some(session)) => session,
        Ok(None) => return RefreshOutcome::LoggedOut,
        Err(e) => {
            tracing::error!(error = %e, "Cannot read session for refresh");
            return force_logout(credentials, generation);
        }
    };

    let Some(refresh_token) = session.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
        tracing::info!("No refresh token stored; ending session");
        return force_logout(credentials, generation);
    };

    let tokens = match backend.refresh(refresh_token).await {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!(error = %e, status = ?e.status(), "Token refresh failed; forcing logout");
            return force_logout(credentials, generation);
        }
    };

    let record = SessionRecord::from_tokens(tokens, session.remember_me, OffsetDateTime::now_utc());
    match credentials.save_if_current(generation, &record, session.remember_me) {
        Ok(true) => {
            tracing::info!(remember_me = session.remember_me, "Access token refreshed");
            RefreshOutcome::Refreshed
        }
        Ok(false) => {
            tracing::info!("Session changed during refresh; discarding new tokens");
            RefreshOutcome::Superseded
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to store refreshed tokens");
            force_logout(credentials, generation)
        }
    }
}

fn force_logout<D, E>(credentials: &CredentialStore<D, E>, generation: u64) -> RefreshOutcome
where
    D: SessionStore,
    E: SessionStore,
{
    match credentials.clear_if_current(generation) {
        Ok(true) => RefreshOutcome::LoggedOut,
        Ok(false) => RefreshOutcome::Superseded,
        Err(e) => {
            tracing::error!(error = %e, "Failed to clear session after refresh failure");
            RefreshOutcome::LoggedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::credentials::testing::{memory_credentials, sample_record};
    use crate::token::testing::token_expiring_in;

    #[test]
    fn should_refresh_needs_refresh_token() {
        let now = OffsetDateTime::now_utc();
        let mut record = sample_record(&token_expiring_in(100), true);
        assert!(should_refresh(&record, now, token::REFRESH_HORIZON));

        record.refresh_token = None;
        assert!(!should_refresh(&record, now, token::REFRESH_HORIZON));
    }

    #[test]
    fn should_refresh_on_invalid_or_missing_access_token() {
        let now = OffsetDateTime::now_utc();
        let mut record = sample_record("not-a-token", false);
        assert!(should_refresh(&record, now, token::REFRESH_HORIZON));
        record.access_token = None;
        assert!(should_refresh(&record, now, token::REFRESH_HORIZON));
    }

    #[test]
    fn fresh_token_does_not_need_refresh() {
        let now = OffsetDateTime::now_utc();
        let record = sample_record(&token_expiring_in(3600), false);
        assert!(!should_refresh(&record, now, token::REFRESH_HORIZON));
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_request() {
        let creds = Arc::new(memory_credentials());
        creds.save(&sample_record(&token_expiring_in(100), true), true).unwrap();
        let backend = Arc::new(FakeBackend::new());
        let coordinator = Arc::new(RefreshCoordinator::new());

        let (a, b) = tokio::join!(
            coordinator.refresh(creds.as_ref(), backend.as_ref()),
            coordinator.refresh(creds.as_ref(), backend.as_ref()),
        );

        assert_eq!(a, RefreshOutcome::Refreshed);
        assert_eq!(b, RefreshOutcome::Refreshed);
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(coordinator.completed(), 1);

        let record = creds.read().unwrap().unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("refresh-1-next"));
        assert!(record.remember_me);
        assert!(creds.ephemeral().is_empty());
    }

    #[tokio::test]
    async fn sequential_refreshes_each_call_backend() {
        let creds = memory_credentials();
        creds.save(&sample_record(&token_expiring_in(100), false), false).unwrap();
        let backend = FakeBackend::new();
        let coordinator = RefreshCoordinator::new();

        assert_eq!(coordinator.refresh(&creds, &backend).await, RefreshOutcome::Refreshed);
        assert_eq!(coordinator.refresh(&creds, &backend).await, RefreshOutcome::Refreshed);
        assert_eq!(backend.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn failure_clears_session() {
        let creds = memory_credentials();
        creds.save(&sample_record(&token_expiring_in(100), true), true).unwrap();
        let backend = FakeBackend::failing_refresh();
        let coordinator = RefreshCoordinator::new();

        let outcome = coordinator.refresh(&creds, &backend).await;

        assert_eq!(outcome, RefreshOutcome::LoggedOut);
        assert_eq!(creds.read().unwrap(), None);
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_logs_out_without_request() {
        let creds = memory_credentials();
        let mut record = sample_record(&token_expiring_in(-10), false);
        record.refresh_token = None;
        creds.save(&record, false).unwrap();
        let backend = FakeBackend::new();

        let outcome = RefreshCoordinator::new().refresh(&creds, &backend).await;

        assert_eq!(outcome, RefreshOutcome::LoggedOut);
        assert_eq!(backend.refresh_calls(), 0);
        assert_eq!(creds.read().unwrap(), None);
    }

    #[tokio::test]
    async fn logout_during_refresh_is_not_undone() {
        let creds = Arc::new(memory_credentials());
        creds.save(&sample_record(&token_expiring_in(100), true), true).unwrap();
        let backend = FakeBackend::new();
        let coordinator = RefreshCoordinator::new();

        let clear_midway = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            creds.clear().unwrap();
        };
        let (outcome, ()) = tokio::join!(coordinator.refresh(creds.as_ref(), &backend), clear_midway);

        assert_eq!(outcome, RefreshOutcome::Superseded);
        assert_eq!(creds.read().unwrap(), None);
        assert_eq!(creds.cookies().value(), None);
    }

    #[tokio::test]
    async fn single_flight_runs_attempt_once_per_wave() {
        let coordinator = RefreshCoordinator::new();
        let counter = AtomicUsize::new(0);
        let runs = &counter;
        let attempt = move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            RefreshOutcome::LoggedOut
        };

        let (a, b, c) = tokio::join!(
            coordinator.single_flight(attempt),
            coordinator.single_flight(attempt),
            coordinator.single_flight(attempt),
        );

        assert_eq!((a, b, c), (RefreshOutcome::LoggedOut, RefreshOutcome::LoggedOut, RefreshOutcome::LoggedOut));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!coordinator.in_flight());
    }
}
