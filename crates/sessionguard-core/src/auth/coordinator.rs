//! Single-flight credential refresh.
//!
//! At most one refresh call per session epoch is outstanding at any time.
//! Callers that find the credential stale while a refresh is running join its
//! waiter set and get the same outcome. Login and logout start a new epoch:
//! a refresh still running for the old one is detached, its waiters are
//! released at once and its result is dropped when it settles. The decision to refresh and the `Refreshing` transition
//! happen under one lock with no await in between, and settling (store write
//! plus draining the waiter set) happens under that same lock, so a caller
//! arriving after settle sees the new credential or starts the next cycle.
//!
//! The refresh runs on its own task: callers that give up waiting do not
//! cancel it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::claims::Credential;
use super::credentials::CredentialStore;
use super::expiry::{self, Freshness};
use super::session::{SessionEvent, SessionState, TerminationHook, TerminationReason};
use crate::api::{ApiError, AuthBackend};
use crate::error::SessionError;

type Waiter = oneshot::Sender<Result<Credential, SessionError>>;

/// Why a refresh attempt did not produce a usable credential.
#[derive(Error, Debug)]
enum RefreshFailure {
    #[error("refresh call failed: {0}")]
    Api(#[from] ApiError),

    #[error("refresh call timed out after {0:?}")]
    Timeout(Duration),

    #[error("refresh returned a credential that is already expired")]
    Unusable,

    #[error("refresh call panicked")]
    Panicked,
}

/// The outstanding refresh of the current epoch and its waiters, in arrival order.
struct InFlight {
    epoch: u64,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct CoordinatorState {
    /// `Some` exactly while a refresh of the current epoch is in flight.
    in_flight: Option<InFlight>,
    /// Bumped by login and by every termination; a refresh that settles in a
    /// different epoch must not touch the store.
    epoch: u64,
    terminated: bool,
}

impl CoordinatorState {
    /// Start a new epoch, detaching any outstanding refresh. Its waiters are
    /// returned so the caller can resolve them once the lock is released.
    fn advance_epoch(&mut self) -> Vec<Waiter> {
        self.epoch += 1;
        self.in_flight
            .take()
            .map(|flight| flight.waiters)
            .unwrap_or_default()
    }

    fn refreshing(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|flight| flight.epoch == self.epoch)
    }
}

/// Resolve detached waiters outside the state lock; `None` resolves them as
/// terminated.
fn release(waiters: Vec<Waiter>, outcome: Option<Credential>) {
    if !waiters.is_empty() {
        debug!(waiters = waiters.len(), "Releasing waiters of a detached refresh");
    }
    for waiter in waiters {
        // Waiters that stopped listening are simply skipped.
        let _ = waiter.send(outcome.clone().ok_or(SessionError::SessionTerminated));
    }
}

struct Inner {
    store: Arc<CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    hook: Arc<TerminationHook>,
    threshold: chrono::Duration,
    timeout: Duration,
    state: Mutex<CoordinatorState>,
}

/// Clone is cheap; clones share one waiter set and state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        backend: Arc<dyn AuthBackend>,
        hook: Arc<TerminationHook>,
        threshold: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                backend,
                hook,
                threshold,
                timeout,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    /// A credential that is neither expired nor expiring soon, refreshing
    /// first if needed.
    pub async fn ensure_fresh(&self) -> Result<Credential, SessionError> {
        self.acquire(None).await
    }

    /// Refresh after the server refused `rejected`, bypassing the freshness
    /// fast path. If the store already holds a different credential, another
    /// caller has refreshed in the meantime and that credential is reused.
    pub async fn refresh_rejected(&self, rejected: &Credential) -> Result<Credential, SessionError> {
        self.acquire(Some(rejected.token())).await
    }

    async fn acquire(&self, rejected: Option<&str>) -> Result<Credential, SessionError> {
        let receiver = {
            let mut state = self.inner.lock_state();
            let epoch = state.epoch;
            match state.in_flight.as_mut().filter(|flight| flight.epoch == epoch) {
                Some(flight) => {
                    let (tx, rx) = oneshot::channel();
                    flight.waiters.push(tx);
                    debug!(waiters = flight.waiters.len(), "Joining in-flight refresh");
                    rx
                }
                None => {
                    let Some(current) = self.inner.store.get() else {
                        return Err(SessionError::SessionTerminated);
                    };
                    let forced = rejected == Some(current.token());
                    let freshness =
                        expiry::evaluate(current.claims(), Utc::now(), self.inner.threshold);
                    if !forced && freshness == Freshness::Valid {
                        return Ok(current);
                    }

                    let (tx, rx) = oneshot::channel();
                    state.in_flight = Some(InFlight {
                        epoch,
                        waiters: vec![tx],
                    });
                    info!(?freshness, forced, "Starting credential refresh");
                    self.spawn_refresh(current, epoch);
                    rx
                }
            }
        };

        // A dropped sender means the refresh task died before settling.
        receiver
            .await
            .unwrap_or(Err(SessionError::SessionTerminated))
    }

    fn spawn_refresh(&self, current: Credential, epoch: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(inner.refresh_call(&current))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(RefreshFailure::Panicked),
            };

            if let Some(credential) = inner.settle(epoch, outcome) {
                inner.sync_capabilities(&credential).await;
            }
        });
    }

    /// Install a credential obtained by signing in.
    ///
    /// A refresh still running for the previous session is detached; its
    /// waiters receive the new credential if it is fresh.
    pub fn install(&self, credential: Credential) {
        let detached = {
            let mut state = self.inner.lock_state();
            let detached = state.advance_epoch();
            state.terminated = false;
            self.inner.store.set(credential.clone());
            detached
        };
        let fresh = expiry::evaluate(credential.claims(), Utc::now(), self.inner.threshold)
            == Freshness::Valid;
        release(detached, Some(credential).filter(|_| fresh));
    }

    /// Fetch supplementary capabilities for the current credential, if the
    /// backend offers them.
    pub async fn sync_capabilities(&self) {
        if let Some(current) = self.inner.store.get() {
            self.inner.sync_capabilities(&current).await;
        }
    }

    /// End the session: clear the store and notify collaborators.
    ///
    /// Returns `false` (and notifies nobody) when there was no live session,
    /// which makes repeated calls harmless.
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        self.terminate_where(reason, |_| true)
    }

    /// Terminate only if `rejected` is still the stored credential.
    pub fn terminate_rejected(&self, rejected: &Credential) -> bool {
        self.terminate_where(TerminationReason::CredentialRejected, |current| {
            current.map(Credential::token) == Some(rejected.token())
        })
    }

    fn terminate_where<F>(&self, reason: TerminationReason, applies: F) -> bool
    where
        F: FnOnce(Option<&Credential>) -> bool,
    {
        let mut state = self.inner.lock_state();
        let current = self.inner.store.get();
        if !applies(current.as_ref()) {
            debug!(?reason, "Session already replaced, not terminating");
            return false;
        }

        let live = !state.terminated && (state.refreshing() || current.is_some());
        let detached = state.advance_epoch();
        self.inner.store.clear();
        if live {
            state.terminated = true;
        }
        drop(state);

        release(detached, None);
        if !live {
            return false;
        }
        self.inner.hook.fire(reason);
        true
    }

    pub fn state(&self) -> SessionState {
        let state = self.inner.lock_state();
        if state.refreshing() {
            return SessionState::Refreshing;
        }
        match self.inner.store.get() {
            Some(current) => {
                match expiry::evaluate(current.claims(), Utc::now(), self.inner.threshold) {
                    Freshness::Valid => SessionState::Active,
                    Freshness::ExpiringSoon => SessionState::ExpiringSoon,
                    Freshness::Expired => SessionState::Expired,
                }
            }
            None if state.terminated => SessionState::Terminated,
            None => SessionState::Anonymous,
        }
    }

    pub fn threshold(&self) -> chrono::Duration {
        self.inner.threshold
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh_call(&self, current: &Credential) -> Result<Credential, RefreshFailure> {
        let token = tokio::time::timeout(self.timeout, self.backend.refresh(current))
            .await
            .map_err(|_| RefreshFailure::Timeout(self.timeout))??;

        let credential = Credential::new(token);
        match expiry::evaluate(credential.claims(), Utc::now(), self.threshold) {
            Freshness::Expired => return Err(RefreshFailure::Unusable),
            Freshness::ExpiringSoon => warn!(
                threshold_secs = self.threshold.num_seconds(),
                "Refreshed credential already expires within the threshold; \
                 every request will refresh until the threshold is lowered"
            ),
            Freshness::Valid => {}
        }
        Ok(credential)
    }

    /// Record the outcome, drain every waiter exactly once, then notify.
    /// Returns the new credential when this refresh installed one.
    fn settle(&self, epoch: u64, outcome: Result<Credential, RefreshFailure>) -> Option<Credential> {
        let mut state = self.lock_state();
        // A detached refresh already had its waiters released and must leave
        // any newer refresh alone.
        let waiters = match state.in_flight.take() {
            Some(flight) if flight.epoch == epoch => flight.waiters,
            other => {
                state.in_flight = other;
                Vec::new()
            }
        };

        let (result, installed, terminated) = if state.epoch != epoch {
            debug!("Refresh settled after the session changed, discarding its result");
            (None, None, false)
        } else {
            match outcome {
                Ok(credential) => {
                    self.store.set(credential.clone());
                    state.terminated = false;
                    (Some(credential.clone()), Some(credential), false)
                }
                Err(failure) => {
                    warn!(error = %failure, "Credential refresh failed");
                    self.store.clear();
                    state.epoch += 1;
                    state.terminated = true;
                    (None, None, true)
                }
            }
        };
        drop(state);

        debug!(waiters = waiters.len(), "Refresh settled");
        for waiter in waiters {
            let outcome = result.clone().ok_or(SessionError::SessionTerminated);
            // Waiters that stopped listening are simply skipped.
            let _ = waiter.send(outcome);
        }

        if let Some(ref credential) = installed {
            info!(subject = ?credential.subject(), "Credential refreshed");
            self.hook.notify(SessionEvent::Refreshed {
                subject: credential.subject().map(str::to_string),
            });
        }
        if terminated {
            self.hook.fire(TerminationReason::RefreshFailed);
        }
        installed
    }

    async fn sync_capabilities(&self, credential: &Credential) {
        match self.backend.fetch_capabilities(credential).await {
            Ok(Some(records)) => {
                if self.store.apply_capabilities(credential.token(), records) {
                    debug!("Applied supplementary capabilities");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to fetch capabilities, using credential authorities"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_token, FakeAuth};
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const THRESHOLD_SECS: i64 = 300;

    fn coordinator_with(
        backend: Arc<FakeAuth>,
        initial: Option<String>,
    ) -> (RefreshCoordinator, Arc<CredentialStore>, Arc<TerminationHook>) {
        let store = Arc::new(CredentialStore::in_memory());
        let hook = Arc::new(TerminationHook::new());
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            backend,
            hook.clone(),
            chrono::Duration::seconds(THRESHOLD_SECS),
            Duration::from_millis(500),
        );
        if let Some(token) = initial {
            coordinator.install(Credential::new(token));
        }
        (coordinator, store, hook)
    }

    #[tokio::test]
    async fn test_active_credential_returns_without_refresh() {
        let backend = Arc::new(FakeAuth::issuing(3600));
        let token = make_token("clerk", 3600, &["TKT_R"]);
        let (coordinator, _, _) = coordinator_with(backend.clone(), Some(token.clone()));

        let credential = coordinator.ensure_fresh().await.expect("fresh credential");
        assert_eq!(credential.token(), token);
        assert_eq!(backend.refresh_count(), 0);
        assert_eq!(coordinator.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_expiring_soon_triggers_proactive_refresh() {
        let backend = Arc::new(FakeAuth::issuing(3600));
        let (coordinator, store, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", 10, &[])));
        assert_eq!(coordinator.state(), SessionState::ExpiringSoon);

        let credential = coordinator.ensure_fresh().await.expect("fresh credential");
        assert_eq!(backend.refresh_count(), 1);
        assert_eq!(store.get(), Some(credential));
        assert_eq!(coordinator.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(50)));
        let (coordinator, _, hook) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));
        let mut events = hook.subscribe();

        let calls = (0..10).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        let results = join_all(calls).await;

        assert_eq!(backend.refresh_count(), 1);
        let tokens: Vec<String> = results
            .into_iter()
            .map(|r| r.expect("refreshed").token().to_string())
            .collect();
        assert!(tokens.iter().all(|t| t == &tokens[0]));
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::Refreshed { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_is_refreshing_while_in_flight() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(100)));
        let (coordinator, _, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.state(), SessionState::Refreshing);

        pending.await.expect("join").expect("refreshed");
        assert_eq!(coordinator.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_refresh_failure_terminates_once() {
        let backend = Arc::new(FakeAuth::failing(500).with_delay(Duration::from_millis(50)));
        let (coordinator, store, hook) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &["TKT_R"])));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        hook.on_terminated(move |reason| {
            assert_eq!(reason, TerminationReason::RefreshFailed);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let calls = (0..5).map(|_| {
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        let results = join_all(calls).await;

        assert_eq!(backend.refresh_count(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(SessionError::SessionTerminated))));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.get().is_none());
        assert!(!store.has_capability("TKT_R"));
        assert_eq!(coordinator.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_refresh_timeout_is_a_failure() {
        let backend = Arc::new(FakeAuth::hanging());
        let store = Arc::new(CredentialStore::in_memory());
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            backend,
            Arc::new(TerminationHook::new()),
            chrono::Duration::seconds(THRESHOLD_SECS),
            Duration::from_millis(30),
        );
        coordinator.install(Credential::new(make_token("clerk", -60, &[])));

        let result = coordinator.ensure_fresh().await;
        assert!(matches!(result, Err(SessionError::SessionTerminated)));
        assert_eq!(coordinator.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_expired_refresh_result_is_a_failure() {
        let backend = Arc::new(FakeAuth::issuing(-10));
        let (coordinator, store, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));

        let result = coordinator.ensure_fresh().await;
        assert!(matches!(result, Err(SessionError::SessionTerminated)));
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn test_short_lived_tokens_refresh_on_every_call() {
        // Issued lifetime (60s) is inside the 300s threshold.
        let backend = Arc::new(FakeAuth::issuing(60));
        let (coordinator, _, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));

        let first = coordinator.ensure_fresh().await.expect("first refresh");
        assert_eq!(coordinator.state(), SessionState::ExpiringSoon);
        let second = coordinator.ensure_fresh().await.expect("second refresh");

        assert_eq!(backend.refresh_count(), 2);
        assert_ne!(first.token(), second.token());
    }

    #[tokio::test]
    async fn test_anonymous_fails_without_refresh() {
        let backend = Arc::new(FakeAuth::issuing(3600));
        let (coordinator, _, _) = coordinator_with(backend.clone(), None);

        assert_eq!(coordinator.state(), SessionState::Anonymous);
        assert!(matches!(
            coordinator.ensure_fresh().await,
            Err(SessionError::SessionTerminated)
        ));
        assert_eq!(backend.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_rejected_forces_then_reuses() {
        let backend = Arc::new(FakeAuth::issuing(3600));
        let original = Credential::new(make_token("clerk", 3600, &[]));
        let (coordinator, _, _) = coordinator_with(backend.clone(), Some(original.token().into()));

        let renewed = coordinator
            .refresh_rejected(&original)
            .await
            .expect("forced refresh");
        assert_ne!(renewed.token(), original.token());
        assert_eq!(backend.refresh_count(), 1);

        // A second caller rejected with the old credential reuses the new one.
        let again = coordinator
            .refresh_rejected(&original)
            .await
            .expect("reused credential");
        assert_eq!(again, renewed);
        assert_eq!(backend.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_waiter_arriving_after_settle_starts_next_cycle() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(20)));
        let (coordinator, _, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));

        let first = coordinator.ensure_fresh().await.expect("first cycle");
        let forced = coordinator
            .refresh_rejected(&first)
            .await
            .expect("second cycle");

        assert_eq!(backend.refresh_count(), 2);
        assert_ne!(first.token(), forced.token());
    }

    #[tokio::test]
    async fn test_logout_during_refresh_discards_result() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(80)));
        let (coordinator, store, hook) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        hook.on_terminated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.terminate(TerminationReason::Logout));
        assert_eq!(coordinator.state(), SessionState::Terminated);

        let result = pending.await.expect("join");
        assert!(matches!(result, Err(SessionError::SessionTerminated)));
        assert!(store.get().is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_login_during_refresh_is_not_held_up_by_it() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(200)));
        let (coordinator, store, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.state(), SessionState::Refreshing);

        coordinator.terminate(TerminationReason::Logout);
        assert_eq!(coordinator.state(), SessionState::Terminated);
        assert!(matches!(
            pending.await.expect("join"),
            Err(SessionError::SessionTerminated)
        ));

        let signed_in = Credential::new(make_token("clerk", 3600, &[]));
        coordinator.install(signed_in.clone());
        assert_eq!(coordinator.state(), SessionState::Active);

        let fresh = tokio::time::timeout(Duration::from_millis(50), coordinator.ensure_fresh())
            .await
            .expect("active credential returned without waiting")
            .expect("fresh credential");
        assert_eq!(fresh, signed_in);

        // The detached refresh settles later without touching the new session.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.get(), Some(signed_in));
        assert_eq!(backend.refresh_count(), 1);
        assert_eq!(coordinator.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_login_releases_waiters_with_new_credential() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(200)));
        let (coordinator, _, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let signed_in = Credential::new(make_token("clerk", 3600, &[]));
        coordinator.install(signed_in.clone());

        let released = tokio::time::timeout(Duration::from_millis(50), pending)
            .await
            .expect("waiter released by login")
            .expect("join")
            .expect("credential");
        assert_eq!(released, signed_in);
    }

    #[tokio::test]
    async fn test_detached_refresh_leaves_newer_refresh_alone() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(100)));
        let (coordinator, store, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // New session whose credential is also stale starts its own refresh.
        coordinator.install(Credential::new(make_token("clerk", -60, &[])));
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        assert!(first.await.expect("join").is_err());

        // The second caller gets its own refresh result, not the stale settle.
        let renewed = second.await.expect("join").expect("second cycle");
        assert_eq!(
            expiry::evaluate(renewed.claims(), Utc::now(), coordinator.threshold()),
            Freshness::Valid
        );
        assert_eq!(backend.refresh_count(), 2);
        assert_eq!(store.get(), Some(renewed));
        assert_eq!(coordinator.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_refresh() {
        let backend = Arc::new(FakeAuth::issuing(3600).with_delay(Duration::from_millis(50)));
        let (coordinator, store, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &[])));
        let stale = store.get().expect("stale credential");

        let abandoned = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(backend.refresh_count(), 1);
        let current = store.get().expect("refreshed credential");
        assert_ne!(current.token(), stale.token());
        assert_eq!(coordinator.state(), SessionState::Active);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let backend = Arc::new(FakeAuth::issuing(3600));
        let (coordinator, _, _) =
            coordinator_with(backend, Some(make_token("clerk", 3600, &[])));

        assert!(coordinator.terminate(TerminationReason::Logout));
        assert!(!coordinator.terminate(TerminationReason::Logout));
        assert_eq!(coordinator.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_supplementary_capabilities_follow_refresh() {
        let backend = Arc::new(
            FakeAuth::issuing(3600)
                .with_capabilities(vec![crate::auth::CapabilityRecord::granted("CAT_U")]),
        );
        let (coordinator, store, _) =
            coordinator_with(backend.clone(), Some(make_token("clerk", -60, &["TKT_R"])));

        coordinator.ensure_fresh().await.expect("refreshed");
        // Capabilities are applied on the refresh task after settle.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.has_capability("CAT_U"));
    }
}
