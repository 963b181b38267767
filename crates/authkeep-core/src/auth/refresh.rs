//! Coalesced renewal of the access credential.
//!
//! However many callers discover an expired credential at the same time, only
//! one renewal exchange runs; everyone else waits on its outcome. The exchange
//! itself runs in a spawned task, so a caller that gives up waiting does not
//! cancel it for the others.
//!
//! Each exchange belongs to the session generation it started from. If the
//! session is logged out or replaced while the exchange is running, its result
//! is discarded instead of resurrecting the old session.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthBackend};

use super::claims::{self, fingerprint};
use super::{CredentialPair, Session, SessionError};

type RefreshOutcome = Result<CredentialPair, SessionError>;
type PendingSlot = Arc<Mutex<Option<Arc<InFlightRefresh>>>>;

/// A renewal exchange that is still running, shared by every waiter.
struct InFlightRefresh {
    generation: u64,
    result: OnceCell<RefreshOutcome>,
    notify: Notify,
}

impl InFlightRefresh {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn settle(&self, outcome: RefreshOutcome) {
        let _ = self.result.set(outcome);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> RefreshOutcome {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

/// Settles a flight that its exchange task never finished (panic or runtime
/// shutdown), so waiters are released and later refreshes can start.
struct ExchangeGuard {
    pending: PendingSlot,
    flight: Arc<InFlightRefresh>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if self.flight.result.initialized() {
            return;
        }
        warn!("Renewal exchange ended without an outcome");
        clear_pending(&self.pending, &self.flight);
        self.flight.settle(Err(SessionError::SessionExpired));
    }
}

fn lock_pending(pending: &PendingSlot) -> MutexGuard<'_, Option<Arc<InFlightRefresh>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn clear_pending(pending: &PendingSlot, flight: &Arc<InFlightRefresh>) {
    let mut slot = lock_pending(pending);
    if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, flight)) {
        *slot = None;
    }
}

/// Runs renewal exchanges against an [`AuthBackend`], at most one at a time.
#[derive(Clone)]
pub struct RefreshCoordinator {
    session: Session,
    backend: Arc<dyn AuthBackend>,
    pending: PendingSlot,
}

impl RefreshCoordinator {
    pub fn new(session: Session, backend: Arc<dyn AuthBackend>) -> Self {
        Self {
            session,
            backend,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Renew the access credential using the session's renewal credential.
    ///
    /// Joins the in-flight exchange if there is one. Every failure, including
    /// having no renewal credential at all, comes back as
    /// [`SessionError::SessionExpired`]; after a failed exchange the session
    /// has been reset.
    pub async fn refresh(&self) -> Result<CredentialPair, SessionError> {
        let session = self.session.clone();
        let flight = self.join_or_start(move || session.renewal_with_generation())?;
        flight.wait().await
    }

    /// Same as [`refresh`](Self::refresh), seeded with a renewal credential
    /// that has not been committed to the session yet. `generation` is the
    /// session generation the credential was read under.
    pub(crate) async fn refresh_with(
        &self,
        renewal: String,
        generation: u64,
    ) -> Result<CredentialPair, SessionError> {
        let flight = self.join_or_start(move || Some((renewal, generation)))?;
        flight.wait().await
    }

    /// Whether a renewal exchange is currently running
    pub fn is_refreshing(&self) -> bool {
        lock_pending(&self.pending).is_some()
    }

    fn join_or_start(
        &self,
        seed: impl FnOnce() -> Option<(String, u64)>,
    ) -> Result<Arc<InFlightRefresh>, SessionError> {
        let mut pending = lock_pending(&self.pending);
        let current = self.session.generation();
        if let Some(flight) = pending.as_ref().filter(|f| f.generation == current) {
            debug!("Joining in-flight renewal");
            return Ok(Arc::clone(flight));
        }

        let Some((renewal, generation)) = seed() else {
            debug!("No renewal credential held, cannot refresh");
            return Err(SessionError::SessionExpired);
        };

        // A leftover flight from a replaced session settles on its own
        let flight = Arc::new(InFlightRefresh::new(generation));
        *pending = Some(Arc::clone(&flight));
        drop(pending);

        let coordinator = self.clone();
        let guard = ExchangeGuard {
            pending: Arc::clone(&self.pending),
            flight: Arc::clone(&flight),
        };
        tokio::spawn(async move {
            let task_flight = Arc::clone(&guard.flight);
            coordinator.run_exchange(renewal, task_flight).await;
            drop(guard);
        });

        Ok(flight)
    }

    async fn run_exchange(&self, renewal: String, flight: Arc<InFlightRefresh>) {
        info!(renewal = %fingerprint(&renewal), "Renewing access credential");

        let renewed = match self.backend.renew(&renewal).await {
            // An access credential that does not decode is a failed renewal
            Ok(renewed) => claims::decode(&renewed.access).map(|_| renewed),
            Err(e) => Err(classify(e)),
        };

        let outcome = match renewed {
            Ok(renewed) => {
                let pair = renewed.into_pair(&renewal);
                let committed = self.session.commit_if_current(pair.clone(), flight.generation);
                clear_pending(&self.pending, &flight);
                if committed {
                    info!(access = %fingerprint(&pair.access), "Access credential renewed");
                    Ok(pair)
                } else {
                    info!("Session changed during renewal, discarding renewed credential");
                    Err(SessionError::SessionExpired)
                }
            }
            Err(cause) => {
                warn!(error = %cause, "Renewal failed, ending session");
                // Reset under the pending lock so no new exchange can start
                // with the renewal credential that was just refused.
                let mut pending = lock_pending(&self.pending);
                if pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, &flight)) {
                    *pending = None;
                }
                if !self.session.reset_if_current(flight.generation) {
                    debug!("Session changed during renewal, leaving it in place");
                }
                drop(pending);
                Err(SessionError::SessionExpired)
            }
        };

        flight.settle(outcome);
    }
}

/// Map a renewal endpoint failure onto the session error taxonomy.
fn classify(error: ApiError) -> SessionError {
    match error {
        ApiError::NetworkError(e) => SessionError::NetworkFault(e.to_string()),
        ApiError::InvalidResponse(msg) => SessionError::MalformedCredential(msg),
        other => SessionError::RenewalRejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::backend::RenewedCredentials;
    use crate::auth::claims::testing::token_expiring_in;
    use crate::auth::credentials::{CredentialStore, MemoryCredentialStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Reply {
        Fresh,
        Rotated,
        Refused,
        Garbage,
        Panic,
    }

    /// Renewal backend that counts calls and answers after a short delay.
    struct ScriptedBackend {
        calls: AtomicUsize,
        reply: Reply,
    }

    impl ScriptedBackend {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthBackend for ScriptedBackend {
        async fn login(&self, _username: &str, _password: &str) -> Result<CredentialPair, ApiError> {
            Err(ApiError::InvalidCredentials)
        }

        async fn renew(&self, _renewal: &str) -> Result<RenewedCredentials, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let access = token_expiring_in(&format!("renewed{n}"), 300);
            match self.reply {
                Reply::Fresh => Ok(RenewedCredentials { access, renewal: None }),
                Reply::Rotated => Ok(RenewedCredentials {
                    access,
                    renewal: Some(format!("rotated-{n}")),
                }),
                Reply::Refused => Err(ApiError::Unauthorized),
                Reply::Garbage => Ok(RenewedCredentials {
                    access: "garbage".to_string(),
                    renewal: None,
                }),
                Reply::Panic => panic!("renewal backend bug"),
            }
        }

        async fn register(&self, _username: &str, _password: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn authenticated_session() -> (Session, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let session = Session::new(store.clone());
        session.commit(CredentialPair::new(token_expiring_in("alice", -1), "renewal-0"));
        (session, store)
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_exchange() {
        let (session, store) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Fresh);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let results = futures::future::join_all((0..5).map(|_| coordinator.refresh())).await;

        assert_eq!(backend.calls(), 1);
        let first = results[0].clone().expect("refresh should succeed");
        assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
        assert_eq!(session.access_token(), Some(first.access.clone()));
        assert_eq!(store.load().unwrap().pair(), Some(first));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_reused_renewal_credential_is_kept() {
        let (session, _) = authenticated_session();
        let coordinator = RefreshCoordinator::new(session.clone(), ScriptedBackend::new(Reply::Fresh));

        let pair = coordinator.refresh().await.unwrap();
        assert_eq!(pair.renewal, "renewal-0");
        assert_eq!(session.renewal_token().as_deref(), Some("renewal-0"));
    }

    #[tokio::test]
    async fn test_rotated_renewal_credential_replaces_old_one() {
        let (session, store) = authenticated_session();
        let coordinator = RefreshCoordinator::new(session.clone(), ScriptedBackend::new(Reply::Rotated));

        let pair = coordinator.refresh().await.unwrap();
        assert_eq!(pair.renewal, "rotated-1");
        assert_eq!(store.load().unwrap().renewal.as_deref(), Some("rotated-1"));
    }

    #[tokio::test]
    async fn test_settled_refresh_allows_a_new_exchange() {
        let (session, _) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Fresh);
        let coordinator = RefreshCoordinator::new(session, backend.clone());

        let first = coordinator.refresh().await.unwrap();
        let second = coordinator.refresh().await.unwrap();

        assert_eq!(backend.calls(), 2);
        assert_ne!(first.access, second.access);
    }

    #[tokio::test]
    async fn test_failed_exchange_resets_session_for_every_waiter() {
        let (session, store) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Refused);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let results = futures::future::join_all((0..3).map(|_| coordinator.refresh())).await;

        assert_eq!(backend.calls(), 1);
        assert!(results.iter().all(|r| r == &Err(SessionError::SessionExpired)));
        assert!(!session.is_authenticated());
        assert!(store.load().unwrap().is_empty());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_without_renewal_credential_skips_network() {
        let session = Session::new(Arc::new(MemoryCredentialStore::new()));
        let backend = ScriptedBackend::new(Reply::Fresh);
        let coordinator = RefreshCoordinator::new(session, backend.clone());

        assert_eq!(coordinator.refresh().await, Err(SessionError::SessionExpired));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_cancel_exchange() {
        let (session, _) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Fresh);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let abandoned = tokio::time::timeout(Duration::from_millis(5), coordinator.refresh()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.calls(), 1);
        assert!(session
            .claims()
            .and_then(|c| c.username)
            .is_some_and(|u| u == "renewed1"));
    }

    #[tokio::test]
    async fn test_logout_during_exchange_is_not_undone() {
        let (session, store) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Fresh);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.reset();

        assert_eq!(running.await.unwrap(), Err(SessionError::SessionExpired));
        assert_eq!(backend.calls(), 1);
        assert!(!session.is_authenticated());
        assert!(store.load().unwrap().is_empty());
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_new_login_during_exchange_wins() {
        let (session, store) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Refused);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let bob = CredentialPair::new(token_expiring_in("bob", 300), "renewal-bob");
        session.commit(bob.clone());

        assert_eq!(running.await.unwrap(), Err(SessionError::SessionExpired));
        // The refused exchange belonged to the previous session
        assert_eq!(session.snapshot().credentials, Some(bob.clone()));
        assert_eq!(store.load().unwrap().pair(), Some(bob));
    }

    #[tokio::test]
    async fn test_refresh_after_relogin_does_not_join_stale_exchange() {
        let (session, _) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Fresh);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let stale = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.commit(CredentialPair::new(token_expiring_in("bob", -1), "renewal-bob"));

        let fresh = coordinator.refresh().await.unwrap();

        assert_eq!(backend.calls(), 2);
        assert_eq!(fresh.renewal, "renewal-bob");
        assert_eq!(stale.await.unwrap(), Err(SessionError::SessionExpired));
        assert_eq!(session.snapshot().credentials, Some(fresh));
    }

    #[tokio::test]
    async fn test_undecodable_renewed_access_fails_the_exchange() {
        let (session, store) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Garbage);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let results = futures::future::join_all((0..2).map(|_| coordinator.refresh())).await;

        assert_eq!(backend.calls(), 1);
        assert!(results.iter().all(|r| r == &Err(SessionError::SessionExpired)));
        assert!(!session.is_authenticated());
        assert_eq!(session.access_token(), None);
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_exchange_releases_waiters() {
        let (session, _) = authenticated_session();
        let backend = ScriptedBackend::new(Reply::Panic);
        let coordinator = RefreshCoordinator::new(session.clone(), backend.clone());

        let result = tokio::time::timeout(Duration::from_secs(2), coordinator.refresh())
            .await
            .expect("waiter should be released");

        assert_eq!(result, Err(SessionError::SessionExpired));
        assert!(!coordinator.is_refreshing());

        // A later refresh starts a new exchange instead of hanging
        let again = tokio::time::timeout(Duration::from_secs(2), coordinator.refresh())
            .await
            .expect("second waiter should be released");
        assert_eq!(again, Err(SessionError::SessionExpired));
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn test_classify_failures() {
        assert!(matches!(classify(ApiError::Unauthorized), SessionError::RenewalRejected(_)));
        assert!(matches!(
            classify(ApiError::ServerError("boom".into())),
            SessionError::RenewalRejected(_)
        ));
        assert!(matches!(
            classify(ApiError::InvalidResponse("no access".into())),
            SessionError::MalformedCredential(_)
        ));
    }
}
