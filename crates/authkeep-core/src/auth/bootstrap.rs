use tracing::{debug, info};

use super::claims;
use super::{RefreshCoordinator, Session, SessionSnapshot};

/// Clears the bootstrapping flag however bootstrap exits, panics included.
struct BootstrapGuard<'a> {
    session: &'a Session,
}

impl<'a> BootstrapGuard<'a> {
    fn start(session: &'a Session) -> Self {
        session.set_bootstrapping(true);
        Self { session }
    }
}

impl Drop for BootstrapGuard<'_> {
    fn drop(&mut self) {
        self.session.set_bootstrapping(false);
    }
}

/// Restore the session from the credential store at process start.
///
/// A still-valid access credential is re-committed as is; an expired one is
/// renewed if a renewal credential is available. Anything else ends
/// unauthenticated. Store and network faults never escape from here.
pub async fn bootstrap(
    session: &Session,
    coordinator: &RefreshCoordinator,
    clock_skew_tolerance_ms: i64,
) -> SessionSnapshot {
    let guard = BootstrapGuard::start(session);
    let generation = session.generation();

    let stored = session.load_stored();
    if stored.is_empty() {
        debug!("No stored credentials");
        session.reset();
    } else if let Some(pair) = stored.pair().filter(|pair| {
        let decoded = claims::decode(&pair.access).ok();
        claims::is_valid(decoded.as_ref(), claims::now_ms(), clock_skew_tolerance_ms)
    }) {
        debug!("Stored access credential still valid");
        session.commit(pair);
    } else if let Some(renewal) = stored.renewal {
        debug!("Stored access credential expired, renewing");
        // The coordinator commits on success and resets on failure.
        if coordinator.refresh_with(renewal, generation).await.is_err() {
            debug!("Renewal at startup failed");
        }
    } else {
        debug!("Stored access credential expired and no renewal credential");
        session.reset();
    }

    drop(guard);
    let snapshot = session.snapshot();
    info!(
        authenticated = snapshot.is_authenticated(),
        "Session bootstrap complete"
    );
    snapshot
}
