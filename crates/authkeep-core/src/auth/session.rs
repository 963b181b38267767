use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::claims::{self, Claims};
use super::credentials::{CredentialPair, CredentialStore, StoredCredentials};

/// Everything an observer can see about the session, published as one value.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub credentials: Option<CredentialPair>,
    pub claims: Option<Claims>,
    pub bootstrapping: bool,
}

impl SessionSnapshot {
    /// State at process start: nothing loaded yet, bootstrap pending
    fn initial() -> Self {
        Self {
            credentials: None,
            claims: None,
            bootstrapping: true,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.access.as_str())
    }
}

/// Authoritative in-memory session, written through to a [`CredentialStore`].
///
/// Cheap to clone; every clone is a handle onto the same state. Mutation only
/// happens through [`Session::commit`] and [`Session::reset`], each of which
/// persists and publishes the whole snapshot in one step.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: Arc<dyn CredentialStore>,
    state: watch::Sender<SessionSnapshot>,
    /// Bumped by every commit and reset; only written while the watch lock is held
    generation: AtomicU64,
}

impl Session {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::initial());
        Self {
            inner: Arc::new(SessionInner {
                store,
                state,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .credentials
            .as_ref()
            .map(|c| c.access.clone())
    }

    pub fn renewal_token(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .credentials
            .as_ref()
            .map(|c| c.renewal.clone())
    }

    pub fn claims(&self) -> Option<Claims> {
        self.inner.state.borrow().claims.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.inner.state.borrow().bootstrapping
    }

    /// Receive every future snapshot. The current value is marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    /// Install a new credential pair.
    ///
    /// Decodes the access half, writes both halves to the store and publishes
    /// the new snapshot. Store failures are logged and do not block the
    /// in-memory transition.
    pub fn commit(&self, pair: CredentialPair) -> Option<Claims> {
        let decoded = decode_for_commit(&pair.access);
        let published = decoded.clone();
        self.inner
            .state
            .send_modify(|state| self.install(state, pair, published));
        decoded
    }

    /// Commit `pair` only if no commit or reset happened since `generation`
    /// was read. Returns whether the pair was installed.
    pub(crate) fn commit_if_current(&self, pair: CredentialPair, generation: u64) -> bool {
        let decoded = decode_for_commit(&pair.access);
        self.inner.state.send_if_modified(|state| {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            self.install(state, pair, decoded);
            true
        })
    }

    /// Drop all credentials from memory and from the store (logout).
    pub fn reset(&self) {
        self.inner.state.send_modify(|state| self.clear(state));
    }

    /// Reset only if no commit or reset happened since `generation` was read.
    pub(crate) fn reset_if_current(&self, generation: u64) -> bool {
        self.inner.state.send_if_modified(|state| {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            self.clear(state);
            true
        })
    }

    /// Identifies the current session; changes on every commit and reset.
    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Renewal credential together with the generation it belongs to.
    pub(crate) fn renewal_with_generation(&self) -> Option<(String, u64)> {
        // Holding the read lock keeps the pair consistent with the counter
        let state = self.inner.state.borrow();
        let generation = self.inner.generation.load(Ordering::SeqCst);
        state
            .credentials
            .as_ref()
            .map(|c| (c.renewal.clone(), generation))
    }

    fn install(&self, state: &mut SessionSnapshot, pair: CredentialPair, decoded: Option<Claims>) {
        if let Err(e) = self.inner.store.save(&pair) {
            warn!(error = %e, "Failed to persist credentials");
        }
        debug!(
            access = %claims::fingerprint(&pair.access),
            user = ?decoded.as_ref().map(Claims::display_name),
            "Session committed"
        );
        state.credentials = Some(pair);
        state.claims = decoded;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn clear(&self, state: &mut SessionSnapshot) {
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        if state.credentials.is_some() {
            info!("Session cleared");
        }
        state.credentials = None;
        state.claims = None;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Read whatever the store holds, treating store faults as empty.
    pub fn load_stored(&self) -> StoredCredentials {
        match self.inner.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to load stored credentials");
                StoredCredentials::default()
            }
        }
    }

    pub(crate) fn set_bootstrapping(&self, bootstrapping: bool) {
        self.inner.state.send_if_modified(|state| {
            let changed = state.bootstrapping != bootstrapping;
            state.bootstrapping = bootstrapping;
            changed
        });
    }
}

fn decode_for_commit(access: &str) -> Option<Claims> {
    match claims::decode(access) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(error = %e, "Committed access credential has unreadable claims");
            None
        }
    }
}
