use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError, AuthBackend, HttpAuthBackend};
use crate::config::{Config, StoreBackend};

use super::bootstrap::bootstrap;
use super::{
    Claims, CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    RefreshCoordinator, Session, SessionSnapshot,
};

/// Keychain service name for the keyring store
const KEYRING_SERVICE: &str = "authkeep";

/// Entry point for the surrounding application.
///
/// Owns the single [`Session`] of the process and hands the same handle to
/// the refresh coordinator, the bootstrapper and the request interceptor.
#[derive(Clone)]
pub struct SessionManager {
    session: Session,
    backend: Arc<dyn AuthBackend>,
    coordinator: RefreshCoordinator,
    api: ApiClient,
    clock_skew_tolerance_ms: i64,
}

impl SessionManager {
    /// Build the HTTP backend and credential store described by `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let store: Arc<dyn CredentialStore> = match config.store {
            StoreBackend::File => Arc::new(FileCredentialStore::in_dir(config.cache_dir()?)),
            StoreBackend::Keyring => Arc::new(KeyringCredentialStore::new(KEYRING_SERVICE)),
            StoreBackend::Memory => Arc::new(MemoryCredentialStore::new()),
        };
        let backend = Arc::new(HttpAuthBackend::new(client.clone(), config));

        Ok(Self::with_parts(config, client, store, backend))
    }

    /// Assemble a manager from explicit collaborators.
    pub fn with_parts(
        config: &Config,
        client: Client,
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn AuthBackend>,
    ) -> Self {
        let session = Session::new(store);
        let coordinator = RefreshCoordinator::new(session.clone(), Arc::clone(&backend));
        let api = ApiClient::new(client, config, session.clone(), coordinator.clone());
        Self {
            session,
            backend,
            coordinator,
            api,
            clock_skew_tolerance_ms: config.clock_skew_tolerance_ms,
        }
    }

    /// Restore the previous session. Call once at startup.
    pub async fn bootstrap(&self) -> SessionSnapshot {
        bootstrap(&self.session, &self.coordinator, self.clock_skew_tolerance_ms).await
    }

    /// Log in and commit the issued credentials.
    ///
    /// On failure the session is left exactly as it was.
    pub async fn login(&self, username: &str, password: &str) -> Result<Claims, ApiError> {
        let pair = match self.backend.login(username, password).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(username = username, error = %e, "Login failed");
                return Err(e);
            }
        };

        let claims = super::claims::decode(&pair.access).map_err(|e| {
            warn!(username = username, error = %e, "Login returned an unreadable access credential");
            ApiError::InvalidResponse(e.to_string())
        })?;

        self.session.commit(pair);
        info!(username = username, "Logged in");
        Ok(claims)
    }

    /// Forget the session, locally and in the store.
    pub fn logout(&self) {
        self.session.reset();
        info!("Logged out");
    }

    /// Create an account; the caller still has to log in afterwards.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), ApiError> {
        self.backend.register(username, password).await?;
        info!(username = username, "Account registered");
        Ok(())
    }

    /// Force a renewal exchange now.
    pub async fn refresh(&self) -> Result<Claims, ApiError> {
        let pair = self.coordinator.refresh().await?;
        super::claims::decode(&pair.access).map_err(|_| ApiError::SessionExpired)
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.session.is_bootstrapping()
    }

    /// Decoded identity of the signed-in user
    pub fn identity(&self) -> Option<Claims> {
        self.session.claims()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Observe every session change (login, renewal, logout, bootstrap).
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.subscribe()
    }

    /// Client for protected endpoints, with transparent renewal
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
