//! authkeep core - session and token lifecycle management.
//!
//! This crate owns the short-lived access credential and the longer-lived
//! renewal credential for a REST backend: it decodes, persists, validates and
//! silently renews them, and replays calls that fail because the access
//! credential expired.
//!
//! The surrounding application only talks to [`SessionManager`]:
//!
//! ```no_run
//! use authkeep_core::{Config, SessionManager};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?.with_env_overrides();
//! let manager = SessionManager::new(&config)?;
//! manager.bootstrap().await;
//!
//! if !manager.is_authenticated() {
//!     manager.login("alice", "secret").await?;
//! }
//! let profile = manager.api().fetch_profile().await?;
//! println!("signed in as {}", profile.username);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, AuthBackend, HttpAuthBackend, Profile};
pub use auth::{
    Claims, CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, RefreshCoordinator, Session, SessionError, SessionManager,
    SessionSnapshot, StoredCredentials,
};
pub use config::{Config, StoreBackend};
