//! Authentication module for managing the credential lifecycle.
//!
//! This module provides:
//! - `claims`: decoding and validity checks for access credentials
//! - `CredentialStore`: persistence for the credential pair (file, OS keyring, memory)
//! - `Session`: the observable, authoritative session state
//! - `RefreshCoordinator`: coalesced renewal of expired access credentials
//! - `bootstrap`: restoring the session at process start
//! - `SessionManager`: the facade the application talks to

pub mod bootstrap;
pub mod claims;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod refresh;
pub mod session;

pub use claims::Claims;
pub use credentials::{
    CredentialPair, CredentialStore, FileCredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, StoredCredentials,
};
pub use error::SessionError;
pub use manager::SessionManager;
pub use refresh::RefreshCoordinator;
pub use session::{Session, SessionSnapshot};
