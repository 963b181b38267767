//! REST API client module.
//!
//! This module provides the `ApiClient` for calling protected endpoints with
//! the session's bearer credential, and the `AuthBackend` for the login,
//! renewal and registration endpoints that issue those credentials.

pub mod backend;
pub mod client;
pub mod error;

pub use backend::{AuthBackend, HttpAuthBackend, RenewedCredentials};
pub use client::{ApiClient, Profile};
pub use error::ApiError;
