use thiserror::Error;

/// Failures of the session lifecycle itself.
///
/// Cloneable so that one renewal outcome can be handed to every caller
/// waiting on the same in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("Renewal rejected: {0}")]
    RenewalRejected(String),

    #[error("Network error during renewal: {0}")]
    NetworkFault(String),

    #[error("Session expired - please log in again")]
    SessionExpired,
}
