use thiserror::Error;

/// Failures surfaced to the user as a single "command failed" signal.
///
/// None of these are fatal; each is terminal where it is detected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlickError {
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),
    #[error("remote-control backend not ready")]
    BackendNotReady,
    #[error("authorization required")]
    AuthorizationRequired,
    #[error("invocation failed: {0}")]
    InvocationFailed(String),
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}
