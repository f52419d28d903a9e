use std::fmt;
use std::sync::Arc;

/// The referenced Endpoints object does not exist.
///
/// Check for it with `error.chain().any(|cause| cause.is::<EndpointsNotFound>())`.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("endpoints not found")]
pub struct EndpointsNotFound;

/// The referenced Endpoints object exists but lists no addresses.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("no ip address")]
pub struct NoIpAddress;

/// A Kubernetes API response that was not what the client expected, carrying
/// the HTTP status code for callers who care.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct StatusError {
    pub code: u16,
    pub message: String,
}

/// A source worker was told to stop while an API call was in flight.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("cancelled")]
pub(crate) struct Cancelled;

/// Delivers one fetch failure to every single-flight waiter.
///
/// `anyhow::Error` is not `Clone`, so the registry publishes the failure
/// behind an `Arc`. Displays as the wrapped error's top message; its source is
/// the wrapped error's cause, so the flattened chain matches the original and
/// downcast checks keep working.
#[derive(Clone, Debug)]
pub(crate) struct SharedError(Arc<anyhow::Error>);

// === impl SharedError ===

impl SharedError {
    pub(crate) fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.chain().nth(1)
    }
}
