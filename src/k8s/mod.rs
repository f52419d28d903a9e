//! Kubernetes API collaborator.
//!
//! The registry only ever needs two requests against the API server: a
//! one-shot GET of an Endpoints object and a long-lived watch on it. Both are
//! expressed by [`EndpointsApi`] so the rest of the crate (and its tests) can
//! stay off the network.

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod token;

pub use self::client::ApiClient;
pub use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints};

use anyhow::Result;
use async_trait::async_trait;

/// One decoded watch event for an Endpoints object.
#[derive(Clone, Debug)]
pub enum EndpointsEvent {
    Added(Endpoints),
    Modified(Endpoints),
    Deleted(Endpoints),
}

// === impl EndpointsEvent ===

impl EndpointsEvent {
    /// The endpoints payload carried by the event.
    pub fn endpoints(&self) -> &Endpoints {
        match self {
            Self::Added(endpoints) | Self::Modified(endpoints) | Self::Deleted(endpoints) => {
                endpoints
            }
        }
    }
}

/// Invoked once per decoded watch event; returning `false` closes the watch
/// cleanly.
pub type OnEvent<'a> = &'a mut (dyn FnMut(EndpointsEvent) -> bool + Send);

/// The operations the endpoints registry needs from the API server.
#[async_trait]
pub trait EndpointsApi: Send + Sync {
    /// The namespace this client runs in, used when a caller supplies none.
    fn default_namespace(&self) -> &str;

    /// Fetches the current snapshot of an Endpoints object.
    ///
    /// A `404` yields `Ok(None)`; any other non-`200` status yields an error
    /// whose chain carries a [`StatusError`](crate::StatusError).
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;

    /// Opens a watch stream and feeds each event to `on_event` until the
    /// callback declines, the stream fails, or the future is dropped.
    ///
    /// A non-empty `resource_version` resumes the watch from that cursor. An
    /// expired cursor (`410 Gone`) is recovered internally: the stream is
    /// reopened from scratch and events carrying the exact resource version
    /// the caller supplied are suppressed, since the caller has already
    /// observed that snapshot.
    async fn watch_endpoints(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        on_event: OnEvent<'_>,
    ) -> Result<()>;
}
