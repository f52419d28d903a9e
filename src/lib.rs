#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Client-side load balancing for in-cluster HTTP traffic.
//!
//! Kubernetes `ClusterIP` services balance per connection, which serves
//! long-lived or multiplexed connections poorly. This crate rewrites requests
//! in flight instead: URLs whose scheme carries a `kube-` prefix
//! (`kube-http://name.namespace/path`) have their host resolved against the
//! live Endpoints object and replaced with one pod IP, bypassing kube-proxy
//! entirely.
//!
//! Resolution is served from a process-wide [`EndpointsRegistry`]: the first
//! lookup of a key fetches the Endpoints object once (concurrent lookups
//! collapse onto that fetch) and opens a long-lived watch that keeps the
//! cached IP list current; keys nobody asks about are evicted on a periodic
//! sweep.
//!
//! ```ignore
//! let layer = kube_transport::KubeTransportLayer::in_cluster()?;
//! let client = tower::ServiceBuilder::new().layer(layer).service(http_client);
//! // requests to kube-http://my-svc.my-ns/... now go straight to pod IPs
//! ```
//!
//! Resolution failures surface [`EndpointsNotFound`] (no such Endpoints
//! object) or [`NoIpAddress`] (the object exists with no addresses) in the
//! error chain.

mod errors;
pub mod k8s;
mod registry;
mod source;
mod transport;

pub use self::errors::{EndpointsNotFound, NoIpAddress, StatusError};
pub use self::registry::{EndpointsRegistry, IpAddresses};
pub use self::transport::{KubeTransport, KubeTransportLayer};

use std::time::Duration;

/// Default interval between idle-eviction sweeps of the registry.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
