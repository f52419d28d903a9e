use crate::errors::Cancelled;
use crate::k8s::{Endpoints, EndpointsApi, EndpointsEvent};
use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::watch;

/// One update emitted by a source: `Ok(Some(ips))` is a live snapshot,
/// `Ok(None)` means the endpoints object is absent, and `Err` is the terminal
/// emission after which the source is done.
pub(crate) type IpUpdate = anyhow::Result<Option<Arc<[String]>>>;

/// Handle over the background worker that owns one endpoints watch.
///
/// The worker performs the initial GET, emits the first snapshot, then
/// re-emits on every watch event. It runs until stopped (or until the
/// registry-wide shutdown fires) and always signs off with a terminal `Err`
/// emission, which is what lets the registry drain the cache slot.
#[derive(Clone)]
pub(crate) struct IpAddressesSource {
    stop: Arc<watch::Sender<bool>>,
}

// === impl IpAddressesSource ===

impl IpAddressesSource {
    /// Spawns the worker. The callback receives the source handle with every
    /// emission so the registry can tie updates back to the cache slot this
    /// source owns.
    pub(crate) fn spawn(
        client: Arc<dyn EndpointsApi>,
        namespace: String,
        name: String,
        mut shutdown: watch::Receiver<bool>,
        mut callback: impl FnMut(&IpAddressesSource, IpUpdate) + Send + 'static,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let source = Self {
            stop: Arc::new(stop),
        };
        let this = source.clone();
        tokio::spawn(async move {
            // A dropped sender counts as a stop signal, so `wait_for` errors
            // resolve the same way as an explicit stop.
            let cancelled = async move {
                tokio::select! {
                    _ = stopped.wait_for(|stop| *stop) => {}
                    _ = shutdown.wait_for(|stop| *stop) => {}
                }
            };
            tokio::pin!(cancelled);

            let initial = tokio::select! {
                _ = &mut cancelled => Err(anyhow::Error::new(Cancelled)),
                result = client.get_endpoints(&namespace, &name) => result,
            };
            let endpoints = match initial {
                Ok(endpoints) => endpoints,
                Err(error) => {
                    let error = error.context(format!(
                        "get endpoints; namespace={namespace:?} endpointsName={name:?}"
                    ));
                    callback(&this, Err(error));
                    return;
                }
            };

            let resource_version = endpoints
                .as_ref()
                .and_then(|endpoints| endpoints.metadata.resource_version.clone())
                .unwrap_or_default();
            callback(&this, Ok(endpoints.as_ref().map(extract_ip_addresses)));

            let error = {
                let mut deliver = |event: EndpointsEvent| {
                    let ip_addresses = match &event {
                        EndpointsEvent::Deleted(_) => None,
                        EndpointsEvent::Added(endpoints)
                        | EndpointsEvent::Modified(endpoints) => {
                            Some(extract_ip_addresses(endpoints))
                        }
                    };
                    callback(&this, Ok(ip_addresses));
                    true
                };
                tokio::select! {
                    _ = &mut cancelled => anyhow::Error::new(Cancelled),
                    result = client.watch_endpoints(&namespace, &name, &resource_version, &mut deliver) => {
                        match result {
                            Ok(()) => anyhow!("watch stream closed"),
                            Err(error) => error,
                        }
                    }
                }
            };
            callback(
                &this,
                Err(error.context(format!(
                    "watch endpoints; namespace={namespace:?} endpointsName={name:?}"
                ))),
            );
        });
        source
    }

    /// Cancels the worker; the terminal emission still fires.
    pub(crate) fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Flattens `subsets[*].addresses[*].ip`, preserving order across subsets.
pub(crate) fn extract_ip_addresses(endpoints: &Endpoints) -> Arc<[String]> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|address| address.ip.clone())
        .collect()
}
