use crate::errors::SharedError;
use crate::k8s::EndpointsApi;
use crate::source::{IpAddressesSource, IpUpdate};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

/// An immutable snapshot of the pod IPs backing one Endpoints object.
pub type IpAddresses = Arc<[String]>;

type FetchResult = Result<Option<IpAddresses>, SharedError>;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct EndpointKey {
    namespace: String,
    name: String,
}

/// Process-wide cache of Endpoints → pod IPs.
///
/// The first lookup for a key installs a single-flight placeholder and spawns
/// a source that keeps the entry fresh through a long-lived watch; concurrent
/// first lookups collapse onto that one fetch. Entries that
/// go a full tick interval without a hit are evicted by a background sweep,
/// and any fetch or watch failure clears the slot so the next call starts
/// over — failures never poison a key.
pub struct EndpointsRegistry {
    client: Arc<dyn EndpointsApi>,
    entries: Arc<DashMap<EndpointKey, CacheEntry>>,
    shutdown: watch::Sender<bool>,
}

enum CacheEntry {
    /// Single-flight placeholder; waiters subscribe to the completion channel.
    Pending(watch::Receiver<Option<FetchResult>>),
    Ready(ReadyEntry),
}

struct ReadyEntry {
    source: IpAddressesSource,
    ip_addresses: Option<IpAddresses>,
    hits: Arc<AtomicI64>,
}

// === impl EndpointsRegistry ===

impl EndpointsRegistry {
    /// Builds a registry backed by the in-cluster [`ApiClient`](crate::k8s::ApiClient).
    pub fn in_cluster(tick_interval: Duration) -> anyhow::Result<Arc<Self>> {
        let client = crate::k8s::ApiClient::in_cluster()?;
        Ok(Arc::new(Self::new(Arc::new(client), tick_interval)))
    }

    /// Creates a registry and spawns its idle-eviction sweep, which runs at
    /// `tick_interval` until [`stop`](Self::stop). Must be called within a
    /// Tokio runtime.
    pub fn new(client: Arc<dyn EndpointsApi>, tick_interval: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);
        let entries: Arc<DashMap<EndpointKey, CacheEntry>> = Arc::new(DashMap::new());

        let sweep = entries.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the sweep starts one
            // interval out.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.wait_for(|stop| *stop) => return,
                    _ = ticker.tick() => clear_idle_watches(&sweep),
                }
            }
        });

        Self {
            client,
            entries,
            shutdown,
        }
    }

    /// The namespace used when a caller supplies an empty one.
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    /// Resolves the pod IPs backing `(namespace, name)` from the cache,
    /// fetching and installing a live watch on first use.
    ///
    /// `Ok(None)` means the Endpoints object does not exist; `Ok(Some(ips))`
    /// with an empty list means it exists with no addresses. Dropping the
    /// returned future (say, through a caller-side timeout) abandons only
    /// this caller's wait: the fetch, the watch and any other waiters carry
    /// on untouched.
    pub async fn get_ip_addresses(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<IpAddresses>> {
        let namespace = if namespace.is_empty() {
            self.client.default_namespace()
        } else {
            namespace
        };
        let key = EndpointKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };

        let mut pending = match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                CacheEntry::Ready(ready) => {
                    ready.hits.fetch_add(1, Ordering::SeqCst);
                    return Ok(ready.ip_addresses.clone());
                }
                CacheEntry::Pending(receiver) => receiver.clone(),
            },
            Entry::Vacant(entry) => {
                let (complete, receiver) = watch::channel(None);
                entry.insert(CacheEntry::Pending(receiver.clone()));
                self.start_source(&key, complete);
                receiver
            }
        };

        let result = {
            let fetched = pending
                .wait_for(Option::is_some)
                .await
                .map_err(|_| anyhow::anyhow!("endpoints registry stopped"))?;
            (*fetched).clone().expect("wait_for only returns a published result")
        };
        match result {
            Ok(ip_addresses) => Ok(ip_addresses),
            Err(error) => Err(anyhow::Error::new(error)),
        }
    }

    /// Stops the sweep and every live source; idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn start_source(&self, key: &EndpointKey, complete: watch::Sender<Option<FetchResult>>) {
        debug!(namespace = %key.namespace, name = %key.name, "starting endpoints watch");
        let entries = self.entries.clone();
        let key = key.clone();
        // One counter per source: watch updates replace the entry but carry
        // the count forward, so server-side churn never demotes an active key.
        let hits = Arc::new(AtomicI64::new(1));
        let mut complete = Some(complete);
        IpAddressesSource::spawn(
            self.client.clone(),
            key.namespace.clone(),
            key.name.clone(),
            self.shutdown.subscribe(),
            move |source, update: IpUpdate| match update {
                Ok(ip_addresses) => {
                    entries.insert(
                        key.clone(),
                        CacheEntry::Ready(ReadyEntry {
                            source: source.clone(),
                            ip_addresses: ip_addresses.clone(),
                            hits: hits.clone(),
                        }),
                    );
                    if let Some(complete) = complete.take() {
                        let _ = complete.send(Some(Ok(ip_addresses)));
                    }
                }
                Err(error) => {
                    debug!(namespace = %key.namespace, name = %key.name, ?error, "endpoints watch terminated");
                    entries.remove(&key);
                    if let Some(complete) = complete.take() {
                        let _ = complete.send(Some(Err(SharedError::new(error))));
                    }
                }
            },
        );
    }
}

impl Drop for EndpointsRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stops sources whose entries went a full tick without a hit and rearms the
/// rest. An entry ordered to stop is drained by its source's terminal
/// emission rather than removed here.
fn clear_idle_watches(entries: &DashMap<EndpointKey, CacheEntry>) {
    for entry in entries.iter() {
        let CacheEntry::Ready(ready) = entry.value() else {
            continue;
        };
        let hits = ready.hits.load(Ordering::SeqCst);
        if hits == 0 {
            debug!(namespace = %entry.key().namespace, name = %entry.key().name, "stopping idle endpoints watch");
            ready.source.stop();
        } else {
            // Only zero a count we observed; a hit racing the sweep keeps
            // the entry alive for another tick.
            let _ = ready
                .hits
                .compare_exchange(hits, 0, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
impl EndpointsRegistry {
    fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn hit_count(&self, namespace: &str, name: &str) -> Option<i64> {
        let key = EndpointKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.entries.get(&key).and_then(|entry| match entry.value() {
            CacheEntry::Ready(ready) => Some(ready.hits.load(Ordering::SeqCst)),
            CacheEntry::Pending(_) => None,
        })
    }
}
