//! Scripted stand-in for [`EndpointsApi`] used across the crate's tests.

use super::{EndpointAddress, EndpointSubset, Endpoints, EndpointsApi, EndpointsEvent, OnEvent};
use anyhow::{bail, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type GetResponse = Box<dyn FnOnce() -> Result<Option<Endpoints>> + Send>;

/// One scripted watch call: the events it delivers and how it ends.
pub(crate) struct WatchScript {
    pub(crate) events: Vec<EndpointsEvent>,
    pub(crate) outcome: WatchOutcome,
}

pub(crate) enum WatchOutcome {
    /// Stay open until the caller drops the watch.
    Pend,
    /// Fail the watch after the scripted events.
    Fail(&'static str),
}

pub(crate) struct MockApi {
    namespace: String,
    gets: Mutex<VecDeque<GetResponse>>,
    watches: Mutex<VecDeque<WatchScript>>,
    get_calls: AtomicUsize,
    watch_calls: AtomicUsize,
    watch_cancels: Arc<AtomicUsize>,
    watch_resource_versions: Mutex<Vec<String>>,
    progress: watch::Sender<u32>,
}

// === impl MockApi ===

impl MockApi {
    pub(crate) fn new(namespace: &str) -> Arc<Self> {
        let (progress, _) = watch::channel(0);
        Arc::new(Self {
            namespace: namespace.to_string(),
            gets: Mutex::new(VecDeque::new()),
            watches: Mutex::new(VecDeque::new()),
            get_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            watch_cancels: Arc::new(AtomicUsize::new(0)),
            watch_resource_versions: Mutex::new(Vec::new()),
            progress,
        })
    }

    pub(crate) fn expect_get(
        &self,
        response: impl FnOnce() -> Result<Option<Endpoints>> + Send + 'static,
    ) {
        self.gets.lock().push_back(Box::new(response));
    }

    pub(crate) fn expect_watch(&self, script: WatchScript) {
        self.watches.lock().push_back(script);
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Number of watches that ended because the caller dropped them.
    pub(crate) fn watch_cancels(&self) -> usize {
        self.watch_cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn watch_resource_versions(&self) -> Vec<String> {
        self.watch_resource_versions.lock().clone()
    }

    /// Resolves once `count` watch events have been delivered and applied.
    pub(crate) async fn delivered(&self, count: u32) {
        let mut progress = self.progress.subscribe();
        progress
            .wait_for(|delivered| *delivered >= count)
            .await
            .expect("mock progress channel closed");
    }
}

#[async_trait::async_trait]
impl EndpointsApi for MockApi {
    fn default_namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_endpoints(&self, _namespace: &str, _name: &str) -> Result<Option<Endpoints>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let Some(response) = self.gets.lock().pop_front() else {
            bail!("unexpected get_endpoints call");
        };
        response()
    }

    async fn watch_endpoints(
        &self,
        _namespace: &str,
        _name: &str,
        resource_version: &str,
        on_event: OnEvent<'_>,
    ) -> Result<()> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.watch_resource_versions
            .lock()
            .push(resource_version.to_string());

        let script = self.watches.lock().pop_front();
        let Some(script) = script else {
            // Unscripted watches just stay open, like a quiet cluster.
            let _probe = CancelProbe(self.watch_cancels.clone());
            return std::future::pending().await;
        };

        for event in script.events {
            if !on_event(event) {
                return Ok(());
            }
            self.progress.send_modify(|delivered| *delivered += 1);
        }
        match script.outcome {
            WatchOutcome::Pend => {
                let _probe = CancelProbe(self.watch_cancels.clone());
                std::future::pending().await
            }
            WatchOutcome::Fail(message) => bail!("{message}"),
        }
    }
}

/// Bumps the cancel counter when a pending watch future is dropped.
struct CancelProbe(Arc<AtomicUsize>);

impl Drop for CancelProbe {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds an Endpoints object with one address list per subset, in order.
pub(crate) fn endpoints(resource_version: &str, subsets: &[&[&str]]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        subsets: Some(
            subsets
                .iter()
                .map(|addresses| EndpointSubset {
                    addresses: Some(
                        addresses
                            .iter()
                            .map(|ip| EndpointAddress {
                                ip: (*ip).to_string(),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}
