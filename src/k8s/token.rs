use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Cached service-account bearer token.
///
/// Readers take the current snapshot lock-free. A missing or stale snapshot
/// is refreshed from disk behind a mutex with a second check, so concurrent
/// callers trigger a single file read per refresh window. Tokens are rotated
/// by the kubelet, hence the short refresh window; a `401` response
/// invalidates the snapshot immediately via [`invalidate`](Self::invalidate).
pub(crate) struct BearerToken {
    file_path: PathBuf,
    state: ArcSwapOption<TokenState>,
    refresh: Mutex<()>,
}

#[derive(Debug)]
struct TokenState {
    value: String,
    refresh_at: Instant,
}

// === impl BearerToken ===

impl BearerToken {
    pub(crate) fn new(file_path: PathBuf) -> Self {
        Self {
            file_path,
            state: ArcSwapOption::empty(),
            refresh: Mutex::new(()),
        }
    }

    pub(crate) fn get(&self) -> Result<String> {
        let now = Instant::now();
        if let Some(state) = self.state.load_full() {
            if state.refresh_at > now {
                return Ok(state.value.clone());
            }
        }

        let _refresh = self.refresh.lock();
        if let Some(state) = self.state.load_full() {
            if state.refresh_at > now {
                return Ok(state.value.clone());
            }
        }

        let value = fs::read_to_string(&self.file_path)
            .with_context(|| format!("read token file; filePath={:?}", self.file_path))?
            .trim_end()
            .to_string();
        self.state.store(Some(Arc::new(TokenState {
            value: value.clone(),
            refresh_at: now + REFRESH_INTERVAL,
        })));
        Ok(value)
    }

    pub(crate) fn invalidate(&self) {
        self.state.store(None);
    }
}
