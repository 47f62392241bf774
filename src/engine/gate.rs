//! Engine-wide store availability gate
//!
//! Any pipeline that hits an unreachable store closes the gate. Every
//! pipeline waits on it before ingesting or submitting, and a single recovery
//! task reopens it once `ping` succeeds again.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::metrics;
use crate::store::{CheckpointStore, StoreError};
use crate::submitter::retry::RetryConfig;

pub struct StoreGate {
    open: watch::Sender<bool>,
}

impl Default for StoreGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreGate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        metrics::set_store_available(true);
        Self { open }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    pub fn close(&self, cause: &StoreError) {
        if self.open.send_replace(false) {
            error!(error = %cause, "Checkpoint store unavailable, pausing all pipelines");
            metrics::set_store_available(false);
            metrics::record_error("store", "unavailable");
        }
    }

    pub fn reopen(&self) {
        if !self.open.send_replace(true) {
            info!("Checkpoint store reachable again, resuming pipelines");
            metrics::set_store_available(true);
        }
    }

    pub async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }

    /// Recovery loop: whenever the gate closes, ping with backoff until it answers
    pub async fn watch_recovery(&self, store: Arc<dyn CheckpointStore>, retry: RetryConfig) {
        loop {
            self.wait_closed().await;
            let mut attempt: u32 = 0;
            loop {
                tokio::time::sleep(retry.backoff_for_attempt(attempt)).await;
                match store.ping().await {
                    Ok(()) => {
                        self.reopen();
                        break;
                    }
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        warn!(error = %e, attempt, "Checkpoint store still unavailable");
                    }
                }
            }
        }
    }
}
