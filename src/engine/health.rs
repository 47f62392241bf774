//! Per-chain liveness and reorg flags surfaced by the status API

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::types::ChainName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReorgFlag {
    pub block_number: u64,
    pub expected: B256,
    pub found: B256,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainHealth {
    pub liveness_alert: bool,
    pub consecutive_failures: u32,
    pub last_scanned_block: Option<u64>,
    pub reorg: Option<ReorgFlag>,
}

pub struct EngineHealth {
    started: Instant,
    chains: RwLock<BTreeMap<ChainName, ChainHealth>>,
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineHealth {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            chains: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn register(&self, chain: &ChainName) {
        self.update(chain, |_| {});
    }

    pub fn set_liveness(&self, chain: &ChainName, alert: bool, consecutive_failures: u32) {
        self.update(chain, |h| {
            h.liveness_alert = alert;
            h.consecutive_failures = consecutive_failures;
        });
    }

    pub fn set_scanned(&self, chain: &ChainName, block: u64) {
        self.update(chain, |h| h.last_scanned_block = Some(block));
    }

    pub fn flag_reorg(&self, chain: &ChainName, block_number: u64, expected: B256, found: B256) {
        self.update(chain, |h| {
            if h.reorg.is_none() {
                h.reorg = Some(ReorgFlag {
                    block_number,
                    expected,
                    found,
                    detected_at: Utc::now(),
                });
            }
        });
    }

    pub fn clear_reorg(&self, chain: &ChainName) {
        self.update(chain, |h| h.reorg = None);
    }

    pub fn chain(&self, chain: &ChainName) -> Option<ChainHealth> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chain)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<ChainName, ChainHealth> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, chain: &ChainName, f: impl FnOnce(&mut ChainHealth)) {
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        f(chains.entry(chain.clone()).or_default());
    }
}
