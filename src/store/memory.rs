use alloy::primitives::Address;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{CheckpointStore, StoreError, StoreState};
use crate::types::{ChainCheckpoint, ChainName, EventId, TransferRecord, TransferStatus};

/// Non-durable store for tests and dry runs
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, chain: &ChainName) -> Result<Option<u64>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.blocks.get(chain).copied())
    }

    async fn save(&self, chain: &ChainName, block: u64) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.save(chain, block).map(|_| ())
    }

    async fn reset_checkpoint(&self, chain: &ChainName, block: u64) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.blocks.insert(chain.clone(), block);
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<ChainCheckpoint>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.checkpoints())
    }

    async fn load_transfer(&self, event_id: &EventId) -> Result<Option<TransferRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.transfers.get(event_id).cloned())
    }

    async fn load_transfer_by_nonce(
        &self,
        chain: &ChainName,
        bridge: Address,
        nonce: u64,
    ) -> Result<Option<TransferRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.by_replay_key(chain, bridge, nonce).cloned())
    }

    async fn transfers_by_nonce(
        &self,
        chain: &ChainName,
        nonce: u64,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.by_nonce(chain, nonce))
    }

    async fn insert_if_absent(&self, record: &TransferRecord) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.state.write().await.insert_if_absent(record))
    }

    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.upsert(record)
    }

    async fn list_pending(&self) -> Result<Vec<TransferRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.pending())
    }

    async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.list(status, limit))
    }

    async fn list_by_account(
        &self,
        account: Address,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.by_account(account, limit))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}
