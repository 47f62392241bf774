//! Durable checkpoint and transfer storage
//!
//! Every backend satisfies the same contract: a write is acknowledged only
//! once it is durable, checkpoints never move backwards outside of
//! `reset_checkpoint`, and a transfer is recorded at most once per event id
//! and at most once per `(source_chain, source_bridge, nonce)`.

pub mod file;
pub mod memory;
pub mod postgres;

use alloy::primitives::Address;
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChainCheckpoint, ChainName, EventId, TransferRecord, TransferStatus, TransitionError};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
    #[error("checkpoint regression on {chain}: {requested} < {current}")]
    Regression {
        chain: ChainName,
        current: u64,
        requested: u64,
    },
    #[error("corrupt store document: {0}")]
    Corrupt(String),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl StoreError {
    /// Errors that must halt every pipeline until the store is reachable again
    pub fn closes_gate(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Corrupt(_))
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last fully-processed block for `chain`
    async fn load(&self, chain: &ChainName) -> Result<Option<u64>, StoreError>;

    /// Advance the checkpoint. Equal is a no-op, lower is `Regression`.
    async fn save(&self, chain: &ChainName, block: u64) -> Result<(), StoreError>;

    /// Administrative overwrite, may move backwards
    async fn reset_checkpoint(&self, chain: &ChainName, block: u64) -> Result<(), StoreError>;

    async fn checkpoints(&self) -> Result<Vec<ChainCheckpoint>, StoreError>;

    async fn load_transfer(&self, event_id: &EventId) -> Result<Option<TransferRecord>, StoreError>;

    /// Record holding the replay key `(chain, bridge, nonce)`
    async fn load_transfer_by_nonce(
        &self,
        chain: &ChainName,
        bridge: Address,
        nonce: u64,
    ) -> Result<Option<TransferRecord>, StoreError>;

    /// Every record for `nonce` on `chain`, one per bridge contract
    async fn transfers_by_nonce(
        &self,
        chain: &ChainName,
        nonce: u64,
    ) -> Result<Vec<TransferRecord>, StoreError>;

    /// Insert unless a record already exists for the event id or the replay key.
    /// Returns whether the record was inserted.
    async fn insert_if_absent(&self, record: &TransferRecord) -> Result<bool, StoreError>;

    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<(), StoreError>;

    /// PENDING and SUBMITTED records, oldest nonce first per chain
    async fn list_pending(&self) -> Result<Vec<TransferRecord>, StoreError>;

    async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError>;

    /// Transfers initiated by `account`, most recently updated first
    async fn list_by_account(
        &self,
        account: Address,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError>;

    /// Reachability check, fails when writes would fail
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Shared in-memory state used by the memory and file backends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoreState {
    pub blocks: std::collections::BTreeMap<ChainName, u64>,
    pub transfers: std::collections::BTreeMap<EventId, TransferRecord>,
}

impl StoreState {
    pub fn save(&mut self, chain: &ChainName, block: u64) -> Result<bool, StoreError> {
        match self.blocks.get(chain) {
            Some(&current) if block < current => Err(StoreError::Regression {
                chain: chain.clone(),
                current,
                requested: block,
            }),
            Some(&current) if block == current => Ok(false),
            _ => {
                self.blocks.insert(chain.clone(), block);
                Ok(true)
            }
        }
    }

    pub fn by_replay_key(
        &self,
        chain: &ChainName,
        bridge: Address,
        nonce: u64,
    ) -> Option<&TransferRecord> {
        self.transfers
            .values()
            .find(|r| r.event.replay_key() == (chain, bridge, nonce))
    }

    pub fn by_nonce(&self, chain: &ChainName, nonce: u64) -> Vec<TransferRecord> {
        self.transfers
            .values()
            .filter(|r| r.source_chain() == chain && r.nonce() == nonce)
            .cloned()
            .collect()
    }

    fn holder_of(&self, record: &TransferRecord) -> Option<&TransferRecord> {
        let (chain, bridge, nonce) = record.event.replay_key();
        self.by_replay_key(chain, bridge, nonce)
    }

    pub fn insert_if_absent(&mut self, record: &TransferRecord) -> bool {
        if self.transfers.contains_key(&record.event_id) || self.holder_of(record).is_some() {
            return false;
        }
        self.transfers
            .insert(record.event_id.clone(), record.clone());
        true
    }

    pub fn upsert(&mut self, record: &TransferRecord) -> Result<(), StoreError> {
        if let Some(other) = self.holder_of(record) {
            if other.event_id != record.event_id {
                return Err(StoreError::Corrupt(format!(
                    "nonce {} of bridge {} on {} already recorded as {}",
                    record.nonce(),
                    record.event.source_bridge,
                    record.source_chain(),
                    other.event_id
                )));
            }
        }
        self.transfers
            .insert(record.event_id.clone(), record.clone());
        Ok(())
    }

    pub fn pending(&self) -> Vec<TransferRecord> {
        let mut pending: Vec<TransferRecord> = self
            .transfers
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            (a.source_chain(), a.nonce()).cmp(&(b.source_chain(), b.nonce()))
        });
        pending
    }

    pub fn list(&self, status: Option<TransferStatus>, limit: usize) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self
            .transfers
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        records
    }

    pub fn by_account(&self, account: Address, limit: usize) -> Vec<TransferRecord> {
        let mut records: Vec<TransferRecord> = self
            .transfers
            .values()
            .filter(|r| r.event.account == account)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        records
    }

    pub fn checkpoints(&self) -> Vec<ChainCheckpoint> {
        self.blocks
            .iter()
            .map(|(chain, block)| ChainCheckpoint {
                chain: chain.clone(),
                last_processed_block: *block,
            })
            .collect()
    }
}
