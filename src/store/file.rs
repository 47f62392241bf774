//! JSON file backend
//!
//! Two documents in one directory: `blocks.json` (`{chain: block}`) and
//! `transfers.json` (`{eventId: record}`). Each mutation is applied to the
//! in-memory copy, the affected document is rewritten through a temp file,
//! fsync, rename and a directory fsync, and the change is rolled back if any
//! of those steps fails.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CheckpointStore, StoreError, StoreState};
use crate::types::{ChainCheckpoint, ChainName, EventId, TransferRecord, TransferStatus};

const BLOCKS_FILE: &str = "blocks.json";
const TRANSFERS_FILE: &str = "transfers.json";
const WRITE_CHECK_FILE: &str = ".write-check";

pub struct FileStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open (or create) a store rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let blocks: BTreeMap<ChainName, u64> = read_document(&dir.join(BLOCKS_FILE)).await?;
        let transfers: BTreeMap<EventId, TransferRecord> =
            read_document(&dir.join(TRANSFERS_FILE)).await?;

        info!(
            path = %dir.display(),
            chains = blocks.len(),
            transfers = transfers.len(),
            "Opened file checkpoint store"
        );

        Ok(Self {
            dir,
            state: Mutex::new(StoreState { blocks, transfers }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    async fn write_blocks(&self, blocks: &BTreeMap<ChainName, u64>) -> Result<(), StoreError> {
        write_document(&self.dir.join(BLOCKS_FILE), blocks).await
    }

    async fn write_transfers(
        &self,
        transfers: &BTreeMap<EventId, TransferRecord>,
    ) -> Result<(), StoreError> {
        write_document(&self.dir.join(TRANSFERS_FILE), transfers).await
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn load(&self, chain: &ChainName) -> Result<Option<u64>, StoreError> {
        Ok(self.state.lock().await.blocks.get(chain).copied())
    }

    async fn save(&self, chain: &ChainName, block: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut next = StoreState {
            blocks: state.blocks.clone(),
            transfers: BTreeMap::new(),
        };
        if next.save(chain, block)? {
            self.write_blocks(&next.blocks).await?;
            state.blocks = next.blocks;
        }
        Ok(())
    }

    async fn reset_checkpoint(&self, chain: &ChainName, block: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut blocks = state.blocks.clone();
        blocks.insert(chain.clone(), block);
        self.write_blocks(&blocks).await?;
        state.blocks = blocks;
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<ChainCheckpoint>, StoreError> {
        Ok(self.state.lock().await.checkpoints())
    }

    async fn load_transfer(&self, event_id: &EventId) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self.state.lock().await.transfers.get(event_id).cloned())
    }

    async fn load_transfer_by_nonce(
        &self,
        chain: &ChainName,
        bridge: Address,
        nonce: u64,
    ) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self.state.lock().await.by_replay_key(chain, bridge, nonce).cloned())
    }

    async fn transfers_by_nonce(
        &self,
        chain: &ChainName,
        nonce: u64,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.state.lock().await.by_nonce(chain, nonce))
    }

    async fn insert_if_absent(&self, record: &TransferRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.insert_if_absent(record) {
            return Ok(false);
        }
        if let Err(e) = self.write_transfers(&state.transfers).await {
            state.transfers.remove(&record.event_id);
            return Err(e);
        }
        Ok(true)
    }

    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let previous = state.transfers.get(&record.event_id).cloned();
        state.upsert(record)?;
        if let Err(e) = self.write_transfers(&state.transfers).await {
            match previous {
                Some(previous) => state.transfers.insert(record.event_id.clone(), previous),
                None => state.transfers.remove(&record.event_id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.state.lock().await.pending())
    }

    async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.state.lock().await.list(status, limit))
    }

    async fn list_by_account(
        &self,
        account: Address,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.state.lock().await.by_account(account, limit))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let path = self.dir.join(WRITE_CHECK_FILE);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(b"ok").await.map_err(|e| io_error(&path, e))?;
        file.sync_all().await.map_err(|e| io_error(&path, e))?;
        drop(file);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }
}

async fn read_document<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(io_error(path, e)),
    }
}

async fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
    let tmp = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| io_error(&tmp, e))?;
    file.write_all(&bytes).await.map_err(|e| io_error(&tmp, e))?;
    file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(path, e))?;
    if let Some(dir) = path.parent() {
        sync_dir(dir).await?;
    }
    debug!(path = %path.display(), bytes = bytes.len(), "Persisted store document");
    Ok(())
}

/// Persist the directory entry created by a rename
async fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| io_error(dir, e))?;
    handle.sync_all().await.map_err(|e| io_error(dir, e))
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", path.display(), e))
}
