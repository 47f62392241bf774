//! Relayer engine
//!
//! Owns one pipeline per configured route and the state they share: the
//! checkpoint store, the message codec, the store availability gate and the
//! terminal-event cache. `EngineHandle` exposes the operator actions.

pub mod gate;
pub mod health;
mod pipeline;
pub mod watermark;

use alloy::primitives::Address;
use eyre::{eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::auth::Authorizer;
use crate::bounded_cache::{TerminalCache, DEFAULT_TERMINAL_CACHE_SIZE, DEFAULT_TERMINAL_CACHE_TTL_SECS};
use crate::chain::{DestinationChain, SourceChain};
use crate::codec::MessageCodec;
use crate::metrics;
use crate::store::{CheckpointStore, StoreError};
use crate::submitter::retry::RetryConfig;
use crate::types::{ChainName, EventId, TransferRecord, TransitionError};
use crate::watcher::WatcherConfig;

pub use gate::StoreGate;
pub use health::{ChainHealth, EngineHealth, ReorgFlag};
pub use watermark::Watermark;

use pipeline::Pipeline;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded work queue per pipeline; a full queue pauses ingestion
    pub queue_capacity: usize,
    /// Concurrent confirmation waits per pipeline
    pub max_in_flight: usize,
    pub confirmation_timeout: Duration,
    pub rescan_interval: Duration,
    pub receipt_poll_interval: Duration,
    pub retry: RetryConfig,
    pub terminal_cache_size: usize,
    pub terminal_cache_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_in_flight: 8,
            confirmation_timeout: Duration::from_secs(300),
            rescan_interval: Duration::from_secs(30),
            receipt_poll_interval: Duration::from_secs(2),
            retry: RetryConfig::default(),
            terminal_cache_size: DEFAULT_TERMINAL_CACHE_SIZE,
            terminal_cache_ttl_secs: DEFAULT_TERMINAL_CACHE_TTL_SECS,
        }
    }
}

/// A directed `source -> dest` pair
pub struct Route {
    pub source: Arc<dyn SourceChain>,
    pub dest: Arc<dyn DestinationChain>,
    /// Destination contract releasing the transfers of each source bridge
    pub gateways: BTreeMap<Address, Address>,
    pub authorizer: Arc<dyn Authorizer>,
    pub watcher: WatcherConfig,
    /// First block scanned when the source has no checkpoint
    pub start_block: u64,
    /// Destination blocks a release receipt must be buried under
    pub dest_confirmations: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("route source and destination are both {0}")]
    SameChain(ChainName),
    #[error("source chain {0} already has a route")]
    DuplicateSource(ChainName),
    #[error("route from {0} watches no bridge contract")]
    NoBridges(ChainName),
    #[error("bridge {bridge} on {chain} has no destination gateway")]
    UnmappedBridge { chain: ChainName, bridge: Address },
    #[error("no pipeline watches chain {0}")]
    UnknownChain(ChainName),
    #[error("no transfer recorded for {0}")]
    NotFound(EventId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// State shared by every pipeline
#[derive(Clone)]
pub(crate) struct Shared {
    pub store: Arc<dyn CheckpointStore>,
    pub codec: Arc<MessageCodec>,
    pub gate: Arc<StoreGate>,
    pub health: Arc<EngineHealth>,
    pub terminal: Arc<Mutex<TerminalCache>>,
    pub config: EngineConfig,
}

pub struct RelayerEngine {
    shared: Shared,
    pipelines: Vec<Arc<Pipeline>>,
    resets: HashMap<ChainName, Arc<Notify>>,
}

impl RelayerEngine {
    pub fn new(store: Arc<dyn CheckpointStore>, codec: MessageCodec, config: EngineConfig) -> Self {
        let terminal = TerminalCache::new(config.terminal_cache_size, config.terminal_cache_ttl_secs);
        Self {
            shared: Shared {
                store,
                codec: Arc::new(codec),
                gate: Arc::new(StoreGate::new()),
                health: Arc::new(EngineHealth::new()),
                terminal: Arc::new(Mutex::new(terminal)),
                config,
            },
            pipelines: Vec::new(),
            resets: HashMap::new(),
        }
    }

    /// Register a route. Each source chain has one pipeline, which watches all
    /// of its bridge contracts and owns that chain's checkpoint.
    pub fn add_route(&mut self, route: Route) -> Result<(), EngineError> {
        let source = route.source.name().clone();
        if &source == route.dest.name() {
            return Err(EngineError::SameChain(source));
        }
        if self.resets.contains_key(&source) {
            return Err(EngineError::DuplicateSource(source));
        }
        if route.source.bridges().is_empty() || route.gateways.is_empty() {
            return Err(EngineError::NoBridges(source));
        }
        if let Some(bridge) = route
            .source
            .bridges()
            .iter()
            .find(|bridge| !route.gateways.contains_key(*bridge))
        {
            return Err(EngineError::UnmappedBridge {
                chain: source,
                bridge: *bridge,
            });
        }

        let reset = Arc::new(Notify::new());
        let pipeline = Pipeline::new(route, self.shared.clone(), reset.clone());
        info!(route = %pipeline.label(), "Route registered");
        self.resets.insert(source, reset);
        self.pipelines.push(Arc::new(pipeline));
        Ok(())
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
            resets: Arc::new(self.resets.clone()),
        }
    }

    /// Run every pipeline until shutdown or until one of them fails
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        if self.pipelines.is_empty() {
            return Err(eyre!("no routes configured"));
        }

        let mut join_set = tokio::task::JoinSet::new();
        for pipeline in self.pipelines {
            join_set.spawn(pipeline.run());
        }

        let gate = self.shared.gate.clone();
        let store = self.shared.store.clone();
        let retry = self.shared.config.retry.clone();
        join_set.spawn(async move {
            gate.watch_recovery(store, retry).await;
            Ok(())
        });

        metrics::set_up(true);
        info!(routes = self.resets.len(), "Relayer engine running");

        let result = tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping pipelines");
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A pipeline exited unexpectedly without error");
                        Err(eyre!("pipeline exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A pipeline stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A pipeline task panicked: {:?}", e);
                        Err(eyre!("pipeline task panicked: {}", e))
                    }
                    None => {
                        error!("All pipeline tasks exited unexpectedly");
                        Err(eyre!("all pipeline tasks exited unexpectedly"))
                    }
                }
            }
        };

        join_set.abort_all();
        metrics::set_up(false);
        result
    }
}

/// Cloneable operator handle onto a running engine
#[derive(Clone)]
pub struct EngineHandle {
    shared: Shared,
    resets: Arc<HashMap<ChainName, Arc<Notify>>>,
}

impl EngineHandle {
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.shared.store
    }

    pub fn health(&self) -> &Arc<EngineHealth> {
        &self.shared.health
    }

    pub fn store_available(&self) -> bool {
        self.shared.gate.is_open()
    }

    /// Source chains with a running pipeline
    pub fn chains(&self) -> Vec<ChainName> {
        let mut chains: Vec<_> = self.resets.keys().cloned().collect();
        chains.sort();
        chains
    }

    /// Move a FAILED transfer back to PENDING; the next rescan picks it up
    pub async fn requeue(&self, event_id: &EventId) -> Result<TransferRecord, EngineError> {
        let mut record = self
            .shared
            .store
            .load_transfer(event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(event_id.clone()))?;
        let previous_error = record.error_detail.clone();
        record.requeue()?;
        self.shared.store.upsert_transfer(&record).await?;
        self.shared
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_id);

        warn!(
            event_id = %event_id,
            nonce = record.nonce(),
            previous_error = ?previous_error,
            "Transfer requeued by operator"
        );
        Ok(record)
    }

    /// Overwrite a chain's checkpoint (may move backwards), clear its reorg
    /// flag and restart its watcher from `block + 1`
    pub async fn reset_checkpoint(&self, chain: &ChainName, block: u64) -> Result<(), EngineError> {
        let reset = self
            .resets
            .get(chain)
            .ok_or_else(|| EngineError::UnknownChain(chain.clone()))?;
        let previous = self.shared.store.load(chain).await?;
        self.shared.store.reset_checkpoint(chain, block).await?;
        self.shared.health.clear_reorg(chain);
        metrics::set_checkpoint(chain.as_str(), block);
        reset.notify_one();

        warn!(
            chain = %chain,
            previous = ?previous,
            block,
            "Checkpoint reset by operator"
        );
        Ok(())
    }
}
