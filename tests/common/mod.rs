//! In-process mock chains and engine helpers shared by the integration tests

#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use bridge_relayer::auth::{AuthArtifact, Authorizer, MerkleTree, SingleSignerAuthorizer};
use bridge_relayer::chain::{
    ChainError, DestinationChain, ReleaseCall, RootSource, SignedRelease, SourceChain, TxReceipt,
};
use bridge_relayer::codec::{keccak256, MessageCodec};
use bridge_relayer::engine::health::ChainHealth;
use bridge_relayer::engine::{EngineConfig, EngineHandle, RelayerEngine, Route};
use bridge_relayer::store::CheckpointStore;
use bridge_relayer::submitter::retry::RetryConfig;
use bridge_relayer::types::{AssetKind, BridgeEvent, ChainName, TransferRecord, TransferStatus};
use bridge_relayer::watcher::WatcherConfig;

/// Anvil account #0
pub const RELAYER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn chain(name: &str) -> ChainName {
    ChainName::new(name).unwrap()
}

pub fn block_hash(block: u64, salt: u8) -> B256 {
    let mut seed = block.to_be_bytes().to_vec();
    seed.push(salt);
    B256::from(keccak256(&seed))
}

/// Fungible-token bridge, the default emitter of every mock source
pub fn erc20_bridge() -> Address {
    Address::repeat_byte(0xb1)
}

pub fn nft_bridge() -> Address {
    Address::repeat_byte(0xb2)
}

/// Destination contract paired with a source bridge in [`route`]
pub fn gateway_for(bridge: Address) -> Address {
    let mut raw = bridge.0 .0;
    raw[0] ^= 0xff;
    Address::from(raw)
}

// ============================================================================
// Source chain
// ============================================================================

struct SourceState {
    head: u64,
    events: Vec<BridgeEvent>,
    salt: u8,
    failing: bool,
}

pub struct MockSource {
    name: ChainName,
    dest: ChainName,
    bridges: Vec<Address>,
    state: Mutex<SourceState>,
}

impl MockSource {
    pub fn new(name: &str, dest: &str) -> Arc<Self> {
        Self::with_bridges(name, dest, vec![erc20_bridge()])
    }

    pub fn with_bridges(name: &str, dest: &str, bridges: Vec<Address>) -> Arc<Self> {
        Arc::new(Self {
            name: chain(name),
            dest: chain(dest),
            bridges,
            state: Mutex::new(SourceState {
                head: 0,
                events: Vec::new(),
                salt: 0,
                failing: false,
            }),
        })
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    /// Emit a fungible lock at `block` and return it
    pub fn lock(&self, nonce: u64, block: u64, log_index: u64) -> BridgeEvent {
        self.emit(nonce, block, log_index, AssetKind::Fungible)
    }

    pub fn emit(&self, nonce: u64, block: u64, log_index: u64, asset_kind: AssetKind) -> BridgeEvent {
        self.emit_from(erc20_bridge(), nonce, block, log_index, asset_kind)
    }

    pub fn emit_from(
        &self,
        bridge: Address,
        nonce: u64,
        block: u64,
        log_index: u64,
        asset_kind: AssetKind,
    ) -> BridgeEvent {
        let mut state = self.state.lock().unwrap();
        let mut tx_seed = nonce.to_be_bytes().to_vec();
        tx_seed.extend_from_slice(bridge.as_slice());
        let event = BridgeEvent {
            source_chain: self.name.clone(),
            source_bridge: bridge,
            dest_chain: self.dest.clone(),
            asset_kind,
            token: Address::repeat_byte(0x11),
            account: Address::repeat_byte(0x22),
            amount_or_token_id: U256::from(100 + nonce),
            nonce,
            source_tx_hash: B256::from(keccak256(&tx_seed)),
            source_block_hash: block_hash(block, state.salt),
            source_block_number: block,
            source_log_index: log_index,
        };
        state.events.push(event.clone());
        event
    }

    /// Replace every block hash, as a deep reorg would
    pub fn reorg(&self) {
        let mut state = self.state.lock().unwrap();
        state.salt = state.salt.wrapping_add(1);
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }
}

#[async_trait]
impl SourceChain for MockSource {
    fn name(&self) -> &ChainName {
        &self.name
    }

    fn bridges(&self) -> &[Address] {
        &self.bridges
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let state = self.state.lock().unwrap();
        if state.failing {
            return Err(ChainError::Transient("connection refused".into()));
        }
        Ok(state.head)
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok((number <= state.head).then(|| block_hash(number, state.salt)))
    }

    async fn bridge_events(
        &self,
        from_block: u64,
        to_block: u64,
        dest: &ChainName,
    ) -> Result<Vec<BridgeEvent>, ChainError> {
        let state = self.state.lock().unwrap();
        if state.failing {
            return Err(ChainError::Transient("connection refused".into()));
        }
        Ok(state
            .events
            .iter()
            .filter(|e| &e.dest_chain == dest)
            .filter(|e| (from_block..=to_block).contains(&e.source_block_number))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Destination chain
// ============================================================================

/// Scripted outcome of the next broadcast
enum Scripted {
    /// Rejected before the node accepts the tx
    Fail(ChainError),
    /// The node accepts the tx but the caller sees an error
    AcceptThenFail(ChainError),
}

#[derive(Default)]
struct DestState {
    head: u64,
    /// `(gateway, nonce)` pairs whose replay guard is set
    processed: HashSet<(Address, u64)>,
    /// Broadcast attempts per nonce, including rejected ones
    attempts: HashMap<u64, u32>,
    /// Transactions the node accepted, in order
    accepted: Vec<(B256, ReleaseCall)>,
    /// Signed but not necessarily sent
    signed: HashMap<B256, ReleaseCall>,
    /// Account nonce the next accepted tx must carry
    next_sender_nonce: u64,
    scripted: VecDeque<Scripted>,
    receipts: HashMap<B256, TxReceipt>,
    /// Mine each broadcast immediately
    auto_mine: bool,
    pending: Vec<(B256, Address, u64)>,
    root: B256,
    /// Relayer whose Merkle proofs are checked against `root`
    merkle_relayer: Option<Address>,
}

impl DestState {
    fn mine(&mut self, tx_hash: B256, gateway: Address, nonce: u64) {
        let head = self.head;
        self.processed.insert((gateway, nonce));
        self.receipts.insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                block_number: head,
                success: true,
            },
        );
    }

    fn accept(&mut self, tx: &SignedRelease, call: ReleaseCall) {
        self.next_sender_nonce += 1;
        self.accepted.push((tx.tx_hash, call));
        if self.auto_mine {
            self.mine(tx.tx_hash, tx.gateway, tx.nonce);
        } else {
            self.pending.push((tx.tx_hash, tx.gateway, tx.nonce));
        }
    }
}

pub struct MockDest {
    name: ChainName,
    state: Mutex<DestState>,
}

impl MockDest {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: chain(name),
            state: Mutex::new(DestState {
                head: 1_000,
                auto_mine: true,
                ..DestState::default()
            }),
        })
    }

    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().unwrap().auto_mine = auto_mine;
    }

    /// Mine every pending broadcast
    pub fn mine_pending(&self) {
        let mut state = self.state.lock().unwrap();
        for (tx_hash, gateway, nonce) in std::mem::take(&mut state.pending) {
            state.mine(tx_hash, gateway, nonce);
        }
    }

    /// Another relayer (or an earlier run) already delivered this nonce of
    /// the default bridge
    pub fn mark_processed(&self, nonce: u64) {
        self.state
            .lock()
            .unwrap()
            .processed
            .insert((gateway_for(erc20_bridge()), nonce));
    }

    /// Fail the next broadcast before the node accepts it
    pub fn push_error(&self, error: ChainError) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .push_back(Scripted::Fail(error));
    }

    /// Accept the next broadcast but report `error` to the caller
    pub fn push_lost_ack(&self, error: ChainError) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .push_back(Scripted::AcceptThenFail(error));
    }

    pub fn set_root(&self, root: B256, relayer: Address) {
        let mut state = self.state.lock().unwrap();
        state.root = root;
        state.merkle_relayer = Some(relayer);
    }

    pub fn attempts(&self, nonce: u64) -> u32 {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(&nonce)
            .copied()
            .unwrap_or(0)
    }

    /// Calls of every transaction the node accepted
    pub fn broadcasts(&self) -> Vec<ReleaseCall> {
        self.state
            .lock()
            .unwrap()
            .accepted
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn accepted_tx_hashes(&self) -> Vec<B256> {
        self.state
            .lock()
            .unwrap()
            .accepted
            .iter()
            .map(|(tx_hash, _)| *tx_hash)
            .collect()
    }

    pub fn broadcast_nonces(&self) -> Vec<u64> {
        self.broadcasts().iter().map(|c| c.nonce).collect()
    }
}

#[async_trait]
impl DestinationChain for MockDest {
    fn name(&self) -> &ChainName {
        &self.name
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn is_processed(&self, gateway: Address, nonce: u64) -> Result<bool, ChainError> {
        Ok(self.state.lock().unwrap().processed.contains(&(gateway, nonce)))
    }

    async fn prepare_release(&self, call: &ReleaseCall) -> Result<SignedRelease, ChainError> {
        let mut state = self.state.lock().unwrap();
        let sender_nonce = state.next_sender_nonce;
        let mut seed = call.gateway.to_vec();
        seed.extend_from_slice(&call.nonce.to_be_bytes());
        seed.extend_from_slice(&sender_nonce.to_be_bytes());
        let tx_hash = B256::from(keccak256(&seed));
        state.signed.insert(tx_hash, call.clone());

        Ok(SignedRelease {
            gateway: call.gateway,
            nonce: call.nonce,
            sender_nonce,
            tx_hash,
            raw: Bytes::from(seed),
        })
    }

    async fn broadcast(&self, tx: &SignedRelease) -> Result<B256, ChainError> {
        let mut state = self.state.lock().unwrap();
        *state.attempts.entry(tx.nonce).or_default() += 1;

        if state.accepted.iter().any(|(hash, _)| *hash == tx.tx_hash) {
            return if state.receipts.contains_key(&tx.tx_hash) {
                Err(ChainError::Transient("nonce too low".into()))
            } else {
                Err(ChainError::Transient("already known".into()))
            };
        }
        if tx.sender_nonce < state.next_sender_nonce {
            return Err(ChainError::Transient("nonce too low".into()));
        }
        let Some(call) = state.signed.get(&tx.tx_hash).cloned() else {
            return Err(ChainError::Rejected("unknown signed transaction".into()));
        };

        let lost_ack = match state.scripted.pop_front() {
            Some(Scripted::Fail(error)) => return Err(error),
            Some(Scripted::AcceptThenFail(error)) => Some(error),
            None => None,
        };
        if state.processed.contains(&(tx.gateway, tx.nonce)) {
            return Err(ChainError::from_message(
                "execution reverted: Nonce already processed",
            ));
        }
        if let (Some(relayer), AuthArtifact::MerkleProof(proof)) =
            (state.merkle_relayer, &call.artifact)
        {
            if !MerkleTree::verify(&relayer, proof, &state.root) {
                return Err(ChainError::from_message("execution reverted: Invalid proof"));
            }
        }

        state.accept(tx, call);
        match lost_ack {
            Some(error) => Err(error),
            None => Ok(tx.tx_hash),
        }
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }
}

#[async_trait]
impl RootSource for MockDest {
    async fn authorized_root(&self) -> Result<B256, ChainError> {
        Ok(self.state.lock().unwrap().root)
    }
}

// ============================================================================
// Engine helpers
// ============================================================================

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        queue_capacity: 16,
        max_in_flight: 4,
        confirmation_timeout: Duration::from_millis(300),
        rescan_interval: Duration::from_millis(50),
        receipt_poll_interval: Duration::from_millis(5),
        retry: RetryConfig::new(3, Duration::from_millis(5)),
        ..EngineConfig::default()
    }
}

pub fn watcher_config() -> WatcherConfig {
    WatcherConfig {
        confirmations: 2,
        poll_interval: Duration::from_millis(5),
        max_block_range: 50,
        retry: RetryConfig::new(3, Duration::from_millis(5)),
        alert_after_failures: 3,
    }
}

pub fn signer() -> Arc<dyn Authorizer> {
    Arc::new(SingleSignerAuthorizer::from_private_key(RELAYER_KEY).unwrap())
}

pub fn route(source: Arc<MockSource>, dest: Arc<MockDest>, authorizer: Arc<dyn Authorizer>) -> Route {
    let gateways = source
        .bridges
        .iter()
        .map(|bridge| (*bridge, gateway_for(*bridge)))
        .collect();
    Route {
        source,
        dest,
        gateways,
        authorizer,
        watcher: watcher_config(),
        start_block: 0,
        dest_confirmations: 0,
    }
}

pub fn engine(
    store: Arc<dyn CheckpointStore>,
    source: Arc<MockSource>,
    dest: Arc<MockDest>,
    authorizer: Arc<dyn Authorizer>,
) -> RelayerEngine {
    let mut engine = RelayerEngine::new(store, MessageCodec::default(), engine_config());
    engine.add_route(route(source, dest, authorizer)).unwrap();
    engine
}

pub struct Running {
    pub handle: EngineHandle,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<eyre::Result<()>>,
}

impl Running {
    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

pub fn start(engine: RelayerEngine) -> Running {
    let handle = engine.handle();
    let (shutdown, rx) = mpsc::channel(1);
    let task = tokio::spawn(engine.run(rx));
    Running {
        handle,
        shutdown,
        task,
    }
}

/// Poll `check` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn record_for(store: &Arc<dyn CheckpointStore>, event: &BridgeEvent) -> Option<TransferRecord> {
    store.load_transfer(&event.event_id()).await.unwrap()
}

pub async fn wait_for_status(
    store: &Arc<dyn CheckpointStore>,
    event: &BridgeEvent,
    status: TransferStatus,
) -> bool {
    wait_until(Duration::from_secs(5), || async move {
        matches!(store.load_transfer(&event.event_id()).await, Ok(Some(r)) if r.status == status)
    })
    .await
}

pub async fn wait_for_checkpoint(store: &Arc<dyn CheckpointStore>, chain: &ChainName, at_least: u64) -> bool {
    wait_until(Duration::from_secs(5), || async move {
        matches!(store.load(chain).await, Ok(Some(b)) if b >= at_least)
    })
    .await
}

pub async fn wait_for_health<F>(handle: &EngineHandle, chain: &ChainName, check: F) -> bool
where
    F: Fn(&ChainHealth) -> bool,
{
    let check = &check;
    wait_until(Duration::from_secs(5), || async move {
        handle.health().chain(chain).is_some_and(|h| check(&h))
    })
    .await
}
