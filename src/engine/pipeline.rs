//! One relay pipeline per directed chain pair
//!
//! Three long-running tasks share the pipeline state:
//! - ingestion consumes the watcher stream, records new transfers as PENDING
//!   and pushes them onto the bounded work queue
//! - the dispatcher authorizes and submits queued transfers in order, then
//!   hands each broadcast to a confirmation task
//! - the rescan loop re-enqueues PENDING/SUBMITTED records left behind by a
//!   restart, a timeout or a transient failure
//!
//! A record is held by at most one task at a time (`in_flight`).

use alloy::primitives::{Address, B256};
use chrono::Utc;
use eyre::{eyre, Result};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::watermark::Watermark;
use super::{Route, Shared};
use crate::auth::Authorizer;
use crate::chain::ReleaseCall;
use crate::metrics;
use crate::store::StoreError;
use crate::submitter::{Confirmation, SubmitOutcome, Submitter};
use crate::types::{BridgeEvent, ChainName, EventId, TransferRecord, TransferStatus, TransitionError};
use crate::watcher::{ChainWatcher, WatchItem};

pub(crate) struct Pipeline {
    label: String,
    source: ChainName,
    dest: ChainName,
    watcher: ChainWatcher,
    start_block: u64,
    submitter: Submitter,
    gateways: BTreeMap<Address, Address>,
    authorizer: Arc<dyn Authorizer>,
    shared: Shared,
    reset: Arc<Notify>,
    watermark: tokio::sync::Mutex<Watermark>,
    in_flight: Mutex<HashSet<EventId>>,
}

impl Pipeline {
    pub(crate) fn new(route: Route, shared: Shared, reset: Arc<Notify>) -> Self {
        let source = route.source.name().clone();
        let dest = route.dest.name().clone();
        let label = format!("{}->{}", source, dest);
        let watcher = ChainWatcher::new(route.source, dest.clone(), route.watcher);
        let submitter = Submitter::new(
            route.dest,
            shared.config.retry.clone(),
            route.dest_confirmations,
            shared.config.receipt_poll_interval,
        );
        shared.health.register(&source);

        Self {
            label,
            source,
            dest,
            watcher,
            start_block: route.start_block,
            submitter,
            gateways: route.gateways,
            authorizer: route.authorizer,
            shared,
            reset,
            watermark: tokio::sync::Mutex::new(Watermark::new(None)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Run ingestion, dispatch and rescan until one of them stops
    pub(crate) async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            route = %self.label,
            auth = %self.authorizer.scheme(),
            relayer = %self.authorizer.relayer_address(),
            start_block = self.start_block,
            bridges = self.gateways.len(),
            "Starting relay pipeline"
        );

        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity.max(1));
        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().ingest(tx.clone()));
        tasks.spawn(self.clone().rescan(tx));
        tasks.spawn(self.clone().dispatch(rx));

        let result = match tasks.join_next().await {
            Some(Ok(Ok(()))) => Err(eyre!("pipeline {} task exited unexpectedly", self.label)),
            Some(Ok(Err(e))) => Err(e.wrap_err(format!("pipeline {} failed", self.label))),
            Some(Err(e)) => Err(eyre!("pipeline {} task panicked: {}", self.label, e)),
            None => Err(eyre!("pipeline {} has no tasks", self.label)),
        };
        tasks.abort_all();
        result
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    async fn ingest(self: Arc<Self>, queue: mpsc::Sender<TransferRecord>) -> Result<()> {
        loop {
            self.shared.gate.wait_open().await;

            let checkpoint = match self.shared.store.load(&self.source).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    self.store_failed(&e).await;
                    continue;
                }
            };
            let from_block = checkpoint.map_or(self.start_block, |block| block + 1);
            self.watermark.lock().await.restart(checkpoint);
            if let Some(block) = checkpoint {
                metrics::set_checkpoint(self.source.as_str(), block);
            }

            let stream = self.watcher.watch(from_block);
            futures::pin_mut!(stream);

            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    _ = self.reset.notified() => {
                        info!(route = %self.label, "Checkpoint reset, restarting watcher");
                        break;
                    }
                };
                let Some(item) = item else {
                    break;
                };
                // Another pipeline lost the store; the item is redelivered after the restart
                if !self.shared.gate.is_open() {
                    break;
                }

                match self.handle_item(item, &queue).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            route = %self.label,
                            "Watcher halted on reorg, waiting for an operator checkpoint reset"
                        );
                        self.reset.notified().await;
                        break;
                    }
                    Err(e) => {
                        self.store_failed(&e).await;
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` when ingestion must halt
    async fn handle_item(
        &self,
        item: WatchItem,
        queue: &mpsc::Sender<TransferRecord>,
    ) -> Result<bool, StoreError> {
        match item {
            WatchItem::Event(event) => self.ingest_event(event, queue).await?,
            WatchItem::RangeScanned { to_block, .. } => {
                self.watermark.lock().await.scanned(to_block);
                self.shared.health.set_scanned(&self.source, to_block);
                self.advance_checkpoint().await?;
            }
            WatchItem::LivenessAlert {
                consecutive_failures,
                error,
            } => {
                error!(
                    route = %self.label,
                    consecutive_failures,
                    error = %error,
                    "Source chain liveness alert"
                );
                self.shared
                    .health
                    .set_liveness(&self.source, true, consecutive_failures);
                metrics::record_error(self.source.as_str(), "source_unreachable");
            }
            WatchItem::Recovered => self.shared.health.set_liveness(&self.source, false, 0),
            WatchItem::ReorgDetected {
                block_number,
                expected,
                found,
            } => {
                self.shared
                    .health
                    .flag_reorg(&self.source, block_number, expected, found);
                metrics::record_reorg(self.source.as_str());
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn ingest_event(
        &self,
        event: BridgeEvent,
        queue: &mpsc::Sender<TransferRecord>,
    ) -> Result<(), StoreError> {
        let event_id = event.event_id();
        if !self.gateways.contains_key(&event.source_bridge) {
            error!(
                route = %self.label,
                event_id = %event_id,
                bridge = %event.source_bridge,
                "Event from a bridge with no destination gateway, skipping"
            );
            metrics::record_error(self.source.as_str(), "unmapped_bridge");
            return Ok(());
        }
        if self.is_known_terminal(&event_id) {
            debug!(route = %self.label, event_id = %event_id, "Event already completed, skipping");
            return Ok(());
        }

        let block = event.source_block_number;
        // Tracked before the lookup so a concurrent completion is never missed
        self.watermark.lock().await.track(block, &event_id);

        if let Some(existing) = self.shared.store.load_transfer(&event_id).await? {
            if existing.status.is_terminal() {
                self.retire(&existing).await?;
            } else {
                debug!(
                    route = %self.label,
                    event_id = %event_id,
                    status = %existing.status,
                    "Transfer already recorded"
                );
            }
            return Ok(());
        }

        if let Some(existing) = self
            .shared
            .store
            .load_transfer_by_nonce(&self.source, event.source_bridge, event.nonce)
            .await?
        {
            warn!(
                route = %self.label,
                bridge = %event.source_bridge,
                nonce = event.nonce,
                event_id = %event_id,
                recorded_as = %existing.event_id,
                "Nonce already recorded under another event, skipping"
            );
            self.watermark.lock().await.complete(block, &event_id);
            return Ok(());
        }

        let message_hash = self.shared.codec.digest(&event);
        let record = TransferRecord::new_pending(event, message_hash);
        if !self.claim(&event_id) {
            return Ok(());
        }

        match self.shared.store.insert_if_absent(&record).await {
            Ok(true) => {}
            Ok(false) => {
                self.release(&event_id);
                self.watermark.lock().await.complete(block, &event_id);
                return Ok(());
            }
            Err(e) => {
                self.release(&event_id);
                return Err(e);
            }
        }

        info!(
            route = %self.label,
            event_id = %event_id,
            nonce = record.nonce(),
            block,
            asset = ?record.event.asset_kind,
            amount_or_token_id = %record.event.amount_or_token_id,
            message_hash = %record.message_hash,
            "Recorded new transfer"
        );
        self.enqueue(record, queue).await;
        Ok(())
    }

    async fn enqueue(&self, record: TransferRecord, queue: &mpsc::Sender<TransferRecord>) {
        let event_id = record.event_id.clone();
        metrics::inc_queue_depth(&self.label);
        if queue.send(record).await.is_err() {
            metrics::dec_queue_depth(&self.label);
            self.release(&event_id);
            error!(
                route = %self.label,
                event_id = %event_id,
                "Work queue closed, transfer left for the next rescan"
            );
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(self: Arc<Self>, mut queue: mpsc::Receiver<TransferRecord>) -> Result<()> {
        let max_in_flight = self.shared.config.max_in_flight.max(1);
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let mut confirmations = JoinSet::new();

        loop {
            tokio::select! {
                Some(joined) = confirmations.join_next(), if !confirmations.is_empty() => {
                    if let Err(e) = joined {
                        error!(route = %self.label, error = %e, "Confirmation task panicked");
                    }
                }
                record = queue.recv() => {
                    let Some(record) = record else {
                        return Err(eyre!("work queue closed"));
                    };
                    metrics::dec_queue_depth(&self.label);

                    self.shared.gate.wait_open().await;
                    let permit = permits.clone().acquire_owned().await?;
                    let Some(record) = self.process(record).await else {
                        continue;
                    };

                    let pipeline = self.clone();
                    let gauge = permits.clone();
                    confirmations.spawn(async move {
                        pipeline.confirm(record).await;
                        drop(permit);
                        metrics::set_in_flight(
                            &pipeline.label,
                            max_in_flight - gauge.available_permits(),
                        );
                    });
                    metrics::set_in_flight(&self.label, max_in_flight - permits.available_permits());
                }
            }
        }
    }

    /// Drive one queued record. Returns it when a broadcast needs confirming.
    async fn process(&self, record: TransferRecord) -> Option<TransferRecord> {
        let event_id = record.event_id.clone();
        // Queued copies can be stale; the store is authoritative
        let record = match self.shared.store.load_transfer(&event_id).await {
            Ok(Some(latest)) => latest,
            Ok(None) => record,
            Err(e) => {
                self.release(&event_id);
                self.store_failed(&e).await;
                return None;
            }
        };

        match record.status {
            TransferStatus::Pending => self.submit(record).await,
            TransferStatus::Submitted => self.resume(record).await,
            TransferStatus::Confirmed | TransferStatus::Failed => {
                let result = self.retire(&record).await;
                self.release(&event_id);
                if let Err(e) = result {
                    self.store_failed(&e).await;
                }
                None
            }
        }
    }

    async fn submit(&self, mut record: TransferRecord) -> Option<TransferRecord> {
        let event_id = record.event_id.clone();
        let Some(gateway) = self.gateway(&record) else {
            let detail = format!("UnmappedBridge: {}", record.event.source_bridge);
            self.fail(record, detail).await;
            return None;
        };

        let digest = self.shared.codec.digest(&record.event);
        if digest != record.message_hash {
            warn!(
                route = %self.label,
                event_id = %event_id,
                recorded = %record.message_hash,
                current = %digest,
                "Message hash changed since ingestion, using current encoding"
            );
            record.message_hash = digest;
        }

        let artifact = match self.authorizer.authorize(&digest).await {
            Ok(artifact) => artifact,
            Err(e) if e.is_transient() => {
                warn!(
                    route = %self.label,
                    event_id = %event_id,
                    error = %e,
                    "Authorization temporarily unavailable, leaving transfer pending"
                );
                record.note_attempt(format!("AuthorizationError: {}", e));
                self.persist(record).await;
                return None;
            }
            Err(e) => {
                self.fail(record, format!("AuthorizationError: {}", e)).await;
                return None;
            }
        };

        let call = ReleaseCall::new(
            &record.event,
            gateway,
            self.shared.codec.destination_token(&record.event),
            artifact,
        );
        match self.submitter.submit(&call).await {
            Ok(SubmitOutcome::Broadcast(tx_hash)) => {
                if let Err(e) = record.mark_submitted(tx_hash) {
                    self.transition_failed(&event_id, e);
                    return None;
                }
                // Keep waiting even if the store write fails so the tx is never sent twice
                if let Err(e) = self.shared.store.upsert_transfer(&record).await {
                    self.store_failed(&e).await;
                }
                Some(record)
            }
            Ok(SubmitOutcome::AlreadyProcessed) => {
                self.confirm_record(record, None).await;
                None
            }
            Err(e) => {
                self.fail(record, format!("SubmitError: {}", e)).await;
                None
            }
        }
    }

    /// A SUBMITTED record picked up again after a timeout or restart. The
    /// recorded transaction is never replaced: it is waited on again until the
    /// confirmation budget runs out, then the record fails for operator requeue.
    async fn resume(&self, record: TransferRecord) -> Option<TransferRecord> {
        let event_id = record.event_id.clone();
        let Some(gateway) = self.gateway(&record) else {
            let detail = format!("UnmappedBridge: {}", record.event.source_bridge);
            self.fail(record, detail).await;
            return None;
        };
        let recorded_tx = record.dest_tx_hash;
        match self
            .submitter
            .destination()
            .is_processed(gateway, record.nonce())
            .await
        {
            Ok(true) => {
                self.confirm_record(record, None).await;
                None
            }
            Ok(false) => match recorded_tx {
                Some(_) if record.attempts < self.shared.config.retry.max_retries => {
                    debug!(
                        route = %self.label,
                        event_id = %event_id,
                        attempts = record.attempts,
                        "Destination has not processed the nonce yet, waiting on recorded tx"
                    );
                    Some(record)
                }
                Some(tx_hash) => {
                    let detail = confirmation_exhausted(tx_hash, record.attempts);
                    self.fail(record, detail).await;
                    None
                }
                None => {
                    self.fail(record, "SubmitError: no destination transaction recorded".to_string())
                        .await;
                    None
                }
            },
            Err(e) => {
                warn!(
                    route = %self.label,
                    event_id = %event_id,
                    error = %e,
                    "Could not read destination replay guard, retrying on next rescan"
                );
                self.release(&event_id);
                None
            }
        }
    }

    async fn confirm(&self, mut record: TransferRecord) {
        let event_id = record.event_id.clone();
        let (Some(tx_hash), Some(gateway)) = (record.dest_tx_hash, self.gateway(&record)) else {
            self.release(&event_id);
            return;
        };

        let timeout = self.shared.config.confirmation_timeout;
        match self
            .submitter
            .wait_confirmed(tx_hash, gateway, record.nonce(), timeout)
            .await
        {
            Ok(Confirmation::Confirmed(receipt)) => {
                debug!(
                    route = %self.label,
                    event_id = %event_id,
                    tx_hash = %tx_hash,
                    block = receipt.block_number,
                    "Destination receipt final"
                );
                self.confirm_record(record, Some(tx_hash)).await;
            }
            Ok(Confirmation::ProcessedElsewhere) => self.confirm_record(record, None).await,
            Err(e) if e.is_retryable() => {
                record.note_attempt(e.to_string());
                if record.attempts >= self.shared.config.retry.max_retries {
                    let detail = confirmation_exhausted(tx_hash, record.attempts);
                    self.fail(record, detail).await;
                    return;
                }
                warn!(
                    route = %self.label,
                    event_id = %event_id,
                    tx_hash = %tx_hash,
                    attempts = record.attempts,
                    error = %e,
                    "Confirmation timed out, will re-check on rescan"
                );
                self.persist(record).await;
            }
            Err(e) => self.fail(record, format!("SubmitError: {}", e)).await,
        }
    }

    // ------------------------------------------------------------------
    // Rescan
    // ------------------------------------------------------------------

    async fn rescan(self: Arc<Self>, queue: mpsc::Sender<TransferRecord>) -> Result<()> {
        loop {
            self.shared.gate.wait_open().await;

            match self.shared.store.list_pending().await {
                Ok(records) => {
                    let mut requeued = 0usize;
                    let owned = records
                        .into_iter()
                        .filter(|r| r.source_chain() == &self.source && r.event.dest_chain == self.dest);
                    for record in owned {
                        if !self.claim(&record.event_id) {
                            continue;
                        }
                        self.watermark
                            .lock()
                            .await
                            .track(record.event.source_block_number, &record.event_id);
                        self.enqueue(record, &queue).await;
                        requeued += 1;
                    }
                    if requeued > 0 {
                        info!(route = %self.label, requeued, "Re-enqueued unfinished transfers");
                    }
                }
                Err(e) => self.store_failed(&e).await,
            }

            tokio::time::sleep(self.shared.config.rescan_interval).await;
        }
    }

    // ------------------------------------------------------------------
    // Record bookkeeping
    // ------------------------------------------------------------------

    async fn confirm_record(&self, mut record: TransferRecord, tx_hash: Option<B256>) {
        if let Err(e) = record.mark_confirmed(tx_hash) {
            self.transition_failed(&record.event_id, e);
            return;
        }
        info!(
            route = %self.label,
            event_id = %record.event_id,
            nonce = record.nonce(),
            tx_hash = ?record.dest_tx_hash,
            "Transfer confirmed"
        );
        self.finish(record).await;
    }

    async fn fail(&self, mut record: TransferRecord, detail: String) {
        if let Err(e) = record.mark_failed(detail.clone()) {
            self.transition_failed(&record.event_id, e);
            return;
        }
        error!(
            route = %self.label,
            event_id = %record.event_id,
            nonce = record.nonce(),
            error = %detail,
            "Transfer failed, manual requeue required"
        );
        metrics::record_error(self.dest.as_str(), "transfer_failed");
        self.finish(record).await;
    }

    /// Persist a terminal record, then release it
    async fn finish(&self, record: TransferRecord) {
        let event_id = record.event_id.clone();
        if let Err(e) = self.shared.store.upsert_transfer(&record).await {
            self.release(&event_id);
            self.store_failed(&e).await;
            return;
        }

        metrics::record_transfer(&self.label, record.status.as_str());
        if record.status == TransferStatus::Confirmed {
            let elapsed = Utc::now() - record.created_at;
            metrics::record_latency(&self.label, elapsed.num_milliseconds() as f64 / 1000.0);
        }

        let result = self.retire(&record).await;
        self.release(&event_id);
        if let Err(e) = result {
            self.store_failed(&e).await;
        }
    }

    /// Persist a non-terminal update and release the record for rescan
    async fn persist(&self, record: TransferRecord) {
        let result = self.shared.store.upsert_transfer(&record).await;
        self.release(&record.event_id);
        if let Err(e) = result {
            self.store_failed(&e).await;
        }
    }

    /// Forget a terminal record in the watermark and try to advance the checkpoint
    async fn retire(&self, record: &TransferRecord) -> Result<(), StoreError> {
        self.shared
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&record.event_id);
        self.watermark
            .lock()
            .await
            .complete(record.event.source_block_number, &record.event_id);
        self.advance_checkpoint().await
    }

    async fn advance_checkpoint(&self) -> Result<(), StoreError> {
        let mut watermark = self.watermark.lock().await;
        let Some(block) = watermark.candidate() else {
            return Ok(());
        };

        match self.shared.store.save(&self.source, block).await {
            Ok(()) => {
                watermark.commit(block);
                metrics::set_checkpoint(self.source.as_str(), block);
                debug!(
                    route = %self.label,
                    block,
                    outstanding = watermark.outstanding(),
                    "Checkpoint advanced"
                );
                Ok(())
            }
            Err(StoreError::Regression { current, .. }) => {
                warn!(
                    route = %self.label,
                    block,
                    current,
                    "Stored checkpoint is ahead of this pipeline, keeping it"
                );
                watermark.commit(current);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn store_failed(&self, error: &StoreError) {
        if error.closes_gate() {
            self.shared.gate.close(error);
        } else {
            warn!(route = %self.label, error = %error, "Store operation failed");
            metrics::record_error(self.source.as_str(), "store");
            tokio::time::sleep(self.shared.config.retry.initial_backoff).await;
        }
    }

    fn transition_failed(&self, event_id: &EventId, error: TransitionError) {
        error!(route = %self.label, event_id = %event_id, error = %error, "Rejected status transition");
        metrics::record_error(self.source.as_str(), "invalid_transition");
        self.release(event_id);
    }

    fn gateway(&self, record: &TransferRecord) -> Option<Address> {
        self.gateways.get(&record.event.source_bridge).copied()
    }

    fn is_known_terminal(&self, event_id: &EventId) -> bool {
        self.shared
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(event_id)
    }

    fn claim(&self, event_id: &EventId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_id.clone())
    }

    fn release(&self, event_id: &EventId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_id);
    }
}

fn confirmation_exhausted(tx_hash: B256, checks: u32) -> String {
    format!(
        "ConfirmationTimeout: tx {} unconfirmed after {} checks",
        tx_hash, checks
    )
}
