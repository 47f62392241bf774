//! Confirmation-gated event stream for one source chain
//!
//! The stream is lazy and infinite. It never yields an event above
//! `head - confirmations`, delivers each scanned range ordered by
//! `(block, log_index)` followed by a `RangeScanned` marker, and can be
//! rebuilt from any block after a restart.

use alloy::primitives::B256;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainError, SourceChain};
use crate::metrics;
use crate::submitter::retry::RetryConfig;
use crate::types::{BridgeEvent, ChainName};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Blocks an event must be buried under before delivery
    pub confirmations: u64,
    pub poll_interval: Duration,
    /// Largest `eth_getLogs` window
    pub max_block_range: u64,
    /// Backoff applied between failed polls
    pub retry: RetryConfig,
    /// Consecutive failed polls before a liveness alert
    pub alert_after_failures: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            confirmations: 12,
            poll_interval: Duration::from_secs(1),
            max_block_range: 1000,
            retry: RetryConfig::default(),
            alert_after_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchItem {
    Event(BridgeEvent),
    /// Every event in `[from_block, to_block]` has been yielded
    RangeScanned { from_block: u64, to_block: u64 },
    /// The last scanned block changed hash; the stream stops advancing
    ReorgDetected {
        block_number: u64,
        expected: B256,
        found: B256,
    },
    /// The source has failed `consecutive_failures` polls in a row
    LivenessAlert {
        consecutive_failures: u32,
        error: String,
    },
    /// First successful poll after a liveness alert
    Recovered,
}

pub struct ChainWatcher {
    source: Arc<dyn SourceChain>,
    dest: ChainName,
    config: WatcherConfig,
}

impl ChainWatcher {
    pub fn new(source: Arc<dyn SourceChain>, dest: ChainName, config: WatcherConfig) -> Self {
        Self {
            source,
            dest,
            config,
        }
    }

    pub fn chain(&self) -> &ChainName {
        self.source.name()
    }

    /// Stream of items starting at `from_block`
    pub fn watch(&self, from_block: u64) -> impl Stream<Item = WatchItem> + Send + 'static {
        let state = WatchState {
            source: self.source.clone(),
            dest: self.dest.clone(),
            config: self.config.clone(),
            next_block: from_block,
            last_scanned: None,
            last_nonce: None,
            buffered: VecDeque::new(),
            failures: 0,
            alerted: false,
            reorg: None,
        };
        info!(
            chain = %self.source.name(),
            dest = %self.dest,
            from_block,
            confirmations = self.config.confirmations,
            "Starting chain watcher"
        );
        stream::unfold(state, |mut state| async move {
            let item = state.next_item().await;
            Some((item, state))
        })
    }
}

struct WatchState {
    source: Arc<dyn SourceChain>,
    dest: ChainName,
    config: WatcherConfig,
    next_block: u64,
    /// `(number, hash)` of the last block of the last scanned range
    last_scanned: Option<(u64, B256)>,
    last_nonce: Option<u64>,
    buffered: VecDeque<WatchItem>,
    failures: u32,
    alerted: bool,
    reorg: Option<WatchItem>,
}

impl WatchState {
    async fn next_item(&mut self) -> WatchItem {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return item;
            }

            if let Some(reorg) = &self.reorg {
                tokio::time::sleep(self.config.poll_interval).await;
                return reorg.clone();
            }

            match self.poll().await {
                Ok(items) => {
                    let recovered = self.alerted;
                    self.failures = 0;
                    self.alerted = false;
                    metrics::set_watcher_failures(self.source.name().as_str(), 0);
                    if recovered {
                        info!(chain = %self.source.name(), "Chain watcher recovered");
                        self.buffered.push_back(WatchItem::Recovered);
                    }
                    if items.is_empty() && !recovered {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                    self.buffered.extend(items);
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    metrics::set_watcher_failures(self.source.name().as_str(), self.failures);
                    let backoff = self
                        .config
                        .retry
                        .backoff_for_attempt(self.failures.saturating_sub(1));
                    warn!(
                        chain = %self.source.name(),
                        error = %e,
                        consecutive_failures = self.failures,
                        ?backoff,
                        "Watcher poll failed"
                    );
                    if self.failures >= self.config.alert_after_failures && !self.alerted {
                        self.alerted = true;
                        error!(
                            chain = %self.source.name(),
                            consecutive_failures = self.failures,
                            "Source chain unreachable, raising liveness alert"
                        );
                        self.buffered.push_back(WatchItem::LivenessAlert {
                            consecutive_failures: self.failures,
                            error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// One poll. State only changes once every RPC call has succeeded.
    async fn poll(&mut self) -> Result<Vec<WatchItem>, ChainError> {
        let head = self.source.block_number().await?;

        if let Some((number, expected)) = self.last_scanned {
            let found = self.source.block_hash(number).await?.ok_or_else(|| {
                ChainError::Transient(format!("node does not have scanned block {}", number))
            })?;
            if found != expected {
                error!(
                    chain = %self.source.name(),
                    block = number,
                    expected = %expected,
                    found = %found,
                    "Reorg detected below the confirmation depth, halting watcher"
                );
                let item = WatchItem::ReorgDetected {
                    block_number: number,
                    expected,
                    found,
                };
                self.reorg = Some(item.clone());
                return Ok(vec![item]);
            }
        }

        let safe_head = head.saturating_sub(self.config.confirmations);
        if safe_head < self.next_block {
            debug!(
                chain = %self.source.name(),
                head,
                safe_head,
                next_block = self.next_block,
                "No new confirmed blocks"
            );
            return Ok(Vec::new());
        }

        let from_block = self.next_block;
        let to_block = safe_head.min(from_block.saturating_add(self.config.max_block_range.max(1) - 1));

        let mut events = self
            .source
            .bridge_events(from_block, to_block, &self.dest)
            .await?;
        let to_hash = self.source.block_hash(to_block).await?;

        events.sort_by_key(BridgeEvent::position);
        events.dedup_by(|a, b| a.event_id() == b.event_id());

        let mut last_nonce = self.last_nonce;
        for event in &events {
            if let Some(previous) = last_nonce {
                if event.nonce <= previous {
                    warn!(
                        chain = %self.source.name(),
                        nonce = event.nonce,
                        previous_nonce = previous,
                        block = event.source_block_number,
                        "Nonce did not increase in log order"
                    );
                }
            }
            last_nonce = Some(event.nonce);
        }

        if !events.is_empty() {
            info!(
                chain = %self.source.name(),
                from_block,
                to_block,
                events = events.len(),
                "Found bridge events"
            );
        }
        metrics::record_events_detected(self.source.name().as_str(), events.len() as u64);

        self.next_block = to_block + 1;
        self.last_scanned = to_hash.map(|hash| (to_block, hash));
        self.last_nonce = last_nonce;

        let mut items: Vec<WatchItem> = events.into_iter().map(WatchItem::Event).collect();
        items.push(WatchItem::RangeScanned {
            from_block,
            to_block,
        });
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{chain, event};
    use alloy::primitives::Address;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSource {
        head: Mutex<u64>,
        events: Mutex<Vec<BridgeEvent>>,
        hash_salt: Mutex<u8>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl SourceChain for ScriptedSource {
        fn name(&self) -> &ChainName {
            static NAME: std::sync::OnceLock<ChainName> = std::sync::OnceLock::new();
            NAME.get_or_init(|| chain("amoy"))
        }

        fn bridges(&self) -> &[Address] {
            &[]
        }

        async fn block_number(&self) -> Result<u64, ChainError> {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChainError::Transient("connection refused".into()));
            }
            Ok(*self.head.lock().unwrap())
        }

        async fn block_hash(&self, number: u64) -> Result<Option<B256>, ChainError> {
            let salt = *self.hash_salt.lock().unwrap();
            let mut hash = B256::with_last_byte(number as u8);
            hash.0[0] = salt;
            Ok(Some(hash))
        }

        async fn bridge_events(
            &self,
            from_block: u64,
            to_block: u64,
            _dest: &ChainName,
        ) -> Result<Vec<BridgeEvent>, ChainError> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| (from_block..=to_block).contains(&e.source_block_number))
                .cloned()
                .collect())
        }
    }

    fn fast_config(confirmations: u64) -> WatcherConfig {
        WatcherConfig {
            confirmations,
            poll_interval: Duration::from_millis(5),
            max_block_range: 100,
            retry: RetryConfig::new(3, Duration::from_millis(1)),
            alert_after_failures: 2,
        }
    }

    fn watcher(source: Arc<ScriptedSource>, confirmations: u64) -> ChainWatcher {
        ChainWatcher::new(source, chain("sepolia"), fast_config(confirmations))
    }

    #[tokio::test]
    async fn test_orders_events_and_marks_range() {
        let source = Arc::new(ScriptedSource::default());
        *source.head.lock().unwrap() = 10;
        // delivered by the node out of order
        *source.events.lock().unwrap() = vec![event(3, 5, 0), event(1, 2, 4), event(2, 2, 7)];

        let stream = watcher(source, 0).watch(1);
        let items: Vec<WatchItem> = stream.take(4).collect().await;
        let nonces: Vec<u64> = items
            .iter()
            .filter_map(|i| match i {
                WatchItem::Event(e) => Some(e.nonce),
                _ => None,
            })
            .collect();
        assert_eq!(nonces, vec![1, 2, 3]);
        assert_eq!(
            items[3],
            WatchItem::RangeScanned {
                from_block: 1,
                to_block: 10
            }
        );
    }

    #[tokio::test]
    async fn test_respects_confirmation_depth() {
        let source = Arc::new(ScriptedSource::default());
        *source.head.lock().unwrap() = 10;
        *source.events.lock().unwrap() = vec![event(1, 4, 0), event(2, 9, 0)];

        let stream = watcher(source.clone(), 3).watch(1);
        futures::pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(WatchItem::Event(e)) if e.nonce == 1));
        assert_eq!(
            stream.next().await,
            Some(WatchItem::RangeScanned {
                from_block: 1,
                to_block: 7
            })
        );

        *source.head.lock().unwrap() = 12;
        assert!(matches!(stream.next().await, Some(WatchItem::Event(e)) if e.nonce == 2));
    }

    #[tokio::test]
    async fn test_bounded_block_range() {
        let source = Arc::new(ScriptedSource::default());
        *source.head.lock().unwrap() = 250;

        let stream = watcher(source, 0).watch(1);
        let items: Vec<WatchItem> = stream.take(3).collect().await;
        assert_eq!(
            items,
            vec![
                WatchItem::RangeScanned { from_block: 1, to_block: 100 },
                WatchItem::RangeScanned { from_block: 101, to_block: 200 },
                WatchItem::RangeScanned { from_block: 201, to_block: 250 },
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_from_block() {
        let source = Arc::new(ScriptedSource::default());
        *source.head.lock().unwrap() = 10;
        *source.events.lock().unwrap() = vec![event(1, 2, 0), event(2, 8, 0)];

        let stream = watcher(source, 0).watch(5);
        futures::pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(WatchItem::Event(e)) if e.nonce == 2));
    }

    #[tokio::test]
    async fn test_liveness_alert_then_recovery() {
        let source = Arc::new(ScriptedSource::default());
        *source.head.lock().unwrap() = 5;
        *source.failures_left.lock().unwrap() = 3;

        let stream = watcher(source, 0).watch(1);
        futures::pin_mut!(stream);
        assert!(matches!(
            stream.next().await,
            Some(WatchItem::LivenessAlert { consecutive_failures: 2, .. })
        ));
        assert_eq!(stream.next().await, Some(WatchItem::Recovered));
        assert!(matches!(
            stream.next().await,
            Some(WatchItem::RangeScanned { to_block: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_reorg_halts_stream() {
        let source = Arc::new(ScriptedSource::default());
        *source.head.lock().unwrap() = 5;
        *source.events.lock().unwrap() = vec![event(1, 7, 0)];

        let stream = watcher(source.clone(), 0).watch(1);
        futures::pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(WatchItem::RangeScanned { .. })));

        *source.hash_salt.lock().unwrap() = 0xff;
        *source.head.lock().unwrap() = 8;
        assert!(matches!(
            stream.next().await,
            Some(WatchItem::ReorgDetected { block_number: 5, .. })
        ));
        // no further events while halted
        assert!(matches!(stream.next().await, Some(WatchItem::ReorgDetected { .. })));
    }
}
