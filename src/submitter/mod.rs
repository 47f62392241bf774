//! Idempotent destination submission
//!
//! The destination replay guard is consulted before every send attempt, so a
//! broadcast that landed but was never acknowledged locally is detected
//! instead of being sent twice. The release is signed once per submission;
//! retries re-send those bytes, which pins the relayer's account nonce.

pub mod retry;

use alloy::primitives::{Address, B256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{ChainError, DestinationChain, ReleaseCall, SignedRelease, TxReceipt};
use crate::metrics;

pub use retry::{classify_error, is_known_transaction, is_nonce_too_low, ErrorClass, RetryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Our transaction is in the mempool
    Broadcast(B256),
    /// The destination already processed this nonce
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Our transaction is final
    Confirmed(TxReceipt),
    /// Our transaction reverted but the nonce is processed, so another
    /// transaction completed the transfer
    ProcessedElsewhere,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("destination rejected transfer: {0}")]
    Rejected(String),
    #[error("submission failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("transaction {tx_hash} not confirmed within {timeout:?}")]
    Timeout { tx_hash: B256, timeout: Duration },
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: B256 },
}

impl SubmitError {
    /// Whether the record should stay SUBMITTED for a later rescan
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Timeout { .. })
    }
}

/// Signed transaction carried across the attempts of one submission
#[derive(Default)]
struct Attempt {
    signed: Option<SignedRelease>,
    /// A broadcast of `signed` failed in a way that does not prove it was dropped
    maybe_sent: bool,
}

pub struct Submitter {
    dest: Arc<dyn DestinationChain>,
    retry: RetryConfig,
    /// Destination blocks a receipt must be buried under
    confirmations: u64,
    receipt_poll_interval: Duration,
}

impl Submitter {
    pub fn new(
        dest: Arc<dyn DestinationChain>,
        retry: RetryConfig,
        confirmations: u64,
        receipt_poll_interval: Duration,
    ) -> Self {
        Self {
            dest,
            retry,
            confirmations,
            receipt_poll_interval,
        }
    }

    pub fn destination(&self) -> &Arc<dyn DestinationChain> {
        &self.dest
    }

    /// Send the release unless the destination already processed its nonce.
    /// Transient errors are retried with backoff; everything else is final.
    pub async fn submit(&self, call: &ReleaseCall) -> Result<SubmitOutcome, SubmitError> {
        let chain = self.dest.name().clone();
        let mut state = Attempt::default();
        let mut attempt: u32 = 0;

        loop {
            let error = match self.try_send(call, &mut state).await {
                Ok(SubmitOutcome::Broadcast(tx_hash)) => {
                    info!(
                        chain = %chain,
                        gateway = %call.gateway,
                        nonce = call.nonce,
                        tx_hash = %tx_hash,
                        sender_nonce = state.signed.as_ref().map(|tx| tx.sender_nonce),
                        attempt,
                        "Release transaction broadcast"
                    );
                    metrics::record_submission(chain.as_str(), "broadcast");
                    return Ok(SubmitOutcome::Broadcast(tx_hash));
                }
                Ok(SubmitOutcome::AlreadyProcessed) | Err(ChainError::AlreadyProcessed(_)) => {
                    info!(
                        chain = %chain,
                        nonce = call.nonce,
                        "Nonce already processed on destination, skipping submission"
                    );
                    metrics::record_submission(chain.as_str(), "already_processed");
                    return Ok(SubmitOutcome::AlreadyProcessed);
                }
                Err(ChainError::Transient(e)) => e,
                Err(e) => {
                    warn!(
                        chain = %chain,
                        nonce = call.nonce,
                        error = %e,
                        "Destination rejected release"
                    );
                    metrics::record_submission(chain.as_str(), "rejected");
                    return Err(SubmitError::Rejected(e.to_string()));
                }
            };

            attempt += 1;
            if !self.retry.should_retry(attempt) {
                metrics::record_submission(chain.as_str(), "retries_exhausted");
                return Err(SubmitError::RetriesExhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }
            let backoff = self.retry.backoff_for_attempt(attempt - 1);
            warn!(
                chain = %chain,
                nonce = call.nonce,
                attempt,
                max = self.retry.max_retries,
                ?backoff,
                resend = state.signed.is_some(),
                error = %error,
                "Retrying submission after backoff"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// One replay-guard check plus one broadcast of the submission's signed tx
    async fn try_send(
        &self,
        call: &ReleaseCall,
        state: &mut Attempt,
    ) -> Result<SubmitOutcome, ChainError> {
        if self.dest.is_processed(call.gateway, call.nonce).await? {
            return Ok(SubmitOutcome::AlreadyProcessed);
        }

        let tx = match state.signed.take() {
            Some(tx) => tx,
            None => self.dest.prepare_release(call).await?,
        };
        let result = self.dest.broadcast(&tx).await;
        let tx_hash = tx.tx_hash;
        state.signed = Some(tx);

        match result {
            Ok(tx_hash) => Ok(SubmitOutcome::Broadcast(tx_hash)),
            Err(ChainError::Transient(e)) if is_known_transaction(&e) => {
                debug!(tx_hash = %tx_hash, "Node already holds the signed release");
                Ok(SubmitOutcome::Broadcast(tx_hash))
            }
            Err(ChainError::Transient(e)) if is_nonce_too_low(&e) => {
                if state.maybe_sent {
                    // Our earlier send most likely took the slot; confirmation decides
                    debug!(tx_hash = %tx_hash, "Sender nonce consumed after an unacknowledged send");
                    return Ok(SubmitOutcome::Broadcast(tx_hash));
                }
                // Another transaction from this key took the slot, sign again
                state.signed = None;
                Err(ChainError::Transient(e))
            }
            Err(ChainError::Transient(e)) => {
                state.maybe_sent = true;
                Err(ChainError::Transient(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until the receipt is `confirmations` deep, or `timeout` elapses
    pub async fn wait_confirmed(
        &self,
        tx_hash: B256,
        gateway: Address,
        nonce: u64,
        timeout: Duration,
    ) -> Result<Confirmation, SubmitError> {
        match tokio::time::timeout(timeout, self.poll_receipt(tx_hash, gateway, nonce)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Timeout { tx_hash, timeout }),
        }
    }

    async fn poll_receipt(
        &self,
        tx_hash: B256,
        gateway: Address,
        nonce: u64,
    ) -> Result<Confirmation, SubmitError> {
        let chain = self.dest.name();
        loop {
            match self.check_receipt(tx_hash, gateway, nonce).await {
                Ok(Some(confirmation)) => return Ok(confirmation),
                Ok(None) => {}
                Err(ChainCheck::Reverted) => return Err(SubmitError::Reverted { tx_hash }),
                Err(ChainCheck::Rpc(e)) => {
                    debug!(chain = %chain, tx_hash = %tx_hash, error = %e, "Receipt poll failed");
                }
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }

    async fn check_receipt(
        &self,
        tx_hash: B256,
        gateway: Address,
        nonce: u64,
    ) -> Result<Option<Confirmation>, ChainCheck> {
        let Some(receipt) = self.dest.receipt(tx_hash).await.map_err(ChainCheck::Rpc)? else {
            return Ok(None);
        };

        if !receipt.success {
            if self.dest.is_processed(gateway, nonce).await.map_err(ChainCheck::Rpc)? {
                return Ok(Some(Confirmation::ProcessedElsewhere));
            }
            return Err(ChainCheck::Reverted);
        }

        let head = self.dest.block_number().await.map_err(ChainCheck::Rpc)?;
        let depth = head.saturating_sub(receipt.block_number);
        if depth >= self.confirmations {
            return Ok(Some(Confirmation::Confirmed(receipt)));
        }
        debug!(
            chain = %self.dest.name(),
            tx_hash = %tx_hash,
            depth,
            required = self.confirmations,
            "Waiting for confirmations"
        );
        Ok(None)
    }
}

enum ChainCheck {
    Rpc(ChainError),
    Reverted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthArtifact;
    use crate::types::fixtures::{chain, event};
    use crate::types::ChainName;
    use alloy::primitives::Bytes;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedDest {
        processed: Mutex<bool>,
        /// Consumed one per broadcast; an empty script accepts the tx
        broadcast_results: Mutex<Vec<Result<(), ChainError>>>,
        prepares: Mutex<u8>,
        sent: Mutex<Vec<SignedRelease>>,
        receipt: Mutex<Option<TxReceipt>>,
        head: Mutex<u64>,
    }

    impl ScriptedDest {
        fn script(&self, results: Vec<Result<(), ChainError>>) {
            *self.broadcast_results.lock().unwrap() = results;
        }

        fn sends(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DestinationChain for ScriptedDest {
        fn name(&self) -> &ChainName {
            static NAME: std::sync::OnceLock<ChainName> = std::sync::OnceLock::new();
            NAME.get_or_init(|| chain("sepolia"))
        }

        async fn block_number(&self) -> Result<u64, ChainError> {
            Ok(*self.head.lock().unwrap())
        }

        async fn is_processed(&self, _gateway: Address, _nonce: u64) -> Result<bool, ChainError> {
            Ok(*self.processed.lock().unwrap())
        }

        async fn prepare_release(&self, call: &ReleaseCall) -> Result<SignedRelease, ChainError> {
            let mut prepares = self.prepares.lock().unwrap();
            let sender_nonce = *prepares;
            *prepares += 1;
            Ok(SignedRelease {
                gateway: call.gateway,
                nonce: call.nonce,
                sender_nonce: u64::from(sender_nonce),
                tx_hash: B256::repeat_byte(0xab + sender_nonce),
                raw: Bytes::from(vec![sender_nonce]),
            })
        }

        async fn broadcast(&self, tx: &SignedRelease) -> Result<B256, ChainError> {
            self.sent.lock().unwrap().push(tx.clone());
            let mut results = self.broadcast_results.lock().unwrap();
            if results.is_empty() {
                return Ok(tx.tx_hash);
            }
            results.remove(0).map(|()| tx.tx_hash)
        }

        async fn receipt(&self, _tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
            Ok(self.receipt.lock().unwrap().clone())
        }
    }

    fn call() -> ReleaseCall {
        let ev = event(7, 1, 0);
        ReleaseCall::new(
            &ev,
            Address::repeat_byte(0xd1),
            ev.token,
            AuthArtifact::Signature(Bytes::from(vec![0u8; 65])),
        )
    }

    fn submitter(dest: Arc<ScriptedDest>, confirmations: u64) -> Submitter {
        Submitter::new(
            dest,
            RetryConfig::new(3, Duration::from_millis(1)),
            confirmations,
            Duration::from_millis(2),
        )
    }

    #[tokio::test]
    async fn test_submit_broadcasts() {
        let dest = Arc::new(ScriptedDest::default());
        let outcome = submitter(dest.clone(), 0).submit(&call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Broadcast(B256::repeat_byte(0xab)));
        assert_eq!(dest.sends(), 1);
        assert_eq!(dest.sent.lock().unwrap()[0].gateway, Address::repeat_byte(0xd1));
    }

    #[tokio::test]
    async fn test_processed_nonce_is_never_sent() {
        let dest = Arc::new(ScriptedDest::default());
        *dest.processed.lock().unwrap() = true;
        let outcome = submitter(dest.clone(), 0).submit(&call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyProcessed);
        assert_eq!(dest.sends(), 0);
        assert_eq!(*dest.prepares.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_revert_counts_as_processed() {
        let dest = Arc::new(ScriptedDest::default());
        dest.script(vec![Err(ChainError::from_message(
            "execution reverted: Nonce already processed",
        ))]);
        let outcome = submitter(dest, 0).submit(&call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_not_retried() {
        let dest = Arc::new(ScriptedDest::default());
        dest.script(vec![Err(ChainError::from_message(
            "execution reverted: Invalid signature",
        ))]);
        let err = submitter(dest.clone(), 0).submit(&call()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Rejected(_)));
        assert_eq!(dest.sends(), 1);
    }

    #[tokio::test]
    async fn test_transient_retries_resend_the_same_signed_tx() {
        let dest = Arc::new(ScriptedDest::default());
        dest.script(vec![
            Err(ChainError::Transient("timeout".into())),
            Err(ChainError::Transient("503".into())),
        ]);
        let outcome = submitter(dest.clone(), 0).submit(&call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Broadcast(B256::repeat_byte(0xab)));
        assert_eq!(*dest.prepares.lock().unwrap(), 1);

        let sent = dest.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|tx| tx.sender_nonce == 0 && tx.raw == sent[0].raw));
    }

    #[tokio::test]
    async fn test_unacknowledged_send_is_not_signed_twice() {
        let dest = Arc::new(ScriptedDest::default());
        // The node took the first send but the response was lost
        dest.script(vec![
            Err(ChainError::Transient("request timed out".into())),
            Err(ChainError::from_message("RPC error: -32000 - already known")),
        ]);
        let outcome = submitter(dest.clone(), 0).submit(&call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Broadcast(B256::repeat_byte(0xab)));
        assert_eq!(*dest.prepares.lock().unwrap(), 1);
        assert_eq!(dest.sends(), 2);
    }

    #[tokio::test]
    async fn test_consumed_sender_nonce_after_lost_ack_keeps_first_tx() {
        let dest = Arc::new(ScriptedDest::default());
        dest.script(vec![
            Err(ChainError::Transient("connection reset".into())),
            Err(ChainError::from_message("nonce too low")),
        ]);
        let outcome = submitter(dest.clone(), 0).submit(&call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Broadcast(B256::repeat_byte(0xab)));
        assert_eq!(*dest.prepares.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nonce_taken_before_any_send_signs_again() {
        let dest = Arc::new(ScriptedDest::default());
        dest.script(vec![Err(ChainError::from_message("nonce too low"))]);
        let outcome = submitter(dest.clone(), 0).submit(&call()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Broadcast(B256::repeat_byte(0xac)));
        assert_eq!(*dest.prepares.lock().unwrap(), 2);
        assert_eq!(dest.sent.lock().unwrap()[1].sender_nonce, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let dest = Arc::new(ScriptedDest::default());
        dest.script((0..5).map(|_| Err(ChainError::Transient("timeout".into()))).collect());
        let err = submitter(dest.clone(), 0).submit(&call()).await.unwrap_err();
        assert!(matches!(err, SubmitError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(dest.sends(), 3);
        assert_eq!(*dest.prepares.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wait_confirmed_requires_depth() {
        let dest = Arc::new(ScriptedDest::default());
        let tx_hash = B256::repeat_byte(0xab);
        let gateway = Address::repeat_byte(0xd1);
        *dest.receipt.lock().unwrap() = Some(TxReceipt {
            tx_hash,
            block_number: 10,
            success: true,
        });
        *dest.head.lock().unwrap() = 11;

        let s = submitter(dest.clone(), 2);
        let err = s
            .wait_confirmed(tx_hash, gateway, 7, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Timeout { .. }));
        assert!(err.is_retryable());

        *dest.head.lock().unwrap() = 12;
        let confirmation = s
            .wait_confirmed(tx_hash, gateway, 7, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(matches!(confirmation, Confirmation::Confirmed(r) if r.block_number == 10));
    }

    #[tokio::test]
    async fn test_reverted_receipt() {
        let dest = Arc::new(ScriptedDest::default());
        let tx_hash = B256::repeat_byte(0xab);
        let gateway = Address::repeat_byte(0xd1);
        *dest.receipt.lock().unwrap() = Some(TxReceipt {
            tx_hash,
            block_number: 1,
            success: false,
        });
        let s = submitter(dest.clone(), 0);
        assert_eq!(
            s.wait_confirmed(tx_hash, gateway, 7, Duration::from_millis(200)).await,
            Err(SubmitError::Reverted { tx_hash })
        );

        *dest.processed.lock().unwrap() = true;
        assert_eq!(
            s.wait_confirmed(tx_hash, gateway, 7, Duration::from_millis(200)).await,
            Ok(Confirmation::ProcessedElsewhere)
        );
    }
}
