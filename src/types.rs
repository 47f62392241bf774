//! Common types for cross-chain transfers
//!
//! `BridgeEvent` is the typed form of a lock/burn log, decoded once at the
//! chain boundary. `TransferRecord` is the relayer's persisted view of that
//! event's lifecycle and is only ever mutated by the pipeline that owns it.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Chain identifiers
// ============================================================================

/// Lowercase identifier of a configured chain (`amoy`, `sepolia`, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainName(String);

impl ChainName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidChainName> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(InvalidChainName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChainName {
    type Err = InvalidChainName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim().to_lowercase())
    }
}

impl TryFrom<String> for ChainName {
    type Error = InvalidChainName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChainName> for String {
    fn from(name: ChainName) -> Self {
        name.0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid chain name {0:?}: expected 1-64 chars of [a-z0-9_-]")]
pub struct InvalidChainName(pub String);

// ============================================================================
// Bridge events
// ============================================================================

/// Kind of asset moved by a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Fungible,
    NonFungible,
}

impl AssetKind {
    pub fn is_nft(&self) -> bool {
        matches!(self, AssetKind::NonFungible)
    }
}

/// One observed lock/burn occurrence on a source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub source_chain: ChainName,
    /// Bridge contract that emitted the event
    pub source_bridge: Address,
    pub dest_chain: ChainName,
    pub asset_kind: AssetKind,
    /// Asset contract on the source chain
    pub token: Address,
    /// Originating user, credited on the destination chain
    pub account: Address,
    /// Fungible amount or NFT token id
    pub amount_or_token_id: U256,
    /// Unique per source bridge contract
    pub nonce: u64,
    pub source_tx_hash: B256,
    pub source_block_hash: B256,
    pub source_block_number: u64,
    pub source_log_index: u64,
}

impl BridgeEvent {
    /// Unique id built from the event's provenance
    pub fn event_id(&self) -> EventId {
        EventId::from_provenance(
            &self.source_block_hash,
            &self.source_tx_hash,
            self.source_log_index,
        )
    }

    /// Ordering key used for delivery within a source chain
    pub fn position(&self) -> (u64, u64) {
        (self.source_block_number, self.source_log_index)
    }

    /// Nonces are only unique per source bridge contract
    pub fn replay_key(&self) -> (&ChainName, Address, u64) {
        (&self.source_chain, self.source_bridge, self.nonce)
    }
}

/// `(blockHash, txHash, logIndex)` rendered as `0x<block>:0x<tx>:<log>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn from_provenance(block_hash: &B256, tx_hash: &B256, log_index: u64) -> Self {
        Self(format!("{:#x}:{:#x}:{}", block_hash, tx_hash, log_index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 32-byte key for hash-keyed caches
    pub fn cache_key(&self) -> [u8; 32] {
        crate::codec::keccak256(self.0.as_bytes())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Transfer lifecycle
// ============================================================================

/// Processing status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Submitted => "submitted",
            TransferStatus::Confirmed => "confirmed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Confirmed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TransferStatus::Pending),
            "submitted" => Ok(TransferStatus::Submitted),
            "confirmed" => Ok(TransferStatus::Confirmed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal transfer transition {from} -> {to} for {event_id}")]
pub struct TransitionError {
    pub event_id: EventId,
    pub from: TransferStatus,
    pub to: TransferStatus,
}

/// The relayer's persisted view of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub event_id: EventId,
    pub event: BridgeEvent,
    /// Codec digest the authorization artifact was produced over
    pub message_hash: B256,
    pub status: TransferStatus,
    pub dest_tx_hash: Option<B256>,
    /// Submission / confirmation attempts that did not reach a terminal state
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_detail: Option<String>,
}

impl TransferRecord {
    /// Fresh PENDING record for a newly observed event
    pub fn new_pending(event: BridgeEvent, message_hash: B256) -> Self {
        let now = Utc::now();
        Self {
            event_id: event.event_id(),
            event,
            message_hash,
            status: TransferStatus::Pending,
            dest_tx_hash: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            error_detail: None,
        }
    }

    pub fn source_chain(&self) -> &ChainName {
        &self.event.source_chain
    }

    pub fn nonce(&self) -> u64 {
        self.event.nonce
    }

    /// Destination transaction broadcast. From PENDING this restarts the
    /// attempt count, which then counts confirmation checks of `tx_hash`.
    pub fn mark_submitted(&mut self, tx_hash: B256) -> Result<(), TransitionError> {
        let from = self.status;
        self.transition(TransferStatus::Submitted)?;
        if from == TransferStatus::Pending {
            self.attempts = 0;
        }
        self.dest_tx_hash = Some(tx_hash);
        Ok(())
    }

    /// Destination chain finalized the transfer. `tx_hash` is `None` when the
    /// nonce was found already processed and the completing tx is not ours.
    pub fn mark_confirmed(&mut self, tx_hash: Option<B256>) -> Result<(), TransitionError> {
        self.transition(TransferStatus::Confirmed)?;
        if tx_hash.is_some() {
            self.dest_tx_hash = tx_hash;
        }
        self.error_detail = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, detail: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TransferStatus::Failed)?;
        self.error_detail = Some(detail.into());
        Ok(())
    }

    /// Operator requeue of a FAILED transfer
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.transition(TransferStatus::Pending)?;
        self.attempts = 0;
        self.dest_tx_hash = None;
        Ok(())
    }

    /// Record a non-terminal attempt (transient failure, confirmation timeout)
    pub fn note_attempt(&mut self, detail: impl Into<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.error_detail = Some(detail.into());
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, to: TransferStatus) -> Result<(), TransitionError> {
        use TransferStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Pending, Submitted)
                | (Submitted, Submitted)
                | (Pending, Confirmed)
                | (Submitted, Confirmed)
                | (Pending, Failed)
                | (Submitted, Failed)
                | (Failed, Pending)
        );
        if !allowed {
            return Err(TransitionError {
                event_id: self.event_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Durable per-chain progress marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    pub chain: ChainName,
    pub last_processed_block: u64,
}
