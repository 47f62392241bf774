//! Chain seams
//!
//! The engine only talks to chains through these traits. `evm` provides the
//! JSON-RPC implementation; tests plug in-process mocks in behind them.

pub mod contracts;
pub mod evm;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::auth::AuthArtifact;
use crate::submitter::retry::{classify_error, ErrorClass};
use crate::types::{AssetKind, BridgeEvent, ChainName};

pub use evm::{EvmChain, EvmChainConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("transient chain error: {0}")]
    Transient(String),
    #[error("nonce already processed on destination: {0}")]
    AlreadyProcessed(String),
    #[error("destination rejected authorization: {0}")]
    InvalidAuthorization(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("malformed chain data: {0}")]
    Decode(String),
}

impl ChainError {
    /// Map a raw RPC / revert message onto a typed error
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorClass::AlreadyProcessed => ChainError::AlreadyProcessed(message),
            ErrorClass::InvalidAuthorization => ChainError::InvalidAuthorization(message),
            ErrorClass::Permanent => ChainError::Rejected(message),
            ErrorClass::Transient | ErrorClass::Unknown => ChainError::Transient(message),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

/// Destination entry point used to deliver a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMethod {
    Mint,
    Release,
    Unlock,
}

impl ReleaseMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseMethod::Mint => "mint",
            ReleaseMethod::Release => "release",
            ReleaseMethod::Unlock => "unlock",
        }
    }
}

impl fmt::Display for ReleaseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mint" => Ok(ReleaseMethod::Mint),
            "release" => Ok(ReleaseMethod::Release),
            "unlock" => Ok(ReleaseMethod::Unlock),
            other => Err(format!(
                "unknown release method {:?} (expected mint, release or unlock)",
                other
            )),
        }
    }
}

/// Fully-resolved destination call for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCall {
    /// Destination bridge contract paired with the event's source bridge
    pub gateway: Address,
    pub token: Address,
    pub to: Address,
    pub amount_or_token_id: U256,
    pub nonce: u64,
    pub asset_kind: AssetKind,
    pub artifact: AuthArtifact,
}

impl ReleaseCall {
    pub fn new(
        event: &BridgeEvent,
        gateway: Address,
        dest_token: Address,
        artifact: AuthArtifact,
    ) -> Self {
        Self {
            gateway,
            token: dest_token,
            to: event.account,
            amount_or_token_id: event.amount_or_token_id,
            nonce: event.nonce,
            asset_kind: event.asset_kind,
            artifact,
        }
    }

    /// `(isNft, tokenId)` argument pair of the destination call
    pub fn nft_args(&self) -> (bool, U256) {
        if self.asset_kind.is_nft() {
            (true, self.amount_or_token_id)
        } else {
            (false, U256::ZERO)
        }
    }
}

/// A release transaction signed with a fixed sender nonce.
///
/// Re-broadcasting the same bytes can never produce a second transaction,
/// so retries after an ambiguous send reuse it instead of signing again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRelease {
    pub gateway: Address,
    /// Bridge nonce being released
    pub nonce: u64,
    /// Account nonce of the relayer key
    pub sender_nonce: u64,
    pub tx_hash: B256,
    pub raw: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
}

/// Read side of a source chain
#[async_trait]
pub trait SourceChain: Send + Sync {
    fn name(&self) -> &ChainName;

    /// Bridge contracts watched on this chain
    fn bridges(&self) -> &[Address];

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Hash of block `number`, `None` if the node does not have it
    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ChainError>;

    /// Lock/burn events of every watched bridge in `[from_block, to_block]`,
    /// addressed to `dest`. Logs that cannot be decoded are reported and skipped.
    async fn bridge_events(
        &self,
        from_block: u64,
        to_block: u64,
        dest: &ChainName,
    ) -> Result<Vec<BridgeEvent>, ChainError>;
}

/// Write side of a destination chain
#[async_trait]
pub trait DestinationChain: Send + Sync {
    fn name(&self) -> &ChainName;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Replay guard of `gateway` for `nonce`
    async fn is_processed(&self, gateway: Address, nonce: u64) -> Result<bool, ChainError>;

    /// Build and sign the mint/release/unlock call without sending it
    async fn prepare_release(&self, call: &ReleaseCall) -> Result<SignedRelease, ChainError>;

    /// Send signed bytes to the network, returning the tx hash
    async fn broadcast(&self, tx: &SignedRelease) -> Result<B256, ChainError>;

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError>;
}

/// Authoritative relayer-set Merkle root
#[async_trait]
pub trait RootSource: Send + Sync {
    async fn authorized_root(&self) -> Result<B256, ChainError>;
}

/// Root fixed at startup, for deployments that push roots out of band
#[derive(Debug, Clone)]
pub struct StaticRoot(pub B256);

#[async_trait]
impl RootSource for StaticRoot {
    async fn authorized_root(&self) -> Result<B256, ChainError> {
        Ok(self.0)
    }
}
