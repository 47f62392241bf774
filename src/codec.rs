//! Canonical cross-chain message encoding
//!
//! The destination contract recomputes the same digest on-chain as
//! `keccak256(abi.encodePacked(token, account, amountOrTokenId, nonce, isNft, tokenId))`,
//! so every byte here must match Solidity's packed encoding exactly.

use alloy::primitives::{Address, B256, U256};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

use crate::types::{BridgeEvent, ChainName};

/// 20 (token) + 20 (account) + 32 (amount) + 32 (nonce) + 1 (isNft) + 32 (tokenId)
pub const MESSAGE_LEN: usize = 137;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid token map entry {entry:?}: {reason}")]
    InvalidTokenMapping { entry: String, reason: String },
}

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// EIP-191 `"\x19Ethereum Signed Message:\n32" || digest` hash, what
/// `ecrecover` sees when the contract verifies a relayer signature
pub fn eth_signed_message_hash(digest: &B256) -> B256 {
    let mut data = Vec::with_capacity(28 + 32);
    data.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    data.extend_from_slice(digest.as_slice());
    B256::from(keccak256(&data))
}

/// Convert bytes32 to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Source token -> destination token, per source chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMap {
    entries: HashMap<(ChainName, Address), Address>,
}

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_chain: ChainName, source_token: Address, dest_token: Address) {
        self.entries
            .insert((source_chain, source_token), dest_token);
    }

    /// Parse `chain:0xsrc=0xdest,...`
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let mut map = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let invalid = |reason: &str| CodecError::InvalidTokenMapping {
                entry: entry.to_string(),
                reason: reason.to_string(),
            };
            let (chain, pair) = entry
                .split_once(':')
                .ok_or_else(|| invalid("expected chain:source=dest"))?;
            let (src, dest) = pair
                .split_once('=')
                .ok_or_else(|| invalid("expected source=dest"))?;
            let chain = ChainName::from_str(chain).map_err(|e| invalid(&e.to_string()))?;
            let src = Address::from_str(src.trim()).map_err(|e| invalid(&e.to_string()))?;
            let dest = Address::from_str(dest.trim()).map_err(|e| invalid(&e.to_string()))?;
            map.insert(chain, src, dest);
        }
        Ok(map)
    }

    /// Destination token for an event; unmapped tokens pass through
    pub fn resolve(&self, source_chain: &ChainName, source_token: Address) -> Address {
        self.entries
            .get(&(source_chain.clone(), source_token))
            .copied()
            .unwrap_or(source_token)
    }

    pub fn source_chains(&self) -> impl Iterator<Item = &ChainName> {
        self.entries.keys().map(|(chain, _)| chain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds the canonical message and digest for a bridge event
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    tokens: TokenMap,
}

impl MessageCodec {
    pub fn new(tokens: TokenMap) -> Self {
        Self { tokens }
    }

    /// Asset address the destination contract is called with
    pub fn destination_token(&self, event: &BridgeEvent) -> Address {
        self.tokens.resolve(&event.source_chain, event.token)
    }

    /// Packed 137-byte message
    pub fn encode(&self, event: &BridgeEvent) -> Vec<u8> {
        let is_nft = event.asset_kind.is_nft();
        let token_id = if is_nft {
            event.amount_or_token_id
        } else {
            U256::ZERO
        };

        let mut data = Vec::with_capacity(MESSAGE_LEN);
        data.extend_from_slice(self.destination_token(event).as_slice());
        data.extend_from_slice(event.account.as_slice());
        data.extend_from_slice(&event.amount_or_token_id.to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(event.nonce).to_be_bytes::<32>());
        data.push(u8::from(is_nft));
        data.extend_from_slice(&token_id.to_be_bytes::<32>());
        data
    }

    pub fn hash(message: &[u8]) -> B256 {
        B256::from(keccak256(message))
    }

    /// `hash(encode(event))`
    pub fn digest(&self, event: &BridgeEvent) -> B256 {
        Self::hash(&self.encode(event))
    }
}
