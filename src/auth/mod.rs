//! Relayer authorization
//!
//! A deployment authorizes destination calls with exactly one scheme: a
//! signature from the relayer key, or a Merkle proof that the relayer address
//! belongs to the set whose root the destination contract stores.

pub mod merkle;
pub mod signer;

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::chain::ChainError;

pub use merkle::{MerkleSetAuthorizer, MerkleTree};
pub use signer::SingleSignerAuthorizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Signature,
    Merkle,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Signature => f.write_str("signature"),
            AuthScheme::Merkle => f.write_str("merkle"),
        }
    }
}

impl FromStr for AuthScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "signature" | "signer" => Ok(AuthScheme::Signature),
            "merkle" => Ok(AuthScheme::Merkle),
            other => Err(format!(
                "unknown auth mode {:?} (expected signature or merkle)",
                other
            )),
        }
    }
}

/// Proof attached to a destination call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthArtifact {
    /// 65-byte `r || s || v` over the EIP-191 prefixed message hash
    Signature(Bytes),
    /// Sibling hashes from leaf to root
    MerkleProof(Vec<B256>),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("signing failed: {0}")]
    SigningFailed(String),
    #[error("relayer {0} is not a member of the authorized set")]
    NotAMember(Address),
    #[error("no local relayer set matches on-chain root {0}")]
    UnknownRoot(B256),
    #[error("generated proof does not verify against root {0}")]
    ProofMismatch(B256),
    #[error("could not read authorized root: {0}")]
    RootUnavailable(ChainError),
}

impl AuthorizationError {
    /// Whether a later attempt may succeed without operator action
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthorizationError::RootUnavailable(e) if e.is_transient())
    }
}

/// Produces the authorization artifact for a message digest
#[async_trait]
pub trait Authorizer: Send + Sync {
    fn scheme(&self) -> AuthScheme;

    fn relayer_address(&self) -> Address;

    async fn authorize(&self, digest: &B256) -> Result<AuthArtifact, AuthorizationError>;
}
