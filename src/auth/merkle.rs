//! Merkle relayer-set authorization
//!
//! Leaves are `keccak256(address)`. Pairs are hashed in sorted order so a
//! proof is just the sibling list, and an unpaired node is promoted to the
//! next layer unchanged. The destination contract runs the same fold.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use super::{AuthArtifact, AuthScheme, AuthorizationError, Authorizer};
use crate::chain::RootSource;
use crate::codec::keccak256;

/// Immutable Merkle tree over a relayer set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    members: Vec<Address>,
    layers: Vec<Vec<B256>>,
}

impl MerkleTree {
    /// Build from members in the given order; duplicates are dropped
    pub fn new(members: impl IntoIterator<Item = Address>) -> Self {
        let mut unique: Vec<Address> = Vec::new();
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }

        let mut layers = vec![unique.iter().map(|a| Self::leaf(*a)).collect::<Vec<_>>()];
        while layers.last().map_or(false, |layer| layer.len() > 1) {
            let next = layers
                .last()
                .map(|layer| {
                    layer
                        .chunks(2)
                        .map(|pair| match pair.get(1) {
                            Some(right) => hash_pair(&pair[0], right),
                            None => pair[0],
                        })
                        .collect()
                })
                .unwrap_or_default();
            layers.push(next);
        }

        Self {
            members: unique,
            layers,
        }
    }

    pub fn leaf(address: Address) -> B256 {
        B256::from(keccak256(address.as_slice()))
    }

    /// Root, or zero for an empty set
    pub fn root(&self) -> B256 {
        self.layers
            .last()
            .and_then(|layer| layer.first())
            .copied()
            .unwrap_or(B256::ZERO)
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    /// Sibling hashes from leaf to root, `None` for non-members
    pub fn prove(&self, address: &Address) -> Option<Vec<B256>> {
        let mut index = self.members.iter().position(|m| m == address)?;
        let mut proof = Vec::new();
        for layer in &self.layers[..self.layers.len().saturating_sub(1)] {
            let sibling = index ^ 1;
            if let Some(node) = layer.get(sibling) {
                proof.push(*node);
            }
            index /= 2;
        }
        Some(proof)
    }

    pub fn verify(address: &Address, proof: &[B256], root: &B256) -> bool {
        let computed = proof
            .iter()
            .fold(Self::leaf(*address), |node, sibling| hash_pair(&node, sibling));
        computed == *root
    }
}

fn hash_pair(a: &B256, b: &B256) -> B256 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(low.as_slice());
    data[32..].copy_from_slice(high.as_slice());
    B256::from(keccak256(&data))
}

#[derive(Debug)]
struct RelayerSets {
    active: MerkleTree,
    /// Membership change whose root is not yet on-chain
    staged: Option<MerkleTree>,
}

/// Proves this relayer's membership against the destination's stored root
pub struct MerkleSetAuthorizer {
    relayer: Address,
    sets: RwLock<RelayerSets>,
    root_source: Arc<dyn RootSource>,
}

impl MerkleSetAuthorizer {
    pub fn new(
        relayer: Address,
        members: impl IntoIterator<Item = Address>,
        root_source: Arc<dyn RootSource>,
    ) -> Self {
        Self {
            relayer,
            sets: RwLock::new(RelayerSets {
                active: MerkleTree::new(members),
                staged: None,
            }),
            root_source,
        }
    }

    pub fn active_root(&self) -> B256 {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .root()
    }

    pub fn staged_root(&self) -> Option<B256> {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .staged
            .as_ref()
            .map(MerkleTree::root)
    }

    /// Stage a new member set; returns the root to push on-chain
    pub fn stage_members(&self, members: impl IntoIterator<Item = Address>) -> B256 {
        let tree = MerkleTree::new(members);
        let root = tree.root();
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        info!(
            root = %root,
            members = tree.members().len(),
            "Staged relayer set"
        );
        sets.staged = Some(tree);
        root
    }

    /// Promote the staged set once its root is live on-chain
    pub fn activate_staged(&self) -> Option<B256> {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        let staged = sets.staged.take()?;
        let root = staged.root();
        sets.active = staged;
        info!(root = %root, "Activated staged relayer set");
        Some(root)
    }

    /// Proof of `address` in the active set
    pub fn prove(&self, address: &Address) -> Result<Vec<B256>, AuthorizationError> {
        self.sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .prove(address)
            .ok_or(AuthorizationError::NotAMember(*address))
    }

    pub fn verify(address: &Address, proof: &[B256], root: &B256) -> bool {
        MerkleTree::verify(address, proof, root)
    }
}

#[async_trait]
impl Authorizer for MerkleSetAuthorizer {
    fn scheme(&self) -> AuthScheme {
        AuthScheme::Merkle
    }

    fn relayer_address(&self) -> Address {
        self.relayer
    }

    async fn authorize(&self, _digest: &B256) -> Result<AuthArtifact, AuthorizationError> {
        let onchain = self
            .root_source
            .authorized_root()
            .await
            .map_err(AuthorizationError::RootUnavailable)?;

        if self.active_root() != onchain {
            if self.staged_root() == Some(onchain) {
                self.activate_staged();
            } else {
                warn!(
                    onchain_root = %onchain,
                    active_root = %self.active_root(),
                    "On-chain relayer root matches no local set"
                );
                return Err(AuthorizationError::UnknownRoot(onchain));
            }
        }

        let proof = self.prove(&self.relayer)?;
        if !Self::verify(&self.relayer, &proof, &onchain) {
            return Err(AuthorizationError::ProofMismatch(onchain));
        }
        Ok(AuthArtifact::MerkleProof(proof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StaticRoot;
    use crate::codec::bytes32_to_hex;

    fn addr(last: u8) -> Address {
        Address::with_last_byte(last)
    }

    #[test]
    fn test_root_vectors() {
        let single = MerkleTree::new([addr(1)]);
        assert_eq!(single.root(), MerkleTree::leaf(addr(1)));
        assert_eq!(
            bytes32_to_hex(&single.root().0),
            "0x1468288056310c82aa4c01a7e12a10f8111a0560e72b700555479031b86c357d"
        );

        let pair = MerkleTree::new([addr(1), addr(2)]);
        assert_eq!(
            bytes32_to_hex(&pair.root().0),
            "0xf95c14e6953c95195639e8266ab1a6850864d59a829da9f9b13602ee522f672b"
        );

        // odd leaf promoted
        let triple = MerkleTree::new([addr(1), addr(2), addr(3)]);
        assert_eq!(
            bytes32_to_hex(&triple.root().0),
            "0x344510bd0c324c3912b13373e89df42d1b50450e9764a454b2aa6e2968a4578a"
        );
    }

    #[test]
    fn test_empty_set_has_zero_root() {
        let tree = MerkleTree::new(Vec::<Address>::new());
        assert_eq!(tree.root(), B256::ZERO);
        assert!(tree.prove(&addr(1)).is_none());
    }

    #[test]
    fn test_every_member_proves() {
        let members: Vec<Address> = (1..=7).map(addr).collect();
        let tree = MerkleTree::new(members.clone());
        let root = tree.root();
        for member in &members {
            let proof = tree.prove(member).unwrap();
            assert!(MerkleTree::verify(member, &proof, &root), "member {member}");
        }
        assert!(tree.prove(&addr(9)).is_none());
    }

    #[test]
    fn test_proof_rejected_for_other_address_or_root() {
        let tree = MerkleTree::new([addr(1), addr(2), addr(3)]);
        let proof = tree.prove(&addr(1)).unwrap();
        assert!(!MerkleTree::verify(&addr(4), &proof, &tree.root()));
        assert!(!MerkleTree::verify(&addr(1), &proof, &B256::repeat_byte(1)));
    }

    #[test]
    fn test_duplicates_ignored() {
        let a = MerkleTree::new([addr(1), addr(2)]);
        let b = MerkleTree::new([addr(1), addr(2), addr(1)]);
        assert_eq!(a.root(), b.root());
        assert_eq!(b.members().len(), 2);
    }

    #[tokio::test]
    async fn test_authorize_member() {
        let tree = MerkleTree::new([addr(1), addr(2), addr(3)]);
        let auth = MerkleSetAuthorizer::new(
            addr(2),
            [addr(1), addr(2), addr(3)],
            Arc::new(StaticRoot(tree.root())),
        );
        let AuthArtifact::MerkleProof(proof) = auth.authorize(&B256::ZERO).await.unwrap() else {
            panic!("expected proof");
        };
        assert!(MerkleTree::verify(&addr(2), &proof, &tree.root()));
    }

    #[tokio::test]
    async fn test_authorize_non_member_fails() {
        let tree = MerkleTree::new([addr(1), addr(3)]);
        let auth = MerkleSetAuthorizer::new(
            addr(2),
            [addr(1), addr(3)],
            Arc::new(StaticRoot(tree.root())),
        );
        assert_eq!(
            auth.authorize(&B256::ZERO).await,
            Err(AuthorizationError::NotAMember(addr(2)))
        );
    }

    #[tokio::test]
    async fn test_authorize_unknown_root_fails() {
        let auth = MerkleSetAuthorizer::new(
            addr(1),
            [addr(1)],
            Arc::new(StaticRoot(B256::repeat_byte(0x77))),
        );
        assert!(matches!(
            auth.authorize(&B256::ZERO).await,
            Err(AuthorizationError::UnknownRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_staged_set_activates_when_root_lands() {
        let next = MerkleTree::new([addr(1), addr(2)]);
        let auth = MerkleSetAuthorizer::new(
            addr(2),
            [addr(1)],
            Arc::new(StaticRoot(next.root())),
        );
        let staged_root = auth.stage_members([addr(1), addr(2)]);
        assert_eq!(staged_root, next.root());
        assert_ne!(auth.active_root(), staged_root);

        auth.authorize(&B256::ZERO).await.unwrap();
        assert_eq!(auth.active_root(), staged_root);
        assert_eq!(auth.staged_root(), None);
    }

    #[test]
    fn test_manual_activation() {
        let auth = MerkleSetAuthorizer::new(addr(1), [addr(1)], Arc::new(StaticRoot(B256::ZERO)));
        assert_eq!(auth.activate_staged(), None);
        let root = auth.stage_members([addr(1), addr(5)]);
        assert_eq!(auth.activate_staged(), Some(root));
        assert!(auth.prove(&addr(5)).is_ok());
    }
}
