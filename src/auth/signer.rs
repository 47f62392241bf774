use alloy::primitives::{Address, Bytes, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use eyre::{Result, WrapErr};

use super::{AuthArtifact, AuthScheme, AuthorizationError, Authorizer};

/// Signs message digests with the relayer's own key
pub struct SingleSignerAuthorizer {
    signer: PrivateKeySigner,
}

impl SingleSignerAuthorizer {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn from_private_key(key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = key.parse().wrap_err("Invalid relayer private key")?;
        Ok(Self::new(signer))
    }

    /// EIP-191 signature over the 32-byte digest, as `ecrecover(toEthSignedMessageHash(digest))` expects
    pub fn sign_digest(&self, digest: &B256) -> Result<Bytes, AuthorizationError> {
        let signature = self
            .signer
            .sign_message_sync(digest.as_slice())
            .map_err(|e| AuthorizationError::SigningFailed(e.to_string()))?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }
}

#[async_trait]
impl Authorizer for SingleSignerAuthorizer {
    fn scheme(&self) -> AuthScheme {
        AuthScheme::Signature
    }

    fn relayer_address(&self) -> Address {
        self.signer.address()
    }

    async fn authorize(&self, digest: &B256) -> Result<AuthArtifact, AuthorizationError> {
        self.sign_digest(digest).map(AuthArtifact::Signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{eth_signed_message_hash, MessageCodec};
    use alloy::primitives::{address, PrimitiveSignature};

    // anvil account 0
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_relayer_address_from_key() {
        let auth = SingleSignerAuthorizer::from_private_key(TEST_KEY).unwrap();
        assert_eq!(
            auth.relayer_address(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert_eq!(auth.scheme(), AuthScheme::Signature);
    }

    #[test]
    fn test_rejects_malformed_key() {
        assert!(SingleSignerAuthorizer::from_private_key("0x1234").is_err());
    }

    #[tokio::test]
    async fn test_signature_recovers_relayer() {
        let auth = SingleSignerAuthorizer::from_private_key(TEST_KEY).unwrap();
        let digest = MessageCodec::default().digest(&crate::types::fixtures::event(7, 1, 0));

        let AuthArtifact::Signature(sig) = auth.authorize(&digest).await.unwrap() else {
            panic!("expected signature artifact");
        };
        assert_eq!(sig.len(), 65);
        assert!(sig[64] == 27 || sig[64] == 28);

        let parsed = PrimitiveSignature::try_from(sig.as_ref()).unwrap();
        let recovered = parsed.recover_address_from_msg(digest.as_slice()).unwrap();
        assert_eq!(recovered, auth.relayer_address());

        // what the contract's ecrecover sees
        let prehash = eth_signed_message_hash(&digest);
        assert_eq!(
            parsed.recover_address_from_prehash(&prehash).unwrap(),
            auth.relayer_address()
        );
    }

    #[tokio::test]
    async fn test_signature_is_deterministic() {
        let auth = SingleSignerAuthorizer::from_private_key(TEST_KEY).unwrap();
        let digest = B256::repeat_byte(0x42);
        assert_eq!(
            auth.authorize(&digest).await.unwrap(),
            auth.authorize(&digest).await.unwrap()
        );
    }
}
