//! Bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate calldata encoders and event signatures.
//! Signature-authorized and proof-authorized gateways expose the same entry
//! points with a different trailing argument, so they get separate interfaces.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Source-side bridge events
    interface BridgeEvents {
        /// Emitted when tokens or an NFT are locked in the source vault
        event Locked(address token, address from, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId);

        /// Emitted when wrapped tokens or an NFT are burned on the source chain
        event Burned(address token, address from, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId);
    }
}

sol! {
    /// Destination gateway authorized by a relayer signature over the message hash
    interface SignatureGateway {
        function mint(address token, address to, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId, bytes signature) external;
        function release(address token, address to, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId, bytes signature) external;
        function unlock(address token, address to, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId, bytes signature) external;
    }
}

sol! {
    /// Destination gateway authorized by a Merkle proof of relayer membership
    interface ProofGateway {
        function mint(address token, address to, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId, bytes32[] proof) external;
        function release(address token, address to, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId, bytes32[] proof) external;
        function unlock(address token, address to, uint256 amount, uint256 nonce, bool isNFT, uint256 tokenId, bytes32[] proof) external;
    }
}

sol! {
    /// Read-only gateway state
    interface GatewayState {
        /// Replay guard keyed by source nonce
        function processedNonces(uint256 nonce) external view returns (bool processed);

        /// Root of the authorized relayer set
        function relayerRoot() external view returns (bytes32 root);
    }
}
