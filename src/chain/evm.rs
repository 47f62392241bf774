//! EVM chain adapter
//!
//! Reads go through plain JSON-RPC over reqwest with ordered fallback URLs.
//! Releases are signed locally with an explicit account nonce and sent as
//! raw transactions, so a retry re-sends identical bytes.

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::contracts::{BridgeEvents, GatewayState, ProofGateway, SignatureGateway};
use super::{
    ChainError, DestinationChain, ReleaseCall, ReleaseMethod, RootSource, SignedRelease,
    SourceChain, TxReceipt,
};
use crate::auth::AuthArtifact;
use crate::metrics;
use crate::types::{AssetKind, BridgeEvent, ChainName};

/// Connection settings for one EVM chain
#[derive(Clone)]
pub struct EvmChainConfig {
    pub name: ChainName,
    pub chain_id: u64,
    /// Primary first, then fallbacks
    pub rpc_urls: Vec<String>,
    /// Bridge contracts on this chain. The first one holds the relayer root.
    pub bridges: Vec<Address>,
    pub release_method: ReleaseMethod,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for EvmChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChainConfig")
            .field("name", &self.name)
            .field("chain_id", &self.chain_id)
            .field("rpc_urls", &self.rpc_urls.len())
            .field("bridges", &self.bridges)
            .field("release_method", &self.release_method)
            .finish()
    }
}

/// EVM RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// EVM RPC error
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Option<String>,
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    block_hash: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
}

/// JSON-RPC client that walks the URL list until one endpoint answers
#[derive(Debug, Clone)]
struct JsonRpcClient {
    client: Client,
    urls: Vec<String>,
}

impl JsonRpcClient {
    fn new(urls: Vec<String>, timeout: Duration) -> Result<Self, ChainError> {
        if urls.is_empty() {
            return Err(ChainError::Rejected(
                "at least one RPC URL is required".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, urls })
    }

    fn primary(&self) -> &str {
        &self.urls[0]
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, ChainError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let mut last_error = String::new();
        for url in &self.urls {
            let response = match self.client.post(url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %url, method, error = %e, "RPC endpoint unreachable, trying next");
                    last_error = e.to_string();
                    continue;
                }
            };
            let response = match response.json::<RpcResponse<T>>().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %url, method, error = %e, "Undecodable RPC response, trying next");
                    last_error = e.to_string();
                    continue;
                }
            };
            if let Some(error) = response.error {
                return Err(ChainError::from_message(format!(
                    "RPC error: {} - {}",
                    error.code, error.message
                )));
            }
            return Ok(response.result);
        }

        Err(ChainError::Transient(format!(
            "all {} RPC endpoints failed for {}: {}",
            self.urls.len(),
            method,
            last_error
        )))
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ChainError> {
        let params = serde_json::json!([
            { "to": format!("{:#x}", to), "data": format!("0x{}", hex::encode(data)) },
            "latest"
        ]);
        let result: String = self
            .call("eth_call", params)
            .await?
            .ok_or_else(|| ChainError::Decode("eth_call returned no data".to_string()))?;
        decode_hex(&result)
    }
}

/// One EVM chain, usable as source, destination and root source
pub struct EvmChain {
    config: EvmChainConfig,
    rpc: JsonRpcClient,
    signer: Option<PrivateKeySigner>,
}

impl EvmChain {
    pub fn new(config: EvmChainConfig, signer: Option<PrivateKeySigner>) -> Result<Self, ChainError> {
        if config.bridges.is_empty() {
            return Err(ChainError::Rejected(format!(
                "no bridge contract configured for {}",
                config.name
            )));
        }
        let rpc = JsonRpcClient::new(config.rpc_urls.clone(), config.request_timeout)?;
        Ok(Self {
            config,
            rpc,
            signer,
        })
    }

    pub fn config(&self) -> &EvmChainConfig {
        &self.config
    }

    fn signer(&self) -> Result<PrivateKeySigner, ChainError> {
        self.signer.clone().ok_or_else(|| {
            ChainError::Rejected(format!("no relayer key configured for {}", self.config.name))
        })
    }

    fn primary_url(&self) -> Result<reqwest::Url, ChainError> {
        self.rpc
            .primary()
            .parse()
            .map_err(|e| ChainError::Rejected(format!("invalid RPC URL: {}", e)))
    }
}

#[async_trait]
impl SourceChain for EvmChain {
    fn name(&self) -> &ChainName {
        &self.config.name
    }

    fn bridges(&self) -> &[Address] {
        &self.config.bridges
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let hex: String = self
            .rpc
            .call("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| ChainError::Decode("No block number returned".to_string()))?;
        parse_quantity(&hex)
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ChainError> {
        let block: Option<RpcBlock> = self
            .rpc
            .call(
                "eth_getBlockByNumber",
                serde_json::json!([format!("{:#x}", number), false]),
            )
            .await?;
        match block.and_then(|b| b.hash) {
            Some(hash) => Ok(Some(parse_b256(&hash)?)),
            None => Ok(None),
        }
    }

    async fn bridge_events(
        &self,
        from_block: u64,
        to_block: u64,
        dest: &ChainName,
    ) -> Result<Vec<BridgeEvent>, ChainError> {
        let addresses: Vec<String> = self
            .config
            .bridges
            .iter()
            .map(|bridge| format!("{:#x}", bridge))
            .collect();
        let params = serde_json::json!([{
            "address": addresses,
            "fromBlock": format!("{:#x}", from_block),
            "toBlock": format!("{:#x}", to_block),
            "topics": [[
                format!("{:#x}", BridgeEvents::Locked::SIGNATURE_HASH),
                format!("{:#x}", BridgeEvents::Burned::SIGNATURE_HASH),
            ]]
        }]);

        let raw: Vec<serde_json::Value> =
            self.rpc.call("eth_getLogs", params).await?.unwrap_or_default();
        debug!(
            chain = %self.config.name,
            from_block,
            to_block,
            logs = raw.len(),
            "Fetched bridge logs"
        );

        let logs = parse_logs(&self.config.name, raw);
        Ok(decode_logs(&self.config.name, dest, logs))
    }
}

#[async_trait]
impl DestinationChain for EvmChain {
    fn name(&self) -> &ChainName {
        &self.config.name
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        SourceChain::block_number(self).await
    }

    async fn is_processed(&self, gateway: Address, nonce: u64) -> Result<bool, ChainError> {
        let data = GatewayState::processedNoncesCall {
            nonce: U256::from(nonce),
        }
        .abi_encode();
        let output = self.rpc.eth_call(gateway, data).await?;
        let decoded = GatewayState::processedNoncesCall::abi_decode_returns(&output, true)
            .map_err(|e| ChainError::Decode(format!("processedNonces: {}", e)))?;
        Ok(decoded.processed)
    }

    async fn prepare_release(&self, call: &ReleaseCall) -> Result<SignedRelease, ChainError> {
        let signer = self.signer()?;
        let sender = signer.address();
        let provider = ProviderBuilder::new().on_http(self.primary_url()?);
        let rpc_error = |e: alloy::transports::TransportError| ChainError::from_message(e.to_string());

        let sender_nonce = provider
            .get_transaction_count(sender)
            .pending()
            .await
            .map_err(rpc_error)?;
        let tx = TransactionRequest::default()
            .with_from(sender)
            .with_to(call.gateway)
            .with_chain_id(self.config.chain_id)
            .with_nonce(sender_nonce)
            .with_input(release_calldata(self.config.release_method, call));

        // Estimation runs the call, so replay and auth reverts surface here
        let gas_limit = provider.estimate_gas(&tx).await.map_err(rpc_error)?;
        let fees = provider
            .estimate_eip1559_fees(None)
            .await
            .map_err(rpc_error)?;
        let tx = tx
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas);

        let envelope = tx
            .build(&EthereumWallet::from(signer))
            .await
            .map_err(|e| ChainError::Rejected(format!("failed to sign release: {}", e)))?;

        Ok(SignedRelease {
            gateway: call.gateway,
            nonce: call.nonce,
            sender_nonce,
            tx_hash: *envelope.tx_hash(),
            raw: Bytes::from(envelope.encoded_2718()),
        })
    }

    async fn broadcast(&self, tx: &SignedRelease) -> Result<B256, ChainError> {
        let hash: Option<String> = self
            .rpc
            .call(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(&tx.raw))]),
            )
            .await?;
        match hash {
            Some(hash) => parse_b256(&hash),
            None => Ok(tx.tx_hash),
        }
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .rpc
            .call(
                "eth_getTransactionReceipt",
                serde_json::json!([format!("{:#x}", tx_hash)]),
            )
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number.as_deref() else {
            return Ok(None);
        };

        Ok(Some(TxReceipt {
            tx_hash: parse_b256(&receipt.transaction_hash)?,
            block_number: parse_quantity(block_number)?,
            success: receipt.status.as_deref() != Some("0x0"),
        }))
    }
}

#[async_trait]
impl RootSource for EvmChain {
    async fn authorized_root(&self) -> Result<B256, ChainError> {
        let data = GatewayState::relayerRootCall {}.abi_encode();
        let output = self.rpc.eth_call(self.config.bridges[0], data).await?;
        let decoded = GatewayState::relayerRootCall::abi_decode_returns(&output, true)
            .map_err(|e| ChainError::Decode(format!("relayerRoot: {}", e)))?;
        Ok(decoded.root)
    }
}

/// ABI calldata for the configured entry point and authorization scheme
pub fn release_calldata(method: ReleaseMethod, call: &ReleaseCall) -> Vec<u8> {
    let (is_nft, token_id) = call.nft_args();
    let nonce = U256::from(call.nonce);
    let (token, to, amount) = (call.token, call.to, call.amount_or_token_id);

    match (&call.artifact, method) {
        (AuthArtifact::Signature(signature), ReleaseMethod::Mint) => SignatureGateway::mintCall {
            token,
            to,
            amount,
            nonce,
            isNFT: is_nft,
            tokenId: token_id,
            signature: signature.clone(),
        }
        .abi_encode(),
        (AuthArtifact::Signature(signature), ReleaseMethod::Release) => {
            SignatureGateway::releaseCall {
                token,
                to,
                amount,
                nonce,
                isNFT: is_nft,
                tokenId: token_id,
                signature: signature.clone(),
            }
            .abi_encode()
        }
        (AuthArtifact::Signature(signature), ReleaseMethod::Unlock) => {
            SignatureGateway::unlockCall {
                token,
                to,
                amount,
                nonce,
                isNFT: is_nft,
                tokenId: token_id,
                signature: signature.clone(),
            }
            .abi_encode()
        }
        (AuthArtifact::MerkleProof(proof), ReleaseMethod::Mint) => ProofGateway::mintCall {
            token,
            to,
            amount,
            nonce,
            isNFT: is_nft,
            tokenId: token_id,
            proof: proof.clone(),
        }
        .abi_encode(),
        (AuthArtifact::MerkleProof(proof), ReleaseMethod::Release) => ProofGateway::releaseCall {
            token,
            to,
            amount,
            nonce,
            isNFT: is_nft,
            tokenId: token_id,
            proof: proof.clone(),
        }
        .abi_encode(),
        (AuthArtifact::MerkleProof(proof), ReleaseMethod::Unlock) => ProofGateway::unlockCall {
            token,
            to,
            amount,
            nonce,
            isNFT: is_nft,
            tokenId: token_id,
            proof: proof.clone(),
        }
        .abi_encode(),
    }
}

fn parse_logs(source: &ChainName, raw: Vec<serde_json::Value>) -> Vec<RpcLog> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<RpcLog>(value) {
            Ok(log) => Some(log),
            Err(e) => {
                error!(chain = %source, error = %e, "Skipping malformed log object");
                metrics::record_error(source.as_str(), "undecodable_log");
                None
            }
        })
        .collect()
}

/// Decode every live log on its own. An undecodable log is reported and
/// dropped so it cannot stall the range it sits in.
fn decode_logs(source: &ChainName, dest: &ChainName, logs: Vec<RpcLog>) -> Vec<BridgeEvent> {
    let mut events = Vec::with_capacity(logs.len());
    for log in logs.into_iter().filter(|log| !log.removed) {
        let block = log.block_number.clone();
        let tx_hash = log.transaction_hash.clone();
        let log_index = log.log_index.clone();
        match decode_bridge_log(source, dest, log) {
            Ok(event) => events.push(event),
            Err(e) => {
                error!(
                    chain = %source,
                    block = ?block,
                    tx_hash = ?tx_hash,
                    log_index = ?log_index,
                    error = %e,
                    "Skipping undecodable bridge log"
                );
                metrics::record_error(source.as_str(), "undecodable_log");
            }
        }
    }
    events
}

fn decode_bridge_log(
    source: &ChainName,
    dest: &ChainName,
    log: RpcLog,
) -> Result<BridgeEvent, ChainError> {
    let topic0 = log
        .topics
        .first()
        .map(|t| parse_b256(t))
        .transpose()?
        .ok_or_else(|| ChainError::Decode("log has no topics".to_string()))?;
    if topic0 != BridgeEvents::Locked::SIGNATURE_HASH
        && topic0 != BridgeEvents::Burned::SIGNATURE_HASH
    {
        return Err(ChainError::Decode(format!(
            "unexpected event signature {:#x}",
            topic0
        )));
    }

    // 6 non-indexed words: token, from, amount, nonce, isNFT, tokenId
    let data = decode_hex(&log.data)?;
    if data.len() < 192 {
        return Err(ChainError::Decode(format!(
            "bridge log data too short: {} bytes",
            data.len()
        )));
    }

    let token = Address::from_slice(&data[12..32]);
    let account = Address::from_slice(&data[44..64]);
    let amount = U256::from_be_slice(&data[64..96]);
    let nonce = u64::try_from(U256::from_be_slice(&data[96..128]))
        .map_err(|_| ChainError::Decode("nonce does not fit in u64".to_string()))?;
    let is_nft = data[159] != 0;
    let token_id = U256::from_be_slice(&data[160..192]);

    let (asset_kind, amount_or_token_id) = if is_nft {
        (AssetKind::NonFungible, token_id)
    } else {
        (AssetKind::Fungible, amount)
    };

    let required = |field: Option<String>, name: &str| {
        field.ok_or_else(|| ChainError::Decode(format!("log missing {}", name)))
    };
    let source_bridge = required(log.address, "address")?
        .parse::<Address>()
        .map_err(|e| ChainError::Decode(format!("invalid log address: {}", e)))?;

    Ok(BridgeEvent {
        source_chain: source.clone(),
        source_bridge,
        dest_chain: dest.clone(),
        asset_kind,
        token,
        account,
        amount_or_token_id,
        nonce,
        source_tx_hash: parse_b256(&required(log.transaction_hash, "transactionHash")?)?,
        source_block_hash: parse_b256(&required(log.block_hash, "blockHash")?)?,
        source_block_number: parse_quantity(&required(log.block_number, "blockNumber")?)?,
        source_log_index: parse_quantity(&required(log.log_index, "logIndex")?)?,
    })
}

fn parse_quantity(hex: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Decode(format!("invalid quantity {:?}: {}", hex, e)))
}

fn parse_b256(hex: &str) -> Result<B256, ChainError> {
    B256::from_str(hex).map_err(|e| ChainError::Decode(format!("invalid hash {:?}: {}", hex, e)))
}

fn decode_hex(data: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(data.trim_start_matches("0x"))
        .map_err(|e| ChainError::Decode(format!("invalid hex payload: {}", e)))
}
