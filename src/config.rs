use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use eyre::{eyre, Result, WrapErr};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::auth::AuthScheme;
use crate::chain::{EvmChainConfig, ReleaseMethod};
use crate::codec::TokenMap;
use crate::engine::EngineConfig;
use crate::submitter::retry::RetryConfig;
use crate::types::ChainName;
use crate::watcher::WatcherConfig;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub relayer: RelayerConfig,
    pub chains: Vec<ChainConfig>,
    pub routes: Vec<RouteConfig>,
    pub token_map: TokenMap,
    pub store: StoreConfig,
    pub engine: EngineSettings,
    pub api: ApiConfig,
}

/// Relayer identity and authorization scheme
#[derive(Clone)]
pub struct RelayerConfig {
    pub private_key: String,
    pub auth_mode: AuthScheme,
    /// Members of the authorized set (merkle mode)
    pub authorized_relayers: Vec<Address>,
    /// Next member set, activated once its root is on-chain (merkle mode)
    pub staged_relayers: Vec<Address>,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for RelayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayerConfig")
            .field("private_key", &"<redacted>")
            .field("auth_mode", &self.auth_mode)
            .field("authorized_relayers", &self.authorized_relayers)
            .field("staged_relayers", &self.staged_relayers)
            .finish()
    }
}

/// One chain, loaded from `CHAIN_<i>_*`
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: ChainName,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// Bridge contracts, one per asset family, in the same order on every chain
    pub bridges: Vec<Address>,
    pub confirmations: u64,
    pub start_block: u64,
    pub release_method: ReleaseMethod,
    pub max_block_range: u64,
}

impl ChainConfig {
    pub fn to_evm_config(&self, request_timeout: Duration) -> EvmChainConfig {
        EvmChainConfig {
            name: self.name.clone(),
            chain_id: self.chain_id,
            rpc_urls: self.rpc_urls.clone(),
            bridges: self.bridges.clone(),
            release_method: self.release_method,
            request_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub source: ChainName,
    pub dest: ChainName,
}

impl fmt::Display for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.dest)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum StoreConfig {
    File { path: PathBuf },
    Postgres { url: String },
    Memory,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreConfig::File { path } => f.debug_struct("File").field("path", path).finish(),
            StoreConfig::Postgres { .. } => f
                .debug_struct("Postgres")
                .field("url", &"<redacted>")
                .finish(),
            StoreConfig::Memory => f.write_str("Memory"),
        }
    }
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub confirmation_timeout_ms: u64,
    pub rescan_interval_ms: u64,
    pub liveness_alert_threshold: u32,
    pub rpc_timeout_ms: u64,
}

#[derive(Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    /// Enables the admin routes when set
    pub admin_token: Option<String>,
}

/// Custom Debug that redacts the admin token.
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Default functions
fn default_confirmations() -> u64 {
    12
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_in_flight() -> usize {
    8
}

fn default_confirmation_timeout() -> u64 {
    300_000
}

fn default_rescan_interval() -> u64 {
    30_000
}

fn default_liveness_alert_threshold() -> u32 {
    5
}

fn default_rpc_timeout() -> u64 {
    30_000
}

fn default_store_path() -> &'static str {
    "./data"
}

fn default_api_bind_address() -> &'static str {
    "0.0.0.0"
}

fn default_api_port() -> u16 {
    9090
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let relayer = RelayerConfig {
            private_key: required("RELAYER_PRIVATE_KEY")?,
            auth_mode: env::var("AUTH_MODE")
                .unwrap_or_else(|_| "signature".to_string())
                .parse()
                .map_err(|e: String| eyre!(e))?,
            authorized_relayers: parse_addresses(
                &env::var("AUTHORIZED_RELAYERS").unwrap_or_default(),
            )
            .wrap_err("AUTHORIZED_RELAYERS must be comma-separated addresses")?,
            staged_relayers: parse_addresses(&env::var("STAGED_RELAYERS").unwrap_or_default())
                .wrap_err("STAGED_RELAYERS must be comma-separated addresses")?,
        };

        let chains = load_chains()?;
        let routes = parse_routes(&required("ROUTES")?)?;
        let token_map = TokenMap::parse(&env::var("TOKEN_MAP").unwrap_or_default())
            .wrap_err("Invalid TOKEN_MAP")?;

        let store = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "file".to_string())
            .trim()
            .to_lowercase()
            .as_str()
        {
            "file" => StoreConfig::File {
                path: PathBuf::from(
                    env::var("STORE_PATH").unwrap_or_else(|_| default_store_path().to_string()),
                ),
            },
            "postgres" => StoreConfig::Postgres {
                url: required("DATABASE_URL")?,
            },
            "memory" => StoreConfig::Memory,
            other => {
                return Err(eyre!(
                    "STORE_BACKEND must be file, postgres or memory (got {:?})",
                    other
                ))
            }
        };

        let engine = EngineSettings {
            poll_interval_ms: env_or("POLL_INTERVAL_MS", default_poll_interval()),
            retry_attempts: env_or("RETRY_ATTEMPTS", default_retry_attempts()),
            retry_delay_ms: env_or("RETRY_DELAY_MS", default_retry_delay()),
            queue_capacity: env_or("QUEUE_CAPACITY", default_queue_capacity()),
            max_in_flight: env_or("MAX_IN_FLIGHT", default_max_in_flight()),
            confirmation_timeout_ms: env_or(
                "CONFIRMATION_TIMEOUT_MS",
                default_confirmation_timeout(),
            ),
            rescan_interval_ms: env_or("RESCAN_INTERVAL_MS", default_rescan_interval()),
            liveness_alert_threshold: env_or(
                "LIVENESS_ALERT_THRESHOLD",
                default_liveness_alert_threshold(),
            ),
            rpc_timeout_ms: env_or("RPC_TIMEOUT_MS", default_rpc_timeout()),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| default_api_bind_address().to_string()),
            port: env_or("API_PORT", default_api_port()),
            admin_token: env::var("ADMIN_TOKEN")
                .ok()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        };

        let config = Config {
            relayer,
            chains,
            routes,
            token_map,
            store,
            engine,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Validate relayer key
        if self.relayer.private_key.len() != 66 || !self.relayer.private_key.starts_with("0x") {
            return Err(eyre!(
                "RELAYER_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"
            ));
        }
        let relayer_address = self.relayer_address()?;

        if self.relayer.auth_mode == AuthScheme::Merkle {
            if self.relayer.authorized_relayers.is_empty() {
                return Err(eyre!("AUTHORIZED_RELAYERS is required when AUTH_MODE=merkle"));
            }
            let in_active = self.relayer.authorized_relayers.contains(&relayer_address);
            let in_staged = self.relayer.staged_relayers.contains(&relayer_address);
            if !in_active && !in_staged {
                return Err(eyre!(
                    "relayer {} is not in AUTHORIZED_RELAYERS or STAGED_RELAYERS",
                    relayer_address
                ));
            }
        }

        // Validate chains
        if self.chains.is_empty() {
            return Err(eyre!("CHAINS_COUNT must be at least 1"));
        }
        let mut names = HashSet::new();
        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !names.insert(&chain.name) {
                return Err(eyre!("chain {} is configured twice", chain.name));
            }
            if !chain_ids.insert(chain.chain_id) {
                return Err(eyre!("chain id {} is configured twice", chain.chain_id));
            }
            if chain.rpc_urls.is_empty() {
                return Err(eyre!("chain {} has no RPC URL", chain.name));
            }
            if chain.bridges.is_empty() {
                return Err(eyre!("chain {} has no bridge address", chain.name));
            }
            if chain.bridges.contains(&Address::ZERO) {
                return Err(eyre!("chain {} bridge address cannot be zero", chain.name));
            }
            let unique: HashSet<_> = chain.bridges.iter().collect();
            if unique.len() != chain.bridges.len() {
                return Err(eyre!("chain {} lists a bridge address twice", chain.name));
            }
            if chain.max_block_range == 0 {
                return Err(eyre!("chain {} max block range must be positive", chain.name));
            }
        }

        // Validate routes
        if self.routes.is_empty() {
            return Err(eyre!("ROUTES must name at least one route"));
        }
        let mut sources = HashSet::new();
        for route in &self.routes {
            for chain in [&route.source, &route.dest] {
                if !names.contains(chain) {
                    return Err(eyre!("route {} references unknown chain {}", route, chain));
                }
            }
            if route.source == route.dest {
                return Err(eyre!("route {} has the same source and destination", route));
            }
            self.gateways(route)?;
            // One pipeline and checkpoint per source chain
            if !sources.insert(&route.source) {
                return Err(eyre!(
                    "chain {} is the source of more than one route",
                    route.source
                ));
            }
        }

        for chain in self.token_map.source_chains() {
            if !names.contains(chain) {
                return Err(eyre!("TOKEN_MAP references unknown chain {}", chain));
            }
        }

        if let StoreConfig::Postgres { url } = &self.store {
            if url.is_empty() {
                return Err(eyre!("DATABASE_URL cannot be empty"));
            }
        }

        if self.engine.queue_capacity == 0 {
            return Err(eyre!("QUEUE_CAPACITY must be positive"));
        }
        if self.engine.max_in_flight == 0 {
            return Err(eyre!("MAX_IN_FLIGHT must be positive"));
        }

        Ok(())
    }

    pub fn signer(&self) -> Result<PrivateKeySigner> {
        self.relayer
            .private_key
            .parse()
            .wrap_err("RELAYER_PRIVATE_KEY is not a valid secp256k1 key")
    }

    pub fn relayer_address(&self) -> Result<Address> {
        Ok(self.signer()?.address())
    }

    pub fn chain(&self, name: &ChainName) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| &c.name == name)
    }

    /// Source bridge -> destination gateway, paired by position
    pub fn gateways(&self, route: &RouteConfig) -> Result<BTreeMap<Address, Address>> {
        let source = self
            .chain(&route.source)
            .ok_or_else(|| eyre!("route {} references unknown chain {}", route, route.source))?;
        let dest = self
            .chain(&route.dest)
            .ok_or_else(|| eyre!("route {} references unknown chain {}", route, route.dest))?;
        if source.bridges.len() != dest.bridges.len() {
            return Err(eyre!(
                "route {} pairs {} source bridges with {} destination bridges",
                route,
                source.bridges.len(),
                dest.bridges.len()
            ));
        }
        Ok(source
            .bridges
            .iter()
            .copied()
            .zip(dest.bridges.iter().copied())
            .collect())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.engine.retry_attempts,
            Duration::from_millis(self.engine.retry_delay_ms),
        )
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue_capacity: self.engine.queue_capacity,
            max_in_flight: self.engine.max_in_flight,
            confirmation_timeout: Duration::from_millis(self.engine.confirmation_timeout_ms),
            rescan_interval: Duration::from_millis(self.engine.rescan_interval_ms),
            receipt_poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            retry: self.retry_config(),
            ..EngineConfig::default()
        }
    }

    pub fn watcher_config(&self, chain: &ChainConfig) -> WatcherConfig {
        WatcherConfig {
            confirmations: chain.confirmations,
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            max_block_range: chain.max_block_range,
            retry: self.retry_config(),
            alert_after_failures: self.engine.liveness_alert_threshold,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.rpc_timeout_ms)
    }
}

/// Load `CHAIN_1_*` .. `CHAIN_<CHAINS_COUNT>_*`
fn load_chains() -> Result<Vec<ChainConfig>> {
    let count: usize = required("CHAINS_COUNT")?
        .parse()
        .wrap_err("CHAINS_COUNT must be a valid number")?;

    let mut chains = Vec::with_capacity(count);
    for i in 1..=count {
        let prefix = format!("CHAIN_{}", i);

        let name: ChainName = required(&format!("{}_NAME", prefix))?
            .parse()
            .wrap_err_with(|| format!("Invalid {}_NAME", prefix))?;

        let chain_id: u64 = required(&format!("{}_CHAIN_ID", prefix))?
            .parse()
            .wrap_err_with(|| format!("{}_CHAIN_ID must be a valid u64", prefix))?;

        let rpc_urls = parse_rpc_urls(&required(&format!("{}_RPC_URL", prefix))?);
        if rpc_urls.is_empty() {
            return Err(eyre!("{}_RPC_URL cannot be empty", prefix));
        }

        let bridges = parse_addresses(&required(&format!("{}_BRIDGE_ADDRESS", prefix))?)
            .wrap_err_with(|| format!("{}_BRIDGE_ADDRESS must list valid addresses", prefix))?;

        let release_method: ReleaseMethod = env::var(format!("{}_RELEASE_METHOD", prefix))
            .unwrap_or_else(|_| "mint".to_string())
            .parse()
            .map_err(|e: String| eyre!("{}_RELEASE_METHOD: {}", prefix, e))?;

        chains.push(ChainConfig {
            name,
            chain_id,
            rpc_urls,
            bridges,
            confirmations: env_or(&format!("{}_CONFIRMATIONS", prefix), default_confirmations()),
            start_block: env_or(&format!("{}_START_BLOCK", prefix), 0),
            release_method,
            max_block_range: env_or(
                &format!("{}_MAX_BLOCK_RANGE", prefix),
                default_max_block_range(),
            ),
        });
    }
    Ok(chains)
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| eyre!("{} environment variable is required", key))
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `amoy->sepolia,sepolia->amoy`
pub fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut routes: Vec<RouteConfig> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (source, dest) = entry
            .split_once("->")
            .ok_or_else(|| eyre!("route {:?} must look like source->dest", entry))?;
        let route = RouteConfig {
            source: source
                .parse()
                .wrap_err_with(|| format!("Invalid route source in {:?}", entry))?,
            dest: dest
                .parse()
                .wrap_err_with(|| format!("Invalid route destination in {:?}", entry))?,
        };
        if routes.contains(&route) {
            return Err(eyre!("route {} is listed twice", route));
        }
        routes.push(route);
    }
    Ok(routes)
}

pub fn parse_addresses(raw: &str) -> Result<Vec<Address>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Address>()
                .wrap_err_with(|| format!("Invalid address {:?}", s))
        })
        .collect()
}
