//! Bridge Relayer Node
//!
//! Watches lock/burn events on every configured source chain and delivers
//! the matching mint/release/unlock on the route's destination chain,
//! exactly once per source nonce.
//!
//! # Pipeline
//!
//! 1. Watcher yields confirmation-deep events in `(block, logIndex)` order
//! 2. Each new event is recorded PENDING in the checkpoint store
//! 3. The message digest is authorized (relayer signature or Merkle proof)
//! 4. The release is submitted unless the destination already processed the nonce
//! 5. The record is CONFIRMED once the receipt is deep enough, and the
//!    source checkpoint advances past every terminal event

use std::collections::HashMap;
use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use bridge_relayer::api::{self, ApiState};
use bridge_relayer::auth::{AuthScheme, Authorizer, MerkleSetAuthorizer, SingleSignerAuthorizer};
use bridge_relayer::chain::EvmChain;
use bridge_relayer::codec::MessageCodec;
use bridge_relayer::config::{Config, StoreConfig};
use bridge_relayer::engine::{RelayerEngine, Route};
use bridge_relayer::store::postgres::{create_pool, run_migrations};
use bridge_relayer::store::{CheckpointStore, FileStore, MemoryStore, PgStore};
use bridge_relayer::types::ChainName;
use eyre::{eyre, Result, WrapErr};
use tracing::{error, info, warn};

fn main() -> Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    // LOG_FORMAT may come from .env
    let _ = dotenvy::dotenv();
    init_logging();

    info!("Starting Bridge Relayer");

    let config = Config::load()?;
    let signer = config.signer()?;
    info!(
        relayer = %signer.address(),
        auth_mode = %config.relayer.auth_mode,
        chains = ?config.chains.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        routes = ?config.routes.iter().map(ToString::to_string).collect::<Vec<_>>(),
        store = ?config.store,
        "Configuration loaded"
    );

    let store = open_store(&config.store).await?;

    let mut chains: HashMap<ChainName, Arc<EvmChain>> = HashMap::new();
    for chain in &config.chains {
        let evm = EvmChain::new(
            chain.to_evm_config(config.rpc_timeout()),
            Some(signer.clone()),
        )
        .wrap_err_with(|| format!("Failed to create client for chain {}", chain.name))?;
        chains.insert(chain.name.clone(), Arc::new(evm));
    }

    let codec = MessageCodec::new(config.token_map.clone());
    let mut engine = RelayerEngine::new(store, codec, config.engine_config());

    for route in &config.routes {
        let source_config = config
            .chain(&route.source)
            .ok_or_else(|| eyre!("route {} references unknown chain {}", route, route.source))?;
        let dest_config = config
            .chain(&route.dest)
            .ok_or_else(|| eyre!("route {} references unknown chain {}", route, route.dest))?;
        let source = chains
            .get(&route.source)
            .cloned()
            .ok_or_else(|| eyre!("no client for chain {}", route.source))?;
        let dest = chains
            .get(&route.dest)
            .cloned()
            .ok_or_else(|| eyre!("no client for chain {}", route.dest))?;

        let gateways = config.gateways(route)?;
        let authorizer = build_authorizer(&config, signer.clone(), dest.clone());
        engine.add_route(Route {
            source,
            dest,
            gateways,
            authorizer,
            watcher: config.watcher_config(source_config),
            start_block: source_config.start_block,
            dest_confirmations: dest_config.confirmations,
        })?;
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    // Start status/admin API server
    let api_state = ApiState {
        engine: engine.handle(),
        admin_token: config.api.admin_token.as_deref().map(Arc::from),
    };
    let bind_address = config.api.bind_address.clone();
    let port = config.api.port;
    tokio::spawn(async move {
        if let Err(e) = api::start_server(&bind_address, port, api_state).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Engine initialized, starting pipelines");
    engine.run(shutdown_rx).await?;

    info!("Bridge Relayer stopped");
    Ok(())
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match config {
        StoreConfig::File { path } => {
            let store = FileStore::open(path.clone())
                .await
                .wrap_err_with(|| format!("Failed to open file store at {}", path.display()))?;
            info!(path = %path.display(), "File store opened");
            Arc::new(store)
        }
        StoreConfig::Postgres { url } => {
            let pool = create_pool(url).await?;
            info!("Database connected");
            run_migrations(&pool).await?;
            info!("Database migrations complete");
            Arc::new(PgStore::new(pool))
        }
        StoreConfig::Memory => {
            warn!("Using the in-memory store, progress is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

/// Merkle roots live on the destination contract, so each route gets its own
/// set authorizer reading that chain
fn build_authorizer(
    config: &Config,
    signer: PrivateKeySigner,
    dest: Arc<EvmChain>,
) -> Arc<dyn Authorizer> {
    match config.relayer.auth_mode {
        AuthScheme::Signature => Arc::new(SingleSignerAuthorizer::new(signer)),
        AuthScheme::Merkle => {
            let authorizer = MerkleSetAuthorizer::new(
                signer.address(),
                config.relayer.authorized_relayers.iter().copied(),
                dest.clone(),
            );
            info!(
                dest = %dest.config().name,
                active_root = %authorizer.active_root(),
                members = config.relayer.authorized_relayers.len(),
                "Merkle relayer set loaded"
            );
            if !config.relayer.staged_relayers.is_empty() {
                let staged_root =
                    authorizer.stage_members(config.relayer.staged_relayers.iter().copied());
                info!(
                    dest = %dest.config().name,
                    staged_root = %staged_root,
                    "Staged relayer set, activates once its root is on-chain"
                );
            }
            Arc::new(authorizer)
        }
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
