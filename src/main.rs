//! Continuebee - signature-authenticated hash custody

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use continuebee::{
    auth::Ed25519Verifier,
    config::{Args, LogFormat},
    server::{self, AppState},
    services::{
        spawn_bootstrap, Federation, HttpForwarder, HttpRegistrar, IdentityService,
        MagicService, Spellbook,
    },
    storage::open_store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("continuebee={},info", args.log_level).into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Continuebee v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Storage: {}", args.storage_uri);
    info!("Service name: {}", args.service_name);
    info!("Key reuse: {:?}", args.key_reuse);
    info!("Allowed time difference: {}ms", args.allowed_time_difference_ms);
    info!("======================================");

    let store = open_store(&args.storage()?, &args.store_options()).await?;

    let keys = Arc::new(args.node_keys()?);
    if args.signing_key.is_none() {
        warn!("SIGNING_KEY not set, using an ephemeral keypair");
    }
    info!("Service public key: {}", keys.public_key_hex());

    let federation = Arc::new(Federation::new(args.service_name.clone(), keys));
    if let Some(ref path) = args.spellbook_path {
        federation.set_spellbook(Spellbook::load(path).await?).await;
    }

    let identity = Arc::new(IdentityService::new(
        Arc::clone(&store),
        Arc::new(Ed25519Verifier),
        args.identity_config(),
    ));
    let magic = Arc::new(MagicService::new(
        Arc::clone(&identity),
        Arc::clone(&federation),
        Arc::new(HttpForwarder::new(args.forward_timeout())?),
        args.minimum_cost,
    ));

    let bootstrap = match args.discovery_url {
        Some(ref url) => {
            info!("Registering with discovery at {}", url);
            Some(spawn_bootstrap(
                Arc::clone(&federation),
                Arc::new(HttpRegistrar::new(url.clone())?),
                args.bootstrap_config(),
            ))
        }
        None => {
            info!("DISCOVERY_URL not set, running unfederated");
            federation.mark_ready();
            None
        }
    };

    let state = Arc::new(AppState::new(identity, magic, federation));

    tokio::select! {
        result = server::run(state, args.listen) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    if let Some(handle) = bootstrap {
        handle.abort();
    }
    if let Err(e) = store.close().await {
        warn!("Failed to close record store: {}", e);
    }
    info!("Continuebee stopped");

    Ok(())
}
