//! Keyhole - scheduler and signer relay for keyless hosted Lightning nodes

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyhole::{
    auth::{spawn_cleanup_task, Authenticator, CertificateIssuer, CredentialStore, Ed25519Verifier},
    config::Args,
    hsm::{spawn_sweep_task, HsmRelay},
    scheduler::{ProcessLauncher, Scheduler},
    server,
};

/// Interval between challenge cleanups
const CHALLENGE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keyhole={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Keyhole - hosted node scheduler");
    info!("           and signer relay");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Data dir: {}", args.data_dir.display());
    info!("Node binary: {}", args.node_binary.display());
    info!("Node ports: {}-{}", args.node_port_min, args.node_port_max);
    info!("Challenge TTL: {}s", args.challenge_ttl_secs);
    info!("Node info max wait: {}s", args.node_info_max_wait_secs);
    info!("Signer request timeout: {}ms", args.request_timeout_ms);
    info!("======================================");

    let issuer = match &args.ca_key_file {
        Some(path) => CertificateIssuer::from_file(path)?,
        None => {
            warn!("No CA_KEY_FILE set, generating an ephemeral issuer key (dev mode)");
            CertificateIssuer::generate()
        }
    };
    info!("Certificate issuer: {}", issuer.issuer_id());

    let store = Arc::new(CredentialStore::open(issuer, &args.data_dir).await?);
    let authenticator = Arc::new(Authenticator::new(
        args.auth_config(),
        Arc::clone(&store),
        Arc::new(Ed25519Verifier),
    ));
    let _cleanup = spawn_cleanup_task(Arc::clone(&authenticator), CHALLENGE_CLEANUP_INTERVAL);

    let launcher = Arc::new(ProcessLauncher::new(args.launcher_config(), store));
    let scheduler = Scheduler::new(args.scheduler_config(), launcher);

    let relay = HsmRelay::new(args.relay_config());
    let _sweep = spawn_sweep_task(relay.clone());

    let mut state = server::AppState::new(authenticator, scheduler, relay);
    state.dev_mode = args.dev_mode;

    if let Err(e) = server::run(Arc::new(state), args.listen).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
