//! Registrar entry point: configuration, state construction, background
//! tasks, and the HTTP server.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mixnet_common::crypto;
use mixnet_storage::{MapImpl, Storage};

use mixnet_registrar::config::{self, Params};
use mixnet_registrar::connectivity::TcpProber;
use mixnet_registrar::handlers::{self, AppState};
use mixnet_registrar::metrics::track_node_metrics;
use mixnet_registrar::ndf::NetworkDefinition;
use mixnet_registrar::poll::Registrar;
use mixnet_registrar::registration::StaticGeoLookup;
use mixnet_registrar::scheduling::{RoundTracker, Scheduler};
use mixnet_registrar::state::network::NetworkState;
use mixnet_registrar::state::pool::WaitingPool;
use mixnet_registrar::trackers::{track_banned_nodes, track_disabled_nodes};

#[derive(Parser, Debug)]
#[command(name = "mixnet-registrar", about = "Mixnet permissioning server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "registrar.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let params = config::load_from_file(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    info!(config = %cli.config.display(), "starting registrar");

    let storage = build_storage(&params)?;
    let signing_key = load_or_create_key(&params)?;

    let initial_ndf = NetworkDefinition {
        registration_address: params.public_address.clone(),
        cmix: params.cmix_group.clone(),
        e2e: params.e2e_group.clone(),
        ..NetworkDefinition::default()
    };
    let state = Arc::new(NetworkState::new(
        signing_key,
        initial_ndf,
        params.round_id_path.clone(),
        params.update_id_path.clone(),
    )?);

    let pool = Arc::new(WaitingPool::new());
    let tracker = Arc::new(RoundTracker::new());
    let stopped = Arc::new(AtomicBool::new(false));
    let (quit_tx, quit_rx) = watch::channel(false);

    let (scheduler, update_tx) = Scheduler::new(
        params.clone(),
        Arc::clone(&state),
        storage.clone(),
        Arc::clone(&pool),
        Arc::clone(&tracker),
        quit_rx.clone(),
        Arc::clone(&stopped),
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    let registrar = Arc::new(Registrar::new(
        params.clone(),
        Arc::clone(&state),
        storage.clone(),
        Arc::new(TcpProber::default()),
        Arc::new(StaticGeoLookup::new(&params.default_country)),
        update_tx.clone(),
        Arc::clone(&stopped),
    )?);
    let restored = registrar.restore_from_storage()?;
    info!(restored, nodes = state.node_map().len(), "state ready");

    tokio::spawn(track_node_metrics(
        Arc::clone(&state),
        storage.clone(),
        Arc::clone(&pool),
        params.clone(),
        quit_rx.clone(),
    ));
    tokio::spawn(track_banned_nodes(
        Arc::clone(&state),
        storage.clone(),
        update_tx,
        params.clone(),
        quit_rx.clone(),
    ));
    tokio::spawn(track_disabled_nodes(
        Arc::clone(&state),
        Arc::clone(&pool),
        params.clone(),
        quit_rx,
    ));

    let app = handlers::routes().with_state(Arc::new(AppState { registrar }));
    let listener = tokio::net::TcpListener::bind(&params.public_address)
        .await
        .with_context(|| format!("binding {}", params.public_address))?;
    info!(address = %params.public_address, "serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("http server")?;

    // Polls have stopped; give active rounds a window to run to
    // completion before tearing the scheduler down.
    if tokio::time::timeout(params.close_timeout(), async {
        while !tracker.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        warn!(active = tracker.len(), "closing with rounds still active");
    }

    let _ = quit_tx.send(true);
    if tokio::time::timeout(params.scheduling_kill_timeout(), scheduler_handle)
        .await
        .is_err()
    {
        warn!("scheduler did not drain within the kill timeout");
    }
    info!("registrar stopped");
    Ok(())
}

/// The in-memory backend is used unless relational connection details
/// are configured; the relational backend itself is an external
/// implementation of the same `Database` trait.
fn build_storage(params: &Params) -> Result<Storage> {
    if !params.db_address.is_empty() {
        warn!(
            address = %params.db_address,
            "relational storage configured but not linked in; using the map backend"
        );
    }
    let storage = Storage::new(Arc::new(MapImpl::new()));

    if let Some(path) = &params.reg_codes_file_path {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading registration codes {}", path.display()))?;
        let codes: Vec<(String, String)> = contents
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .map(|l| match l.split_once(',') {
                Some((code, sequence)) => (code.trim().to_string(), sequence.trim().to_string()),
                None => (l.trim().to_string(), String::new()),
            })
            .collect();
        storage.populate_node_reg_codes(codes.iter().map(|(c, s)| (c.as_str(), s.as_str())));
        info!(count = codes.len(), "loaded node registration codes");
    }

    if !params.client_reg_codes.is_empty() {
        storage.populate_client_reg_codes(params.client_reg_codes.iter().map(|s| s.as_str()), 1);
    }
    Ok(storage)
}

/// Read the scheduler signing key, generating one on first start.
fn load_or_create_key(params: &Params) -> Result<ed25519_dalek::SigningKey> {
    match fs::read_to_string(&params.key_path) {
        Ok(hex_seed) => crypto::signing_key_from_hex(&hex_seed)
            .with_context(|| format!("parsing key {}", params.key_path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = crypto::generate_signing_key();
            fs::write(&params.key_path, crypto::signing_key_to_hex(&key))
                .with_context(|| format!("writing key {}", params.key_path.display()))?;
            info!(path = %params.key_path.display(), "generated new signing key");
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("reading key {}", params.key_path.display())),
    }
}
