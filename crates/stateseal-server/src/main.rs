//! `stateseal` entry point.
//!
//! `stateseal start` loads and validates the configuration, builds the
//! transform engine and backend client, then serves the proxy and monitoring
//! listeners until SIGINT/SIGTERM. `stateseal keygen` prints a new age key
//! pair.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stateseal_core::Transformer;
use stateseal_core::local::Identity;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use stateseal_server::backend::{HttpBackend, RetryPolicy};
use stateseal_server::config::{ServerConfig, StartArgs};
use stateseal_server::hardening;
use stateseal_server::metrics::Metrics;
use stateseal_server::state::AppState;
use stateseal_server::{monitoring, proxy};

/// Encrypting proxy for Terraform HTTP state backends.
#[derive(Parser)]
#[command(name = "stateseal", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy and monitoring listeners.
    Start(Box<StartArgs>),
    /// Generate an age key pair for `--age-public-key` / `--age-private-key`.
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Start(args) => {
            let config = args.load().context("failed to load configuration")?;
            start(config).await
        }
        Command::Keygen => {
            keygen();
            Ok(())
        }
    }
}

async fn start(config: ServerConfig) -> anyhow::Result<()> {
    apply_hardening();
    init_logging(&config);

    config.validate().context("invalid configuration")?;
    debug!(config = ?config, "loaded configuration");

    let settings = config.proxy_settings()?;
    let metrics = Arc::new(Metrics::new());
    let transformer = Transformer::new(&config.transform_config())
        .context("failed to set up key providers")?
        .with_observer(metrics.clone());
    let backend = HttpBackend::new(RetryPolicy {
        retry_max: config.backend_retry_max,
        ..RetryPolicy::default()
    })
    .context("failed to set up backend client")?;
    let state = Arc::new(AppState::with_metrics(
        settings,
        Arc::new(backend),
        Arc::new(transformer),
        metrics,
    ));

    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let monitoring_addr = SocketAddr::from(([0, 0, 0, 0], config.monitoring_port));
    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("failed to bind to {proxy_addr}"))?;
    let monitoring_listener = TcpListener::bind(monitoring_addr)
        .await
        .with_context(|| format!("failed to bind to {monitoring_addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(shutdown_tx));

    info!(
        addr = %proxy_addr,
        backend = %state.settings.backend_url,
        "stateseal proxy listening"
    );
    info!(addr = %monitoring_addr, "monitoring listening");

    let proxy_server = axum::serve(proxy_listener, proxy::router(Arc::clone(&state)))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let monitoring_server = axum::serve(monitoring_listener, monitoring::router(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    tokio::try_join!(
        async { proxy_server.await.context("proxy server error") },
        async { monitoring_server.await.context("monitoring server error") },
    )?;

    info!("stateseal stopped");
    Ok(())
}

/// Print a fresh age key pair. The private key goes to stdout only.
#[allow(clippy::print_stdout)]
fn keygen() {
    let identity = Identity::generate();
    println!("# public key (TRANSFORM_AGE_PUBLIC_KEY)");
    println!("{}", identity.recipient());
    println!("# private key (TRANSFORM_AGE_PRIVATE_KEY)");
    println!("{}", identity.to_encoded().as_str());
}

/// Initialize `tracing`. `RUST_LOG` wins over the configured level.
fn init_logging(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Applied before logging is initialized, hence `eprintln`.
#[allow(clippy::print_stderr)]
fn apply_hardening() {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }
}
