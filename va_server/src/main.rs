//! VPN access server: HTTP API plus the background expiry sweep.

use std::sync::Arc;

use anyhow::Error;
use log::info;
use pico_args::Arguments;
use tokio_util::sync::CancellationToken;
use va_server::{api, config::ServerConfig, logging, metrics};
use vpn_access::{
    EntitlementManager, Reconciler,
    db::Database,
    notify::{LogNotifier, Notifier, WebhookNotifier},
    provision::SshProvisioner,
};

const HELP: &str = "\
Run the VPN access entitlement server

USAGE:
  va_server [OPTIONS]

OPTIONS:
  --bind            IP:PORT  HTTP bind address        [default: env SERVER_BIND or 127.0.0.1:8080]
  --db-url          URL      Database connection string [default: env DATABASE_URL]
  --sweep-interval  SECS     Seconds between expiry sweeps [default: env SWEEP_INTERVAL_SECS or 3600]

FLAGS:
  -h, --help                 Print help information

ENVIRONMENT:
  DATABASE_URL               PostgreSQL connection string
  SSH_USERNAME               Remote user for provisioning commands [default: root]
  SSH_KEY_PATH               Private key passed to ssh -i
  FREE_TRIAL_DAYS            Length of the free trial [default: 7]
  EXPIRY_WARNING_HOURS       Warn this long before a config expires [default: 24]
  NOTIFY_WEBHOOK_URL         POST notifications here; logged only when unset
  METRICS_BIND               Prometheus exporter address; disabled when unset
  RUST_LOG                   Log filter [default: info]
  (See .env.example for all configuration options)
";

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        return Ok(());
    }

    let config = ServerConfig::from_env(
        pargs.opt_value_from_str("--bind")?,
        pargs.opt_value_from_str("--db-url")?,
        pargs.opt_value_from_str("--sweep-interval")?,
    )?;
    config.validate()?;

    logging::init();
    info!("Starting VPN access server at {}", config.bind);

    if let Some(addr) = config.metrics_bind {
        metrics::init_metrics(addr).map_err(|e| anyhow::anyhow!(e))?;
        info!("Prometheus metrics exported on {}", addr);
    }

    // Initialize database
    let db = Database::new(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
    db.apply_schema()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to apply schema: {}", e))?;
    info!("Database connected successfully");

    let store = Arc::new(db.entitlement_store());
    let provisioner = Arc::new(SshProvisioner::new(config.ssh.clone()));
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            info!("Notifications go to webhook {}", url);
            Arc::new(WebhookNotifier::new(url.clone())?)
        }
        None => {
            info!("No NOTIFY_WEBHOOK_URL set, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let engine = Arc::new(EntitlementManager::new(
        store.clone(),
        provisioner.clone(),
        config.entitlement.clone(),
    ));

    // Background expiry sweep
    let cancel = CancellationToken::new();
    let reconciler = Reconciler::new(
        store,
        provisioner,
        notifier.clone(),
        config.reconciler.clone(),
    );
    info!(
        "Expiry sweep every {}s, warnings {}h ahead",
        config.reconciler.interval.as_secs(),
        config.reconciler.warning_window.num_hours()
    );
    let sweeper = reconciler.spawn(cancel.clone(), metrics::record_sweep);

    let app = api::create_router(api::AppState { engine, notifier });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", config.bind, e))?;

    info!(
        "Server is running at http://{}. Press Ctrl+C to stop.",
        config.bind
    );

    let shutdown = cancel.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await;

    info!("Shutting down server...");
    cancel.cancel();
    if let Err(e) = sweeper.await {
        log::error!("Sweep task ended abnormally: {}", e);
    }
    db.close().await;

    served.map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
