use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;

use team_sync::config::{Config, LogFormat, LoggingConfig};
use team_sync::credentials::StaticCredential;
use team_sync::gateway::Gateway;
use team_sync::grafana::GrafanaClient;
use team_sync::jwk;
use team_sync::okta::OktaClient;
use team_sync::server;
use team_sync::status::SyncStatus;
use team_sync::sync::SyncEngine;

/// Okta group to Grafana team membership sync
#[derive(Parser)]
#[command(name = "team-sync", version, about = "Keeps Grafana teams in line with Okta groups")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    config: PathBuf,

    /// Log the planned changes without applying them
    #[arg(long)]
    dry_run: bool,

    /// Run a single pass and exit; non-zero exit if any mapping failed
    #[arg(long)]
    once: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the JWKS for a private_key_jwt signing key
    Jwk {
        /// RSA private or public key in PEM form
        #[arg(long)]
        key: PathBuf,

        /// Key identifier to publish
        #[arg(long, default_value = jwk::DEFAULT_KEY_ID)]
        kid: String,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("team_sync={},tower_http=info", logging.level).into()
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Jwk { key, kid }) = &cli.command {
        let pem = std::fs::read_to_string(key)
            .with_context(|| format!("Failed to read {}", key.display()))?;
        println!("{}", jwk::jwks_json(&pem, kid)?);
        return Ok(());
    }

    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load config from {:?}: {}", cli.config, e);
        std::process::exit(1);
    });
    if cli.dry_run {
        config.sync.dry_run = true;
    }

    init_tracing(&config.logging);

    tracing::info!("team-sync starting");
    tracing::info!("  Okta:     {}", config.okta.domain);
    tracing::info!("  Grafana:  {}", config.grafana.url);
    tracing::info!("  Mappings: {}", config.sync.mappings.len());
    tracing::info!("  Interval: {}s", config.sync.interval_seconds);
    if config.sync.dry_run {
        tracing::info!("  Dry run:  no changes will be applied");
    }

    let okta_gateway = Gateway::new(
        "okta",
        &config.okta.base_url(),
        config.okta.credential_provider()?,
    )?;
    let grafana_gateway = Gateway::new(
        "grafana",
        &config.grafana.url,
        Arc::new(StaticCredential::bearer(config.grafana.api_key.clone())),
    )?;

    let status = Arc::new(SyncStatus::new());
    let engine = SyncEngine::new(
        Arc::new(OktaClient::new(okta_gateway)),
        Arc::new(GrafanaClient::new(grafana_gateway)),
        config.sync.options(),
    )
    .with_status(status.clone());

    if config.metrics.enabled {
        let addr: SocketAddr = config
            .metrics
            .listen_addr()
            .parse()
            .with_context(|| format!("Invalid metrics address {}", config.metrics.listen_addr()))?;
        let status = status.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, status).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    if cli.once {
        let report = engine
            .run_pass(&config.sync.mappings, &config.sync.admin_groups)
            .await;
        if !report.all_succeeded() {
            tracing::error!(
                failed = report.failed.len(),
                admin_failed = report.admin_error.is_some(),
                "Sync pass finished with failures"
            );
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(config.sync.interval_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        let report = engine
            .run_pass(&config.sync.mappings, &config.sync.admin_groups)
            .await;
        if !report.all_succeeded() {
            tracing::warn!(
                failed = report.failed.len(),
                admin_failed = report.admin_error.is_some(),
                "Sync pass finished with failures, retrying next interval"
            );
        }
    }

    tracing::info!("team-sync stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, stopping after the current pass"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping after the current pass"),
    }
}
