//! arb-ledger daemon and operator CLI

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use arb_ledger::api::{create_router, AppState};
use arb_ledger::auth::JwtSessionVerifier;
use arb_ledger::settlement::{HttpTransferClient, Reconciler, TransferClient};
use arb_ledger::{Config, Ledger, RewardEngine};

#[derive(Parser)]
#[command(name = "arb-ledger")]
#[command(about = "Points ledger and ARB settlement reconciler")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "arb-ledger.toml", env = "ARB_CONFIG")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "ARB_DATA_DIR")]
    data_dir: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short, long, env = "ARB_HTTP_PORT")]
    port: Option<u16>,

    /// API key for the transfer gateway
    #[arg(long, env = "ARB_TRANSFER_API_KEY", hide_env_values = true)]
    transfer_api_key: Option<String>,

    /// Session token secret
    #[arg(long, env = "ARB_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run reconciler workers (default)
    Serve,
    /// Run the settlement reconciler without the HTTP API
    Reconcile {
        /// Run a single claim cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Print an account's balance
    Balance { account_id: String },
    /// Compare an account's materialized balance with its entries
    Audit { account_id: String },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("arb_ledger=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let mut config = Config::load(Path::new(&cli.config))?;

    // CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = PathBuf::from(data_dir);
    }
    if let Some(port) = cli.port {
        config.server.http_port = port;
    }
    if cli.transfer_api_key.is_some() {
        config.transfer.api_key = cli.transfer_api_key;
    }
    if cli.jwt_secret.is_some() {
        config.auth.jwt_secret = cli.jwt_secret;
    }
    config.validate()?;

    let ledger = Arc::new(Ledger::open(
        &config.storage.db_path(),
        RewardEngine::new(config.rewards.clone()),
    )?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, ledger).await,
        Command::Reconcile { once } => reconcile(config, ledger, once).await,
        Command::Balance { account_id } => {
            println!("{}", ledger.get_balance(&account_id)?);
            Ok(())
        }
        Command::Audit { account_id } => {
            let audit = ledger.audit(&account_id)?;
            println!("{}", serde_json::to_string_pretty(&audit)?);
            if !audit.is_consistent() {
                anyhow::bail!(
                    "balance mismatch for {}: materialized {}, folded {}",
                    account_id,
                    audit.materialized,
                    audit.folded
                );
            }
            Ok(())
        }
    }
}

fn transfer_client(config: &Config) -> anyhow::Result<Arc<dyn TransferClient>> {
    let timeout = Duration::from_secs(config.settlement.transfer_timeout_secs);
    let client: Arc<dyn TransferClient> =
        Arc::new(HttpTransferClient::new(&config.transfer, timeout)?);
    Ok(client)
}

fn spawn_workers(
    config: &Config,
    ledger: &Arc<Ledger>,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let client = transfer_client(config)?;
    let pid = std::process::id();

    let handles = (0..config.settlement.workers)
        .map(|i| {
            let reconciler = Reconciler::new(
                ledger.clone(),
                client.clone(),
                config.settlement.clone(),
                format!("reconciler-{}-{}", pid, i),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.run(shutdown).await })
        })
        .collect();
    Ok(handles)
}

async fn serve(config: Config, ledger: Arc<Ledger>) -> anyhow::Result<()> {
    let verifier = Arc::new(
        JwtSessionVerifier::new(&config.auth).context("serving the API requires a JWT secret")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = if config.settlement.enabled && config.transfer.endpoint.is_some() {
        let handles = spawn_workers(&config, &ledger, &shutdown_rx)?;
        info!(workers = handles.len(), "Settlement reconciler started");
        handles
    } else {
        warn!("Settlement disabled or no transfer endpoint configured; withdrawals will queue");
        Vec::new()
    };

    let app = create_router(AppState::new(ledger, verifier));

    let addr: SocketAddr = format!("{}:{}", config.server.bind_addr, config.server.http_port)
        .parse()
        .context("invalid bind address")?;
    info!("arb-ledger listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

async fn reconcile(config: Config, ledger: Arc<Ledger>, once: bool) -> anyhow::Result<()> {
    if once {
        let reconciler = Reconciler::new(
            ledger,
            transfer_client(&config)?,
            config.settlement.clone(),
            format!("reconciler-{}-once", std::process::id()),
        );
        let report = reconciler.run_once().await?;
        println!("{:?}", report);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&config, &ledger, &shutdown_rx)?;
    info!(workers = workers.len(), "Settlement reconciler started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
