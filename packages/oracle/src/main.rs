use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use tokio::sync::watch;

use bridge_oracle::aggregator::SignatureAggregator;
use bridge_oracle::api::{self, AppState};
use bridge_oracle::chain::{ChainClient, JsonRpcClient};
use bridge_oracle::config::Config;
use bridge_oracle::db::{self, PgTaskStore};
use bridge_oracle::sender::Sender;
use bridge_oracle::store::TaskStore;
use bridge_oracle::types::{ChainSide, SenderRole, WatcherRole};
use bridge_oracle::watcher::EventWatcher;

/// Bridge oracle worker
#[derive(Debug, Parser)]
#[command(name = "bridge-oracle", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch a source chain for one bridge event type
    Watcher {
        /// signature-request-watcher, collected-signatures-watcher,
        /// affirmation-request-watcher or transfer-watcher
        #[arg(value_parser = parse_watcher)]
        name: WatcherRole,
    },
    /// Deliver ready tasks to a destination chain
    Sender {
        /// home-sender or foreign-sender
        #[arg(value_parser = parse_sender)]
        name: SenderRole,
    },
    /// Apply database migrations and exit
    Migrate,
}

fn parse_watcher(s: &str) -> Result<WatcherRole, String> {
    s.parse().map_err(|e: bridge_oracle::types::UnknownName| e.to_string())
}

fn parse_sender(s: &str) -> Result<SenderRole, String> {
    s.parse().map_err(|e: bridge_oracle::types::UnknownName| e.to_string())
}

impl Command {
    fn worker_name(&self) -> &'static str {
        match self {
            Command::Watcher { name } => name.name(),
            Command::Sender { name } => name.name(),
            Command::Migrate => "migrate",
        }
    }

    fn api_port_offset(&self) -> u16 {
        match self {
            Command::Watcher { name } => name.api_port_offset(),
            Command::Sender { name } => name.api_port_offset(),
            Command::Migrate => 0,
        }
    }
}

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> eyre::Result<()> {
    init_logging();

    let worker = cli.command.worker_name();
    tracing::info!(worker, "Starting bridge oracle");

    let config = Config::load()?;
    tracing::info!(
        home_chain_id = config.home.chain_id,
        foreign_chain_id = config.foreign.chain_id,
        quorum = config.validator.quorum,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    if matches!(cli.command, Command::Migrate) {
        return Ok(());
    }

    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool, config.validator.quorum));
    let signer = config.signer()?;
    let aggregator = Arc::new(SignatureAggregator::new(
        signer.clone(),
        config.validator.quorum,
        config.validator.addresses.iter().copied(),
        config.bridges(),
    ));

    // Shutdown is observed between atomic steps by every worker loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Bind before any work starts so a port clash stops the worker
    let api_addr = config.api_addr(cli.command.api_port_offset())?;
    let listener = api::bind_api(api_addr).await?;
    let api_state = AppState::new(worker, store.clone());
    tokio::spawn(async move {
        if let Err(e) = api::serve_api(listener, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    match cli.command {
        Command::Watcher { name } => {
            let client = chain_client(&config, name.source())?;
            let watcher =
                EventWatcher::new(config.watcher_settings(name), client, store, aggregator);
            watcher.run(shutdown_rx).await?;
        }
        Command::Sender { name } => {
            let client = chain_client(&config, name.side())?;
            let mut sender = Sender::new(
                config.sender_settings(name),
                client,
                store,
                aggregator,
                signer,
            );
            sender.run(name.name(), shutdown_rx).await?;
        }
        Command::Migrate => {}
    }

    bridge_oracle::metrics::UP.set(0.0);
    tracing::info!(worker, "Bridge oracle stopped");
    Ok(())
}

fn chain_client(config: &Config, side: ChainSide) -> eyre::Result<Arc<dyn ChainClient>> {
    let chain = config.chain(side);
    let client = JsonRpcClient::new(&chain.rpc_url, chain.chain_id, config.rpc_timeout())
        .wrap_err_with(|| format!("Failed to create {} chain client", side))?;
    tracing::info!(side = %side, chain_id = chain.chain_id, "Chain client ready");
    Ok(Arc::new(client))
}

/// Initialize tracing/logging with structured output
///
/// `LOG_FORMAT=json` switches to JSON lines for log shippers.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_oracle=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
