use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use outpost_gateway::api::ApiServerBuilder;
use outpost_gateway::config::StoreConfig;
use outpost_gateway::store::FirebaseConfig;
use outpost_gateway::{Broker, Config};

/// Outpost - command and live-view gateway for remote devices
#[derive(Parser)]
#[command(name = "outpost", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/outpost/config.toml)
    #[arg(short, long, env = "OUTPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Shared store backend (memory or firebase)
    #[arg(long)]
    store: Option<String>,

    /// Firebase Realtime Database URL (implies --store firebase)
    #[arg(long)]
    firebase_url: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Print the resolved configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,outpost_gateway=info",
        1 => "info,outpost_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            print!("{config}");
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

/// Config file and environment, then CLI flags on top
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match (cli.store.as_deref(), &cli.firebase_url) {
        (Some("memory"), None) => config.store = StoreConfig::Memory,
        (Some("memory"), Some(_)) => anyhow::bail!("--firebase-url conflicts with --store memory"),
        (Some("firebase") | None, Some(url)) => {
            let auth_token = match &config.store {
                StoreConfig::Firebase(existing) => existing.auth_token.clone(),
                StoreConfig::Memory => None,
            };
            config.store = StoreConfig::Firebase(FirebaseConfig {
                database_url: url.clone(),
                auth_token,
            });
        }
        (Some("firebase"), None) => {
            if matches!(config.store, StoreConfig::Memory) {
                anyhow::bail!("--store firebase needs --firebase-url or OUTPOST_FIREBASE_URL");
            }
        }
        (None, None) => {}
        (Some(other), _) => anyhow::bail!("unknown store backend '{other}'"),
    }

    Ok(config)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        port = config.server.port,
        store = config.store.backend(),
        "starting outpost gateway"
    );

    let broker = Broker::from_config(&config)?;
    if let Err(e) = broker.ready().await {
        tracing::warn!(error = %e, "shared store not reachable yet");
    }

    let server = ApiServerBuilder::new(broker)
        .host(config.server.host.clone())
        .port(config.server.port)
        .rate_limit(config.server.rate_limit_per_minute)
        .build();

    // Live views are closed inside the server's shutdown sequence
    server.run(shutdown_signal()).await?;

    tracing::info!("outpost gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
