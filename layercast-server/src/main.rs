mod config;
mod server;

use clap::{Parser, Subcommand};
use crate::config::Config;
use layercast_core::CancellationToken;
use server::{build_registry, run_server};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "layercast")]
#[command(about = "Peer layer-presence registry for fleets of nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node agent
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Print every announced presence key across the fleet
    Dump {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Print the peers currently announcing a layer
    Lookup {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Layer identifier, e.g. sha256:<digest>
        layer: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "layercast=info,layercast_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config } => serve(&config).await,
        Commands::Dump { config } => dump(&config).await,
        Commands::Lookup { config, layer } => lookup(&config, &layer).await,
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &str) -> layercast_core::Result<Config> {
    let cfg = Config::from_file(path)?;
    tracing::debug!(
        "Loaded config from {} (store: {}, expiration: {}s)",
        path,
        cfg.store.backend.as_str(),
        cfg.registry.expiration_secs
    );
    Ok(cfg)
}

async fn serve(path: &str) -> layercast_core::Result<()> {
    tracing::info!("Starting Layercast with config: {}", path);
    let cfg = load_config(path)?;
    run_server(cfg).await
}

async fn dump(path: &str) -> layercast_core::Result<()> {
    let cfg = load_config(path)?;
    let registry = build_registry(&cfg).await?;

    let keys = registry.dump(&cancel_on_ctrl_c()).await?;
    for key in &keys {
        println!("{}", key);
    }
    tracing::info!("{} presence records", keys.len());
    Ok(())
}

async fn lookup(path: &str, layer: &str) -> layercast_core::Result<()> {
    let cfg = load_config(path)?;
    let registry = build_registry(&cfg).await?;

    let peers = registry.get(&cancel_on_ctrl_c(), layer).await?;
    if peers.is_empty() {
        tracing::info!("No peer currently announces {}", layer);
    }
    for peer in peers {
        println!("{}", peer);
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}
