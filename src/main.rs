//! Oblivious Purchase CLI
//!
//! `checkout` places an order, `retrieve` runs the purchase protocol and
//! writes the decrypted asset, `abandon` forgets an order.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use oblivious_purchase::{ClientConfig, OrderId, PurchaseClient, VERSION};

#[derive(Debug, Parser)]
#[command(name = "obpurchase", version, about = "Private catalog purchase client")]
struct Cli {
    /// Marketplace API base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Purchase channel WebSocket base URL
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// Directory holding purchase secrets
    #[arg(long, global = true)]
    secret_dir: Option<PathBuf>,

    /// Session timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Commit to an item and place an order
    Checkout {
        /// Catalog item id
        item_id: String,
    },
    /// Run the purchase protocol for an order and save the asset
    Retrieve {
        /// Order id returned by checkout
        order_id: String,
        /// Output file (defaults to <output-dir>/<order-id>.bin)
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Erase the stored secret for an order
    Abandon {
        /// Order id
        order_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let cli = Cli::parse();
    info!("Oblivious purchase client v{}", VERSION);

    let mut config = ClientConfig::from_env()?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    if let Some(ws_url) = cli.ws_url {
        config.ws_url = ws_url;
    }
    if let Some(dir) = cli.secret_dir {
        config.secret_dir = dir;
    }
    if let Some(secs) = cli.timeout_secs {
        config.session_timeout = std::time::Duration::from_secs(secs);
    }

    let client = PurchaseClient::new(config);

    match cli.command {
        Command::Checkout { item_id } => {
            let order_id = client.checkout(&item_id).await?;
            println!("{}", order_id);
        }
        Command::Retrieve { order_id, out } => {
            let order_id = OrderId::parse(&order_id)?;
            let path = out.unwrap_or_else(|| {
                client.config().output_dir.join(format!("{}.bin", order_id))
            });
            let asset = client.retrieve(order_id).await?;
            std::fs::write(&path, asset.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Asset written to {}", path.display());
        }
        Command::Abandon { order_id } => {
            client.abandon(&OrderId::parse(&order_id)?)?;
        }
    }

    Ok(())
}
