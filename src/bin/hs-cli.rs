use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use handlersocket::config::DEFAULT_PORT;
use handlersocket::{ClientConfig, FindOperator, FindOptions, HsClient, HsClientBuilder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hs-cli")]
#[command(about = "Run single HandlerSocket operations against a server", long_about = None)]
struct Args {
    /// Server host (overrides the config file and HS_HOST)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port (overrides the config file and HS_PORT)
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Number of persistent sessions
    #[arg(long)]
    pool_size: Option<usize>,

    /// TOML client configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database name
    #[arg(short, long)]
    db: String,

    /// Table name
    #[arg(short, long)]
    table: String,

    /// Index name
    #[arg(short, long, default_value = "PRIMARY")]
    index: String,

    /// Comma separated column list
    #[arg(long, value_delimiter = ',', required = true)]
    columns: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print rows matching the key
    Find {
        /// Comparison: =, >, >=, <, <=
        #[arg(long, default_value = "=")]
        op: FindOperator,
        #[arg(long, default_value_t = 1)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Insert one row, values in column order
    Insert {
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Replace the row matching the key
    Update {
        #[arg(long, default_value = "=")]
        op: FindOperator,
        /// Comma separated key values
        #[arg(long, value_delimiter = ',', required = true)]
        keys: Vec<String>,
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Delete the row matching the key
    Delete {
        #[arg(long, default_value = "=")]
        op: FindOperator,
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

const INDEX_ID: i32 = 1;

fn resolve_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let _ = dotenvy::dotenv();
            let mut config = ClientConfig::new("localhost", DEFAULT_PORT);
            config.apply_env_overrides();
            config
        }
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(size) = args.pool_size {
        config.pool_size = size;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handlersocket=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = resolve_config(&args)?;
    tracing::info!("Connecting to {}", config.address());
    let client = HsClientBuilder::from_config(config)
        .build()
        .await
        .context("connecting to HandlerSocket")?;

    let result = run(&client, &args).await;
    client.shutdown().await;
    result
}

async fn run(client: &HsClient, args: &Args) -> anyhow::Result<()> {
    client
        .open_index(INDEX_ID, &args.db, &args.table, &args.index, &args.columns)
        .await
        .with_context(|| format!("opening {}.{}:{}", args.db, args.table, args.index))?;

    match &args.command {
        Command::Find {
            op,
            limit,
            offset,
            keys,
        } => {
            let options = FindOptions::new(*op).limit(*limit).offset(*offset);
            let rows = client.find_with(INDEX_ID, keys, options).await?;
            println!("{}", rows.columns().join("\t"));
            for row in rows {
                let line: Vec<&str> = row
                    .values()
                    .iter()
                    .map(|v| v.as_deref().unwrap_or("NULL"))
                    .collect();
                println!("{}", line.join("\t"));
            }
        }
        Command::Insert { values } => {
            client.insert(INDEX_ID, values).await?;
            println!("inserted");
        }
        Command::Update { op, keys, values } => {
            let count = client.update(INDEX_ID, keys, values, *op).await?;
            println!("{} rows updated", count);
        }
        Command::Delete { op, keys } => {
            let count = client.delete(INDEX_ID, keys, *op).await?;
            println!("{} rows deleted", count);
        }
    }
    Ok(())
}
