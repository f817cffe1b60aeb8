//! WolfSync - Change-Capture Batch Pipeline
//!
//! Operator binary: configuration bootstrap, one-shot routing passes,
//! batch status listings and staged payload inspection.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::config::WolfSyncConfig;
use wolfsync::error::{Error, Result};
use wolfsync::extension::ExtensionRegistry;
use wolfsync::model::{BatchStatus, TableIdentity};
use wolfsync::pipeline::SyncEngine;
use wolfsync::platform;
use wolfsync::protocol::ProtocolDataReader;
use wolfsync::reader::{DataContext, DataReader, ReaderScope, SnapshotTable};
use wolfsync::stage::{StagingManager, StagingSettings};
use wolfsync::state::BatchStore;

/// WolfSync - Change-Capture Batch Pipeline
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "corp-000")]
        node_id: String,

        /// Node group
        #[arg(long, default_value = "corp")]
        group_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Run one routing pass over every enabled channel
    Route,

    /// Queue an initial load of tables for one node
    Reload {
        /// Target node ID
        node: String,

        /// Tables to extract
        #[arg(short, long, required = true)]
        table: Vec<String>,

        /// Channel to queue the batch on
        #[arg(long, default_value = "default")]
        channel: String,
    },

    /// List outgoing batches
    Batches {
        /// Only batches with this status code (NE, RT, RD, SE, LD, OK, ER, RS, IG)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of batches to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Decode a staged payload file and print its events
    Inspect {
        /// Payload file
        path: PathBuf,
    },

    /// Run the staging sweep once
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Output format comes from the config file when it can be read
    let format = WolfSyncConfig::from_file(&cli.config)
        .map(|c| c.logging.format)
        .unwrap_or_else(|_| "pretty".to_string());
    init_logging(&cli.log_level, &format);

    match cli.command {
        Commands::Init {
            output,
            node_id,
            group_id,
        } => run_init(output, node_id, group_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Route => run_route(cli.config).await,
        Commands::Reload {
            node,
            table,
            channel,
        } => run_reload(cli.config, node, table, channel).await,
        Commands::Batches { status, limit } => run_batches(cli.config, status, limit).await,
        Commands::Inspect { path } => run_inspect(path).await,
        Commands::Sweep => run_sweep(cli.config).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(config_path: &PathBuf) -> Result<WolfSyncConfig> {
    WolfSyncConfig::from_file(config_path).map_err(|e| {
        tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
        e
    })
}

async fn open_engine(config_path: &PathBuf) -> Result<SyncEngine> {
    let config = load_config(config_path)?;
    let platform = platform::connect(&config.database).await?;
    SyncEngine::open(config, platform, ExtensionRegistry::builder().build()).await
}

fn run_init(output: PathBuf, node_id: String, group_id: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfSync Configuration
# Generated configuration file

[node]
id = "{node_id}"
group_id = "{group_id}"
data_dir = "/var/lib/wolfsync/{node_id}"
# external_id = "000"

[database]
kind = "mariadb"
host = "localhost"
user = "wolfsync"
password = "changeme"
database = "myapp"

# [capture], [routing], [staging], [push] and [loader] take their defaults

[logging]
level = "info"
format = "pretty"

[[channels]]
id = "default"

# [[nodes]]
# id = "store-001"
# group_id = "store"
# external_id = "001"

# [[subscriptions]]
# id = "{group_id}_to_store"
# source_group = "{group_id}"
# target_group = "store"
# channel = "default"
# router_type = "column"
# router_expression = "STORE_ID=:EXTERNAL_ID"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your database, nodes and subscriptions.");
    println!("Then check it with: wolfsync validate --config {}", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Node:          {} ({})", config.node.id, config.node.group_id);
            println!("  Channels:      {}", config.channels().len());
            println!("  Subscriptions: {}", config.subscriptions.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;

    println!("WolfSync Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Node Group:       {}", config.node.group_id);
    println!(
        "External ID:      {}",
        config.node.external_id.as_deref().unwrap_or("(none)")
    );
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!(
        "Database:         {:?} {}",
        config.database.kind,
        config
            .database
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{}:{}", config.database.host, config.database.port))
    );
    println!();
    println!("Channels:");
    for channel in config.channels() {
        println!(
            "  {:<16} priority {:>3}  max events {}{}",
            channel.id,
            channel.priority,
            config.max_batch_events(&channel.id),
            if channel.enabled { "" } else { "  (disabled)" }
        );
    }
    println!();
    println!("Subscriptions:");
    for sub in &config.subscriptions {
        println!(
            "  {:<24} {} -> {} on {} ({})",
            sub.id, sub.source_group, sub.target_group, sub.channel, sub.router_type
        );
    }

    Ok(())
}

async fn run_route(config_path: PathBuf) -> Result<()> {
    let engine = open_engine(&config_path).await?;
    let reports = engine.route_once().await;

    for report in reports {
        println!(
            "{:<16} read {:>6}  routed {:>6}  held back {:>4}  batches {:>4}  cursor {}",
            report.channel_id,
            report.events_read,
            report.events_routed,
            report.events_held_back,
            report.batches.len(),
            report.cursor
        );
    }
    Ok(())
}

async fn run_reload(
    config_path: PathBuf,
    node: String,
    tables: Vec<String>,
    channel: String,
) -> Result<()> {
    let engine = open_engine(&config_path).await?;
    let tables = tables
        .iter()
        .map(|name| {
            let table = match name.split_once('.') {
                Some((schema, table)) => TableIdentity::with_schema(schema, table),
                None => TableIdentity::new(name.as_str()),
            };
            SnapshotTable::new(table)
        })
        .collect();

    match engine.reload(&node, &channel, tables).await? {
        Some(batch_id) => println!("Reload queued for {} as batch {}", node, batch_id),
        None => println!("Nothing to reload for {}", node),
    }
    Ok(())
}

async fn run_batches(config_path: PathBuf, status: Option<String>, limit: usize) -> Result<()> {
    let config = load_config(&config_path)?;
    let status = match status {
        Some(code) => Some(
            BatchStatus::from_code(&code.to_uppercase())
                .ok_or_else(|| Error::Config(format!("unknown batch status '{}'", code)))?,
        ),
        None => None,
    };

    let store = BatchStore::open(config.state_dir(), config.node.id.clone())?;
    for (code, count) in store.status_counts().await? {
        println!("{:<4} {}", code, count);
    }
    println!();

    for batch in store.list(status, limit).await? {
        println!(
            "{:>10}  {:<16} {:<12} {}  events {:>6}  retries {:>2}{}",
            batch.batch_id,
            batch.key.target_node_id,
            batch.key.channel_id,
            batch.status.code(),
            batch.event_count,
            batch.retry_count,
            batch
                .failure
                .as_ref()
                .map(|f| format!("  {}", f.message))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_inspect(path: PathBuf) -> Result<()> {
    let file = File::open(&path)?;
    let mut reader = ProtocolDataReader::new(BufReader::new(file));
    let context = DataContext::default();
    let mut scope = ReaderScope::open(&mut reader, &context).await?;

    while let Some(header) = scope.next_batch().await? {
        println!(
            "batch {} on {} ({}{}{})",
            header.node_batch_id(),
            header.channel_id,
            header.binary_encoding,
            if header.initial_load { ", initial load" } else { "" },
            if header.ignored { ", ignored" } else { "" }
        );
        for (index, event) in scope.read_batch_events().await?.iter().enumerate() {
            println!("  {:>6}  {}", index + 1, event.describe());
        }
    }
    Ok(())
}

async fn run_sweep(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let staging = StagingManager::open(
        config.staging_dir(),
        StagingSettings::from(&config.staging),
    )?;
    let report = staging.sweep().await?;
    println!(
        "Removed {} done and {} abandoned resources",
        report.expired_done, report.abandoned_creating
    );
    Ok(())
}
