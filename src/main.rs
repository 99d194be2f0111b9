//! wolfdoc - Replica Set Connection Core
//!
//! Command line front end for inspecting a replica set through the
//! connection core.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfdoc::auth::CommandAuthenticator;
use wolfdoc::config::{DialInfo, WolfdocConfig};
use wolfdoc::diagnostics::Stats;
use wolfdoc::error::Result;
use wolfdoc::session::{dial_with, Mode};

/// wolfdoc - Replica Set Connection Core
#[derive(Parser)]
#[command(name = "wolfdoc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfdoc.toml")]
    config: PathBuf,

    /// Connection URL; overrides the configuration file
    #[arg(short, long)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the replica set and print its topology as JSON
    Topology {
        /// Session mode used to reach the set
        #[arg(short, long)]
        mode: Option<Mode>,
    },

    /// Ping the set and report connection statistics
    Ping {
        /// Number of pings to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfdoc.toml")]
        output: PathBuf,

        /// Replica set name
        #[arg(long, default_value = "rs0")]
        set_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Topology { mode } => run_topology(load_dial_info(&cli.config, cli.url)?, mode).await,
        Commands::Ping { count } => run_ping(load_dial_info(&cli.config, cli.url)?, count).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output, set_name } => run_init(output, set_name),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_dial_info(config_path: &PathBuf, url: Option<String>) -> Result<DialInfo> {
    match url {
        Some(url) => DialInfo::parse_url(&url),
        None => {
            let config = WolfdocConfig::from_file(config_path).map_err(|e| {
                tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
                e
            })?;
            Ok(config.dial)
        }
    }
}

/// Dial the set and dump what the sync loop found
async fn run_topology(info: DialInfo, mode: Option<Mode>) -> Result<()> {
    let stats = Arc::new(Stats::new());
    let session = dial_with(info, stats.clone(), Arc::new(CommandAuthenticator)).await?;
    if let Some(mode) = mode {
        session.set_mode(mode, true);
        session.ping().await?;
    }

    let summary = session.cluster().summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    session.close();
    Ok(())
}

async fn run_ping(info: DialInfo, count: u32) -> Result<()> {
    let stats = Arc::new(Stats::new());
    let session = dial_with(info, stats.clone(), Arc::new(CommandAuthenticator)).await?;

    for i in 0..count {
        let started = std::time::Instant::now();
        session.ping().await?;
        println!("ping {}: {:?} ({})", i + 1, started.elapsed(), session.mode());
    }

    session.close();
    println!("{}", serde_json::to_string_pretty(&stats.snapshot())?);
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfdocConfig::from_file(&config_path) {
        Ok(config) => {
            let dial = &config.dial;
            println!("✓ Configuration is valid");
            println!("  Seeds:        {}", dial.addrs.join(", "));
            println!("  Replica Set:  {}", dial.replica_set_name.as_deref().unwrap_or("(any)"));
            println!("  Direct:       {}", dial.direct);
            println!("  Mode:         {}", dial.mode);
            println!("  Pool Limit:   {}", dial.pool_limit);
            println!("  Timeout:      {} ms", dial.timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Write a starter configuration file
fn run_init(output: PathBuf, set_name: String) -> Result<()> {
    let config_content = format!(r#"# wolfdoc Configuration
# Generated configuration file

[dial]
addrs = ["localhost:27017"]
# addrs = ["db-1.example.com:27017", "db-2.example.com:27017"]
replica_set_name = "{set_name}"
direct = false
fail_fast = false
timeout_ms = 10000
socket_timeout_ms = 60000
pool_limit = 4096
mode = "strong"
# database = "myapp"

# [dial.credential]
# username = "app"
# password = "changeme"
# source = "admin"

[dial.tuning]
sync_short_delay_ms = 500
sync_servers_delay_ms = 30000
sync_socket_timeout_ms = 5000
ping_delay_ms = 15000

[logging]
level = "info"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then inspect the set with: wolfdoc --config {} topology", output.display());

    Ok(())
}
