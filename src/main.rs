//! Fencekeeper - Cluster Fencing Coordinator
//!
//! Configuration tooling for the coordinator. The coordinator itself is
//! embedded by a host that supplies the group transport, quorum service
//! and fence agent.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fencekeeper::config::FenceConfig;
use fencekeeper::error::Result;

/// Fencekeeper - Cluster Fencing Coordinator
#[derive(Parser)]
#[command(name = "fencekeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fencekeeper.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "fencekeeper.toml")]
        output: PathBuf,

        /// Cluster node id of this node
        #[arg(long, default_value_t = 1)]
        node_id: u32,

        /// Cluster node name of this node
        #[arg(long, default_value = "node1")]
        node_name: String,
    },

    /// Validate configuration file
    Validate,

    /// Print the parsed configuration as JSON
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // config level applies unless overridden on the command line
    let level = cli.log_level.clone().unwrap_or_else(|| {
        FenceConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Init {
            output,
            node_id,
            node_name,
        } => run_init(output, node_id, node_name),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
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

/// Write a default configuration file
fn run_init(output: PathBuf, node_id: u32, node_name: String) -> Result<()> {
    let config_content = format!(
        r#"# Fencekeeper Configuration
# Generated configuration file

[node]
id = {node_id}
name = "{node_name}"

[domain]
name = "default"
clean_start = false
# every node in the cluster configuration
nodes = [
    {{ id = {node_id}, name = "{node_name}" }},
]

[fencing]
post_join_delay = 6
post_fail_delay = 0
override_path = "/var/run/cluster/fenced_override"
override_time = 3
retry_interval_ms = 5000
delay_poll_ms = 1000

[logging]
level = "info"
"#
    );

    // never ship a file we cannot load back
    FenceConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nAdd the other cluster nodes to [domain] nodes.");
    println!("Then check it with: fencekeeper --config {} validate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match FenceConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node: {} ({})", config.node.id, config.node.name);
            println!("  Domain: {}", config.domain_group());
            println!("  Cluster Nodes: {}", config.domain.nodes.len());
            println!(
                "  Delays: post_join {}s post_fail {}s",
                config.fencing.post_join_delay, config.fencing.post_fail_delay
            );
            match config.override_path() {
                Some(path) => println!("  Override: {}", path.display()),
                None => println!("  Override: disabled"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show the parsed configuration
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = FenceConfig::from_file(&config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
