//! ShardRelay Command Line Interface

use clap::{CommandFactory, Parser, Subcommand};
use shardrelay::{logging, ConfigLoader, Result, RoutingProxy, SelectOptions, ShardRelayConfig};
use std::process;

#[derive(Parser)]
#[command(name = "shardrelay")]
#[command(about = "ShardRelay database sharding proxy")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file; without it the standard search paths are used
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the active environment
    #[arg(short, long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then print the topology
    Check,

    /// List the shards of the active environment
    Shards,

    /// Show the shards round-robin selection would pick
    NextShard {
        /// Number of selections
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Allow master to be selected
        #[arg(long)]
        include_master: bool,

        /// Start at a random shard
        #[arg(long)]
        random: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Check) => handle_check(&cli.config, &cli.environment).await,
        Some(Commands::Shards) => handle_shards(&cli.config, &cli.environment).await,
        Some(Commands::NextShard {
            count,
            include_master,
            random,
        }) => handle_next_shard(&cli.config, &cli.environment, count, include_master, random).await,
        Some(Commands::Version) => {
            handle_version();
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn load_config(path: &Option<String>, environment: &Option<String>) -> Result<ShardRelayConfig> {
    let loader = ConfigLoader::new();
    let mut config = match path {
        Some(path) => loader.load_from_file(path).await?,
        None => loader.load().await?,
    };

    if let Some(environment) = environment {
        config.environment = environment.clone();
    }

    // Logging may already be set up when embedded; the CLI runs either way
    let _ = logging::init(&config.logging);
    Ok(config)
}

async fn build_proxy(path: &Option<String>, environment: &Option<String>) -> Result<RoutingProxy> {
    let config = load_config(path, environment).await?;
    RoutingProxy::builder(config).build()
}

async fn handle_check(path: &Option<String>, environment: &Option<String>) -> Result<()> {
    let proxy = build_proxy(path, environment).await?;
    let config = proxy.config().await;

    println!("Configuration OK");
    println!("Environment: {}", config.environment);
    println!("Sharded environments: {}", config.environments.join(", "));
    println!("Sharding enabled: {}", proxy.enabled().await);
    println!("Migration failure mode: {}", config.migration.failure_mode);

    let topology = proxy.pool().topology().await;
    println!("Shards:");
    for entry in topology.entries() {
        let group = entry
            .group
            .as_ref()
            .map(|group| format!(" (group {})", group))
            .unwrap_or_default();
        println!("  {} [{}]{}", entry.name, entry.params.adapter, group);
    }

    let groups = proxy.groups().await;
    if !groups.is_empty() {
        println!("Groups:");
        for group in groups {
            let members: Vec<&str> = group.members.iter().map(|member| member.as_str()).collect();
            println!("  {}: {}", group.name, members.join(", "));
        }
    }

    Ok(())
}

async fn handle_shards(path: &Option<String>, environment: &Option<String>) -> Result<()> {
    let proxy = build_proxy(path, environment).await?;
    for shard in proxy.shards().await {
        println!("{}", shard);
    }
    Ok(())
}

async fn handle_next_shard(
    path: &Option<String>,
    environment: &Option<String>,
    count: usize,
    include_master: bool,
    random: bool,
) -> Result<()> {
    let proxy = build_proxy(path, environment).await?;
    let options = SelectOptions {
        include_master,
        start_with_random_shard: random,
    };

    for _ in 0..count {
        println!("{}", proxy.choose_next_shard(options).await);
    }
    Ok(())
}

fn handle_version() {
    println!("ShardRelay {}", shardrelay::VERSION);
}
