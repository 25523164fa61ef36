#![warn(missing_docs)]

//! `gatewire` command line client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gatewire_gateway::{run_until_interrupted, ClientConfig, GatewayBot, GatewayError, ShardOrchestrator};
use gatewire_rest::RestExecutor;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "gatewire")]
#[command(about = "Gatewire gateway client", long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, default_value = "gatewire.toml")]
    config: PathBuf,

    /// Bot token; overrides the configuration file.
    #[arg(short, long, env = "GATEWIRE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connects every shard and logs events until interrupted.
    Run {
        /// Shard count; overrides the configuration file.
        #[arg(long)]
        shards: Option<u32>,
        /// Take URL, shard count and concurrency from the REST API.
        #[arg(long)]
        discover: bool,
    },
    /// Prints the recommended gateway settings.
    GatewayBot,
    /// Prints the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run { shards, discover } => run(config, shards, discover).await,
        Command::GatewayBot => {
            let rest = RestExecutor::new(config.rest);
            let bot = GatewayBot::fetch(&rest).await?;
            println!("url:             {}", bot.url);
            println!("shards:          {}", bot.shards);
            println!("max concurrency: {}", bot.session_start_limit.max_concurrency);
            println!(
                "session starts:  {}/{} (resets in {:?})",
                bot.session_start_limit.remaining,
                bot.session_start_limit.total,
                bot.session_start_limit.reset_after()
            );
            rest.shutdown();
            Ok(())
        }
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let config = if cli.config.exists() {
        ClientConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        ClientConfig::default()
    };
    Ok(match &cli.token {
        Some(token) => config.with_token(token.clone()),
        None => config,
    })
}

async fn run(mut config: ClientConfig, shards: Option<u32>, discover: bool) -> Result<()> {
    if discover {
        let rest = RestExecutor::new(config.rest.clone());
        GatewayBot::fetch(&rest).await?.apply(&mut config.gateway);
        rest.shutdown();
    }
    if let Some(shards) = shards {
        config.gateway.shard_count = shards;
    }

    let orchestrator = Arc::new(ShardOrchestrator::new(config.gateway));
    let work = orchestrator.run(|event| async move {
        tracing::info!(
            shard = event.shard_id,
            seq = ?event.sequence,
            event = event.name.as_deref().unwrap_or("?"),
            "event"
        );
    });
    let stopper = Arc::clone(&orchestrator);
    let result = run_until_interrupted(work, move || async move {
        if let Err(e) = stopper.shutdown().await {
            tracing::error!("shard failure during shutdown: {}", e);
        }
    })
    .await;

    match result {
        Err(GatewayError::Interrupted { signame, .. }) => {
            tracing::info!("stopped after {signame}");
            Ok(())
        }
        other => Ok(other?),
    }
}
