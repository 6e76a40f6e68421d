//! Server binary for tokio-cost-router
//!
//! ## Commands
//!
//! - `serve` (default): load config, build the router, serve the HTTP API
//! - `estimate <prompt>`: print the complexity estimate as JSON
//! - `schema`: print the configuration JSON schema
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)
//! - `ROUTER_*`: configuration overrides, see `config::ENV_OVERRIDES`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_cost_router::{config, init_tracing, metrics, ComplexityEstimator, Router};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tokio-cost-router", version, about = "Cost-aware LLM request router")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true, env = "ROUTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// Override the configured bind port.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Score a prompt and print the estimate.
    Estimate {
        /// Prompt text.
        prompt: String,
    },
    /// Print the configuration JSON schema.
    Schema,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Schema => {
            println!("{}", config::export_schema()?);
        }
        Command::Estimate { prompt } => {
            let cfg = config::loader::load(cli.config.as_deref())?;
            let estimate = ComplexityEstimator::with_config(cfg.estimator).estimate(&prompt);
            println!("{}", serde_json::to_string_pretty(&estimate)?);
        }
        Command::Serve { port } => {
            let _ = init_tracing();
            metrics::init_metrics()?;

            let mut cfg = config::loader::load(cli.config.as_deref())?;
            if let Some(port) = port {
                cfg.server.port = port;
            }

            let router = Arc::new(Router::from_config(&cfg)?);
            let _sweeper =
                router.spawn_cache_sweeper(Duration::from_secs(cfg.cache.sweep_interval_seconds));

            info!(
                threshold_cheap_mid = cfg.routing.threshold_cheap_mid,
                threshold_mid_premium = cfg.routing.threshold_mid_premium,
                cache = cfg.cache.enabled,
                "Starting tokio-cost-router"
            );
            tokio_cost_router::web_api::start_server(&cfg.server, router).await?;
        }
    }

    Ok(())
}
