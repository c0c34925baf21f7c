//! Adaptive SQM CLI
//!
//! Queries live shaping status, learned baselines and alerts from sqmd,
//! and triggers manual speed tests and redeploys.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::{actions, status};

/// Adaptive SQM CLI
#[derive(Parser)]
#[command(name = "sqmctl")]
#[command(author, version, about = "CLI for the Adaptive SQM daemon", long_about = None)]
pub struct Cli {
    /// sqmd API URL (can also be set via SQMCTL_API_URL env var)
    #[arg(long, env = "SQMCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Download,
    Upload,
}

impl DirectionArg {
    fn as_str(self) -> &'static str {
        match self {
            DirectionArg::Download => "download",
            DirectionArg::Upload => "upload",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show live shaping status for every WAN link
    Status,

    /// List configured WAN links
    Links,

    /// Show the learned hour-of-week baseline of a link
    Baseline {
        /// WAN link ID
        link: String,

        #[arg(long, short, value_enum, default_value = "download")]
        direction: DirectionArg,
    },

    /// Show recent alerts
    Alerts {
        /// Maximum number of alerts
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Run a speed test on a link now
    Test {
        /// WAN link ID
        link: String,
    },

    /// Re-send the current shaping configuration to the gateway
    Redeploy {
        /// WAN link ID
        link: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let format = cli
        .format
        .unwrap_or_else(|| output::OutputFormat::from_name(config.default_format.as_deref()));
    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url))?;

    match cli.command {
        Commands::Status => status::show_status(&client, format).await?,
        Commands::Links => status::show_links(&client, format).await?,
        Commands::Baseline { link, direction } => {
            status::show_baseline(&client, &link, direction.as_str(), format).await?
        }
        Commands::Alerts { limit } => status::show_alerts(&client, limit, format).await?,
        Commands::Test { link } => actions::run_test(&client, &link, format).await?,
        Commands::Redeploy { link } => actions::redeploy(&client, &link, format).await?,
    }

    Ok(())
}
