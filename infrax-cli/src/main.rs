//! InfraX CLI
//!
//! Command-line interface for operating an InfraX node.

mod commands;
mod config;
mod id_resolver;
mod types;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "infrax")]
#[command(about = "InfraX node CLI", long_about = None)]
struct Cli {
    /// Node URL
    #[arg(long, env = "INFRAX_NODE_URL", default_value = "http://localhost:8000")]
    node_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        node_url: cli.node_url,
    };

    handle_command(cli.command, &config).await
}
