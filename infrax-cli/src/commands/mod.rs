//! Commands module

mod app;
mod job;
mod node;

pub use app::AppCommands;
pub use job::JobCommands;
pub use node::NodeCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// App installation
    App {
        #[command(subcommand)]
        command: AppCommands,
    },
    /// Node status and health
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
}

pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::App { command } => app::handle_app_command(command, config).await,
        Commands::Node { command } => node::handle_node_command(command, config).await,
    }
}
