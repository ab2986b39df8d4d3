//! App command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use infrax_client::NodeClient;

use crate::config::Config;

/// App subcommands
#[derive(Subcommand)]
pub enum AppCommands {
    /// Install an app from the router (runs in the background)
    Install {
        /// App ID
        app_id: String,
    },
    /// Remove an installed app
    Uninstall {
        /// App ID
        app_id: String,
    },
    /// List installed apps
    List,
}

pub async fn handle_app_command(command: AppCommands, config: &Config) -> Result<()> {
    let client = NodeClient::new(&config.node_url);

    match command {
        AppCommands::Install { app_id } => {
            client.install_app(&app_id).await?;
            println!("{} Installing {}", "✓".green(), app_id.cyan());
            println!("  Run {} to see when it is ready", "infrax app list".bold());
        }
        AppCommands::Uninstall { app_id } => {
            client.uninstall_app(&app_id).await?;
            println!("{} App {} removed", "✓".green(), app_id.cyan());
        }
        AppCommands::List => {
            let apps = client.list_apps().await?;
            if apps.is_empty() {
                println!("{}", "No apps installed.".yellow());
            } else {
                println!("{}", format!("{} app(s) installed:", apps.len()).bold());
                for app in apps {
                    println!("  {} {}", "▸".cyan(), app);
                }
            }
        }
    }

    Ok(())
}
