//! Node command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use infrax_client::NodeClient;
use infrax_core::domain::node::{NodeState, NodeStatus};

use crate::config::Config;

/// Node subcommands
#[derive(Subcommand)]
pub enum NodeCommands {
    /// Show slots, queue and recent failures
    Status,
    /// Check that the node is up
    Health,
}

pub async fn handle_node_command(command: NodeCommands, config: &Config) -> Result<()> {
    let client = NodeClient::new(&config.node_url);

    match command {
        NodeCommands::Status => {
            let status = client.status().await?;
            print_status(&status);
        }
        NodeCommands::Health => {
            client.health().await?;
            println!("{} Node at {} is healthy", "✓".green(), client.base_url());
        }
    }

    Ok(())
}

fn print_status(status: &NodeStatus) {
    let state = match status.state {
        NodeState::Idle => status.state.to_string().green(),
        NodeState::Busy => status.state.to_string().yellow(),
    };

    println!("{}", "Node Status:".bold());
    println!("  Node ID:         {}", status.node_id.cyan());
    println!("  State:           {}", state);
    println!(
        "  Slots:           {}/{} in use",
        status.slots_in_use, status.slots_total
    );
    println!(
        "  Queue:           {}/{}",
        status.queue_depth, status.queue_capacity
    );
    println!("  Pending uploads: {}", status.pending_uploads);

    if status.recent_failures.is_empty() {
        return;
    }

    println!("\n{}", "Recent Failures:".bold());
    for failure in &status.recent_failures {
        println!(
            "  {} [{:?}] {} {}",
            failure.at.format("%H:%M:%S").to_string().dimmed(),
            failure.kind,
            failure.job_id.to_string().dimmed(),
            failure.message.red()
        );
    }
}
