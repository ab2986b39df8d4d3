//! Router presence
//!
//! Registration with the router at startup and the periodic availability
//! report that follows it.

use infrax_client::RouterClient;
use infrax_core::dto::node::{NodeStateUpdate, RegisterNode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::Node;

const MAX_REGISTER_ATTEMPTS: u32 = 10;
const INITIAL_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 30_000;

/// Register with the router, backing off exponentially between attempts
///
/// The router may not be up yet when the node starts.
pub async fn register_with_retry(client: &RouterClient, node: &Node) -> anyhow::Result<()> {
    let config = node.config();
    let request = RegisterNode {
        node_id: config.node_id.clone(),
        port: config.listen_port,
        max_concurrent_jobs: config.max_concurrent_jobs,
    };

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.register_node(&request).await {
            Ok(registered) => {
                info!(
                    "Registered with router {} as {} after {} attempt(s)",
                    client.base_url(),
                    registered.id,
                    attempt
                );
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < MAX_REGISTER_ATTEMPTS => {
                warn!(
                    "Failed to register with router (attempt {}/{}): {}",
                    attempt, MAX_REGISTER_ATTEMPTS, e
                );
                time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
            Err(e) => {
                error!("Giving up on router registration after {} attempt(s)", attempt);
                return Err(anyhow::anyhow!("Failed to register with router: {}", e));
            }
        }
    }
}

/// Report the node's Idle/Busy state every `interval` until `shutdown` flips
pub fn spawn_heartbeat(
    client: RouterClient,
    node: Arc<Node>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let update = NodeStateUpdate {
                node_id: node.config().node_id.clone(),
                state: node.state(),
            };
            debug!("Sending heartbeat ({})", update.state);

            if let Err(e) = client.update_node_state(&update).await {
                warn!("Failed to send heartbeat: {}", e);
            }
        }

        debug!("Heartbeat stopped");
    })
}
