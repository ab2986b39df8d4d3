//! InfraX Node binary
//!
//! Loads the configuration, recovers the job store, registers with the
//! router and serves the node's HTTP surface until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use infrax_node::node::router::{register_with_retry, spawn_heartbeat};
use infrax_node::node::router_client;
use infrax_node::{Config, Node, api};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infrax_node=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting InfraX Node");

    let config = Config::load().context("Failed to load configuration")?;
    info!(
        "Loaded configuration: node_id={}, router_url={}, local_only={}, slots={}, queue={}",
        config.node_id,
        config.router_url,
        config.local_only,
        config.max_concurrent_jobs,
        config.queue_capacity
    );

    let addr = config.listen_addr();
    let local_only = config.local_only;
    let heartbeat_interval = config.heartbeat_interval();

    let node = Arc::new(
        Node::start(config)
            .await
            .context("Failed to start node")?,
    );

    let (stop_heartbeat, heartbeat_rx) = watch::channel(false);
    let heartbeat = if local_only {
        info!("Running local-only, router registration skipped");
        None
    } else {
        let client = router_client(node.config())?;
        register_with_retry(&client, &node).await?;
        Some(spawn_heartbeat(
            client,
            Arc::clone(&node),
            heartbeat_interval,
            heartbeat_rx,
        ))
    };

    let app = api::create_router(Arc::clone(&node));

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = stop_heartbeat.send(true);
    if let Some(heartbeat) = heartbeat {
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task failed: {}", e);
        }
    }

    node.shutdown().await;
    info!("InfraX Node stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
