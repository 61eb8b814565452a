//! Catalyst node binary
//!
//! Replicates deployments from the other cluster members and serves its own
//! history to them.

use catalyst_node::{CatalystNode, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catalyst_node=info,catalyst=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Catalyst node");

    let config = NodeConfig::from_env()?;
    let node = CatalystNode::new(config).await?;
    node.run().await?;

    Ok(())
}
