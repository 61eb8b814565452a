//! Catalyst Node - a content server taking part in a Catalyst cluster.
//!
//! Wires the cluster synchronizer to persistent storage and exposes the
//! peer-facing HTTP surface other members sync from.
//!
//! # Architecture
//!
//! - **Config**: [`NodeConfig`], read from `CATALYST_*` environment variables
//! - **Deployer**: [`LocalDeployer`] stores replicated entities, audit info and content
//! - **Scheduler**: a fixed-interval loop driving `ClusterSynchronizer::sync_tick`
//! - **API**: `/status`, `/challenge`, `/deployments`, `/entities`, `/audit`,
//!   `/contents`, `/failed-deployments` and `/peers`
//!
//! # Example
//!
//! ```no_run
//! use catalyst_node::{CatalystNode, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = CatalystNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod deployer;
pub mod error;
pub mod node;

pub use deployer::LocalDeployer;
pub use error::{ConfigError, Error, Result};
pub use node::{run_sync_loop, CatalystNode, NodeConfig, NodeState};
