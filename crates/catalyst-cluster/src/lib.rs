//! Catalyst Cluster - server-to-server synchronization.
//!
//! Every Catalyst node holds a partial replica of the content store and
//! replicates the deployments its peers originate. This crate decides who
//! the peers are and pulls their history.
//!
//! # Architecture
//!
//! - **Membership**: [`MembershipResolver`] reads the server [`Registry`] and
//!   produces a [`MembershipSnapshot`], detecting changes from the registry
//!   size and last key alone
//! - **Identity**: [`ChallengeSupervisor`] holds a per-process secret; the
//!   registry member that echoes it back is this node
//! - **Peers**: one [`PeerClient`] per member, tracking connectivity and the
//!   peer's estimated immutable time
//! - **Synchronizer**: [`ClusterSynchronizer`] runs the tick: resolve, identify,
//!   reconcile, then replicate each peer concurrently into the local
//!   [`HistoryLedger`](catalyst_history::HistoryLedger) through a [`Deployer`]
//!
//! # Example
//!
//! ```no_run
//! use catalyst_cluster::{ChallengeSupervisor, ClusterConfig, ClusterSynchronizer, StaticRegistry};
//! # use catalyst_cluster::{AuditInfo, DeployError, Deployer, EntityFiles};
//! # use catalyst_history::{FailedDeployments, HistoryLedger, Timestamp};
//! # use catalyst_storage::MemoryStorage;
//! # use std::sync::Arc;
//! # use tokio::sync::RwLock;
//! # struct NoopDeployer;
//! # #[async_trait::async_trait]
//! # impl Deployer for NoopDeployer {
//! #     async fn apply(&self, _: EntityFiles, _: &str, a: &AuditInfo) -> Result<Timestamp, DeployError> {
//! #         Ok(a.local_timestamp)
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(MemoryStorage::new());
//!     let history = Arc::new(RwLock::new(HistoryLedger::open(storage.clone())?));
//!     let registry = Arc::new(StaticRegistry::with_domains("0xowner", ["peer-a.example.com"]));
//!
//!     let synchronizer = ClusterSynchronizer::new(
//!         ClusterConfig::default(),
//!         registry,
//!         Arc::new(ChallengeSupervisor::new()),
//!         Arc::new(NoopDeployer),
//!         history,
//!         FailedDeployments::new(storage),
//!     )?;
//!     synchronizer.sync_tick().await?;
//!     Ok(())
//! }
//! ```

pub mod challenge;
pub mod config;
pub mod deployer;
pub mod error;
pub mod membership;
pub mod peer;
pub mod registry;
pub mod synchronizer;
pub mod wire;

pub use challenge::ChallengeSupervisor;
pub use config::{ClusterConfig, RetryPolicy};
pub use deployer::{DeployError, Deployer, EntityFiles};
pub use error::{Error, Result};
pub use membership::{normalize_address, MembershipResolver, MembershipSnapshot, ServerRecord};
pub use peer::{
    fetch_challenge, fetch_status, ActivePeerClient, ConnectionState, PeerClient, PeerSyncState,
    SharedPeerClient,
};
pub use registry::{Registry, RegistryEntry, RegistryKey, StaticRegistry};
pub use synchronizer::{ClusterSynchronizer, TickReport};
pub use wire::{hash_content, AuditInfo, ChallengeResponse, ContentFileRef, Entity, StatusResponse};
