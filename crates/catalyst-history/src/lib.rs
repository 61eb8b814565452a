//! Catalyst History - what this node has deployed, and what it failed to.
//!
//! - [`HistoryLedger`]: the node's deployment log, split into a mutable recent
//!   window and a write-once immutable tail, with paginated filtered queries
//! - [`FailedDeployments`]: deployments that could not be replayed from a peer,
//!   keyed by entity, cleared on a later success
//!
//! Both persist through [`catalyst_storage::Storage`].

mod error;
mod failed;
mod ledger;
mod types;

pub use error::{Error, Result};
pub use failed::{DeploymentStatus, FailedDeploymentRecord, FailedDeployments, FailureReason};
pub use ledger::{
    clamp_limit, DeploymentFilters, HistoryLedger, HistoryPage, Pagination, MAX_HISTORY_LIMIT,
};
pub use types::{entity_key, now_millis, DeploymentEvent, EntityType, Timestamp};
