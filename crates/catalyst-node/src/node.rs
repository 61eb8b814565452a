//! Catalyst node - configuration and wiring.
//!
//! Architecture:
//! - Single process with one shared storage instance (RocksDB)
//! - Sync scheduler ticking the cluster synchronizer on a fixed interval
//! - HTTP API other cluster members replicate from

use crate::api;
use crate::deployer::LocalDeployer;
use crate::error::{ConfigError, Result};
use catalyst_cluster::{ChallengeSupervisor, ClusterConfig, ClusterSynchronizer, StaticRegistry};
use catalyst_history::{FailedDeployments, HistoryLedger};
use catalyst_storage::{RocksStorage, Storage};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;

/// Owner recorded for registry entries configured through the environment.
const LOCAL_REGISTRY_OWNER: &str = "local-config";

/// Configuration for a Catalyst node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for storage
    pub data_dir: PathBuf,

    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// Name reported by `/status`
    pub server_name: String,

    /// Time between sync ticks
    pub sync_interval: Duration,

    /// Cluster member domains, in registry order (this node included)
    pub registry_domains: Vec<String>,

    /// Synchronizer tuning
    pub cluster: ClusterConfig,
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(
            lookup("CATALYST_DATA_DIR").unwrap_or_else(|| "./catalyst-data".to_string()),
        );

        let api_addr: SocketAddr = parse_var(&lookup, "CATALYST_API_ADDR", "0.0.0.0:6969")?;

        let server_name = lookup("CATALYST_SERVER_NAME")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("catalyst-{}", api_addr.port()));

        let interval_secs: u64 = parse_var(&lookup, "CATALYST_SYNC_INTERVAL_SECS", "30")?;
        if interval_secs == 0 {
            return Err(ConfigError {
                var: "CATALYST_SYNC_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least one second".into(),
            });
        }

        let registry_domains = lookup("CATALYST_REGISTRY_DOMAINS")
            .map(|s| {
                s.split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let ttl_secs: u64 = parse_var(&lookup, "CATALYST_REQUEST_TTL_BACKWARDS_SECS", "1200")?;
        let cluster =
            ClusterConfig::default().with_request_ttl_backwards(Duration::from_secs(ttl_secs));

        Ok(Self {
            data_dir,
            api_addr,
            server_name,
            sync_interval: Duration::from_secs(interval_secs),
            registry_domains,
            cluster,
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str, default: &str) -> std::result::Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(var).unwrap_or_else(|| default.to_string());
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        var,
        reason: e.to_string(),
        value,
    })
}

/// Shared state for the node, handed to every API handler.
pub struct NodeState {
    pub server_name: String,
    pub history: Arc<RwLock<HistoryLedger>>,
    pub failed: FailedDeployments,
    pub challenge: Arc<ChallengeSupervisor>,
    pub deployer: LocalDeployer,
    pub synchronizer: Arc<ClusterSynchronizer>,
}

/// A Catalyst node instance.
pub struct CatalystNode {
    state: Arc<NodeState>,
    config: NodeConfig,
}

impl CatalystNode {
    /// Create a node persisting into RocksDB under the configured data dir.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = RocksStorage::open(&config.data_dir)?;
        Self::with_storage(config, Arc::new(storage))
    }

    /// Create a node on top of an already opened storage.
    pub fn with_storage(config: NodeConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let history = Arc::new(RwLock::new(HistoryLedger::open(Arc::clone(&storage))?));
        let failed = FailedDeployments::new(Arc::clone(&storage));
        let challenge = Arc::new(ChallengeSupervisor::new());
        let deployer = LocalDeployer::new(storage);
        let registry = Arc::new(StaticRegistry::with_domains(
            LOCAL_REGISTRY_OWNER,
            config.registry_domains.iter().cloned(),
        ));

        let synchronizer = Arc::new(ClusterSynchronizer::new(
            config.cluster.clone(),
            registry,
            Arc::clone(&challenge),
            Arc::new(deployer.clone()),
            Arc::clone(&history),
            failed.clone(),
        )?);

        let state = Arc::new(NodeState {
            server_name: config.server_name.clone(),
            history,
            failed,
            challenge,
            deployer,
            synchronizer,
        });

        Ok(Self { state, config })
    }

    /// Get the shared state (for API handlers).
    pub fn state(&self) -> Arc<NodeState> {
        Arc::clone(&self.state)
    }

    /// Run the node (starts the sync scheduler and the HTTP server).
    pub async fn run(self) -> Result<()> {
        tracing::info!("Catalyst node starting");
        tracing::info!("  Name: {}", self.config.server_name);
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Data: {:?}", self.config.data_dir);
        tracing::info!("  Cluster members configured: {}", self.config.registry_domains.len());

        tokio::spawn(run_sync_loop(
            Arc::clone(&self.state.synchronizer),
            self.config.sync_interval,
        ));

        let app = api::build_router(self.state());

        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Tick the synchronizer every `period`, forever.
///
/// A tick that overruns its slot finishes before the next one starts; missed
/// slots are skipped rather than fired in a burst.
pub async fn run_sync_loop(synchronizer: Arc<ClusterSynchronizer>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        match synchronizer.sync_tick().await {
            Ok(report) => tracing::debug!(?report, "sync tick done"),
            Err(e) => tracing::warn!("sync tick aborted: {}", e),
        }
    }
}
