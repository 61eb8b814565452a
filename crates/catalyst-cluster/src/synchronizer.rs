//! Cluster synchronization control loop.
//!
//! Each tick:
//!
//! ```text
//! RESOLVE_MEMBERSHIP ──► DETERMINE_IDENTITY ──► RECONCILE PEERS ──► SYNC (all peers concurrently)
//!   registry diff          /challenge echo        add / retire /       fetch new deployments,
//!   (errors abort tick)    (cached once found)    promote clients      apply, record, advance
//! ```
//!
//! Per-event failures are recorded in the failed registry and never stop the
//! batch. Only a registry failure aborts a tick, leaving the previous
//! membership snapshot in effect.
//!
//! The peer map is locked only to add, retire or look up clients. Network
//! calls run under the lock of the single peer they target, and readers see
//! the last published [`PeerSyncState`] of each peer.

use catalyst_history::{
    now_millis, DeploymentEvent, DeploymentStatus, EntityType, FailedDeployments, FailureReason,
    HistoryLedger, Timestamp,
};
use futures::future::join_all;
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::challenge::ChallengeSupervisor;
use crate::config::ClusterConfig;
use crate::deployer::{Deployer, EntityFiles};
use crate::error::{Error, Result};
use crate::membership::{MembershipResolver, MembershipSnapshot, ServerRecord};
use crate::peer::{fetch_challenge, ActivePeerClient, PeerClient, PeerSyncState, SharedPeerClient};
use crate::registry::{Registry, RegistryKey};

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub active_peers: usize,
    pub unreachable_peers: usize,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct PeerReport {
    applied: usize,
    failed: usize,
    skipped: usize,
}

enum Applied {
    Deployed(Timestamp),
    AlreadyDeployed,
}

type EntityRef = (EntityType, String);

/// Marks an entity as being applied; cleared on drop.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<EntityRef>>,
    key: EntityRef,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a StdMutex<HashSet<EntityRef>>, event: &DeploymentEvent) -> Option<Self> {
        let key = (event.entity_type, event.entity_id.clone());
        let inserted = set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        inserted.then_some(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Keeps this node's content in sync with every other cluster member.
pub struct ClusterSynchronizer {
    config: ClusterConfig,
    http: Client,
    resolver: MembershipResolver,
    challenge: Arc<ChallengeSupervisor>,
    deployer: Arc<dyn Deployer>,
    history: Arc<RwLock<HistoryLedger>>,
    failed: FailedDeployments,
    /// Held for the whole resolution so two resolutions never race.
    membership: Mutex<Arc<MembershipSnapshot>>,
    /// Last published snapshot, for readers.
    published: RwLock<Arc<MembershipSnapshot>>,
    own_record: RwLock<Option<ServerRecord>>,
    peers: Mutex<HashMap<RegistryKey, PeerClient>>,
    /// Published after each peer sync, for readers.
    peer_states: RwLock<HashMap<RegistryKey, PeerSyncState>>,
    /// Ticks never overlap.
    tick: Mutex<()>,
    in_flight: StdMutex<HashSet<EntityRef>>,
}

impl ClusterSynchronizer {
    pub fn new(
        config: ClusterConfig,
        registry: Arc<dyn Registry>,
        challenge: Arc<ChallengeSupervisor>,
        deployer: Arc<dyn Deployer>,
        history: Arc<RwLock<HistoryLedger>>,
        failed: FailedDeployments,
    ) -> Result<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let empty = Arc::new(MembershipSnapshot::empty());

        Ok(Self {
            config,
            http,
            resolver: MembershipResolver::new(registry),
            challenge,
            deployer,
            history,
            failed,
            membership: Mutex::new(Arc::clone(&empty)),
            published: RwLock::new(empty),
            own_record: RwLock::new(None),
            peers: Mutex::new(HashMap::new()),
            peer_states: RwLock::new(HashMap::new()),
            tick: Mutex::new(()),
            in_flight: StdMutex::new(HashSet::new()),
        })
    }

    /// Current membership snapshot.
    pub async fn membership(&self) -> Arc<MembershipSnapshot> {
        Arc::clone(&*self.published.read().await)
    }

    /// This node's own registry record, once discovered.
    pub async fn own_record(&self) -> Option<ServerRecord> {
        self.own_record.read().await.clone()
    }

    /// Sync state of every active peer.
    pub async fn peer_states(&self) -> Vec<PeerSyncState> {
        let mut states: Vec<_> = self.peer_states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.peer_name.cmp(&b.peer_name));
        states
    }

    /// Run one synchronization tick.
    pub async fn sync_tick(&self) -> Result<TickReport> {
        let _tick = self.tick.lock().await;

        let snapshot = self.refresh_membership().await?;
        let own_address = self.ensure_identity(&snapshot).await;
        self.reconcile_peers(&snapshot, own_address.as_deref()).await;

        let (active, unreachable_peers) = {
            let peers = self.peers.lock().await;
            let active: Vec<(RegistryKey, SharedPeerClient)> = peers
                .iter()
                .filter_map(|(id, peer)| peer.as_active().map(|client| (id.clone(), Arc::clone(client))))
                .collect();
            let unreachable = peers.len() - active.len();
            (active, unreachable)
        };

        let results = join_all(active.iter().map(|(id, client)| async move {
            let mut client = client.lock().await;
            let report = self.sync_peer(&mut client).await;
            let state = client.state().clone();
            drop(client);

            let immutable_time = state.estimated_immutable_time;
            self.peer_states.write().await.insert(id.clone(), state);
            (report, immutable_time)
        }))
        .await;

        let mut report = TickReport {
            active_peers: results.len(),
            unreachable_peers,
            ..Default::default()
        };
        for (peer_report, _) in &results {
            report.applied += peer_report.applied;
            report.failed += peer_report.failed;
            report.skipped += peer_report.skipped;
        }

        let boundary = results
            .iter()
            .map(|(_, immutable_time)| *immutable_time)
            .min()
            .unwrap_or_else(|| now_millis().saturating_sub(self.config.request_ttl_backwards_millis()));

        if let Err(e) = self.history.write().await.mark_as_immutable(boundary) {
            error!("failed to promote local history: {}", e);
        }

        info!(
            active = report.active_peers,
            unreachable = report.unreachable_peers,
            applied = report.applied,
            failed = report.failed,
            skipped = report.skipped,
            "sync tick finished"
        );
        Ok(report)
    }

    /// Retry a recorded failed deployment against the peer that originated it.
    pub async fn retry_failed(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<DeploymentStatus> {
        let Some(record) = self.failed.get(entity_type, entity_id)? else {
            return Ok(DeploymentStatus::NotMarkedAsFailed);
        };
        let event = record.deployment;

        let client = self
            .peers
            .lock()
            .await
            .values()
            .find(|peer| peer.peer_name() == Some(event.server_name.as_str()))
            .and_then(PeerClient::as_active)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound(format!("active peer {}", event.server_name)))?;

        let Some(_guard) = InFlight::acquire(&self.in_flight, &event) else {
            return self.failed.status_of(entity_type, entity_id).map_err(Error::from);
        };

        info!(entity = %event.entity_key(), peer = %event.server_name, "retrying failed deployment");
        let peer = client.lock().await;
        match self.apply_event(&peer, &event).await {
            Ok(applied) => self.record_success(&event, &applied).await?,
            Err(reason) => self.failed.report_failure(
                event.entity_type,
                &event.entity_id,
                event.timestamp,
                &event.server_name,
                reason,
            )?,
        }

        Ok(self.failed.status_of(entity_type, entity_id)?)
    }

    async fn refresh_membership(&self) -> Result<Arc<MembershipSnapshot>> {
        let mut current = self.membership.lock().await;
        let resolved = match self.resolver.resolve(&current).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("membership resolution failed, keeping previous snapshot: {}", e);
                return Err(e);
            }
        };

        if resolved != **current {
            let resolved = Arc::new(resolved);
            *current = Arc::clone(&resolved);
            *self.published.write().await = resolved;
        }
        Ok(Arc::clone(&current))
    }

    /// Own base address, asking the members for it only until it is known.
    async fn ensure_identity(&self, snapshot: &MembershipSnapshot) -> Option<String> {
        if let Some(record) = self.own_record.read().await.as_ref() {
            return Some(record.base_address.clone());
        }
        self.determine_identity(snapshot).await;
        self.own_record
            .read()
            .await
            .as_ref()
            .map(|record| record.base_address.clone())
    }

    async fn determine_identity(&self, snapshot: &MembershipSnapshot) {
        let answers = snapshot.servers().map(|record| async move {
            match fetch_challenge(&self.http, &record.base_address).await {
                Ok(response) if self.challenge.is_challenge_ok(&response.challenge_text) => {
                    Some(record.clone())
                }
                Ok(_) => None,
                Err(e) => {
                    debug!(address = %record.base_address, "challenge request failed: {}", e);
                    None
                }
            }
        });

        match join_all(answers).await.into_iter().flatten().next() {
            Some(record) => {
                info!(address = %record.base_address, "determined own cluster address");
                *self.own_record.write().await = Some(record);
            }
            None => warn!("could not determine own address, will retry next tick"),
        }
    }

    async fn reconcile_peers(&self, snapshot: &MembershipSnapshot, own_address: Option<&str>) {
        let is_own = |record: &ServerRecord| own_address == Some(record.base_address.as_str());

        let mut retired = Vec::new();
        let pending: Vec<ServerRecord> = {
            let mut peers = self.peers.lock().await;
            peers.retain(|id, peer| {
                let keep = snapshot.contains(id) && !is_own(peer.record());
                if !keep {
                    info!(address = %peer.record().base_address, "retiring peer client");
                    retired.push(id.clone());
                }
                keep
            });

            for record in snapshot.servers() {
                if !is_own(record) && !peers.contains_key(&record.id) {
                    debug!(address = %record.base_address, "new cluster member");
                    peers.insert(record.id.clone(), PeerClient::Unreachable(record.clone()));
                }
            }

            let pending = peers
                .values()
                .filter(|peer| matches!(peer, PeerClient::Unreachable(_)))
                .map(|peer| peer.record().clone())
                .collect();
            pending
        };

        if !retired.is_empty() {
            let mut states = self.peer_states.write().await;
            for id in &retired {
                states.remove(id);
            }
        }

        let connected = join_all(pending.into_iter().map(|record| async move {
            ActivePeerClient::connect(record.clone(), self.http.clone(), &self.config)
                .await
                .map_err(|e| (record, e))
        }))
        .await;

        let mut reached = Vec::new();
        for result in connected {
            match result {
                Ok(client) => {
                    info!(
                        peer = %client.peer_name(),
                        address = %client.record().base_address,
                        "peer reachable"
                    );
                    reached.push(client);
                }
                Err((record, e)) => {
                    debug!(address = %record.base_address, "peer still unreachable: {}", e);
                }
            }
        }
        if reached.is_empty() {
            return;
        }

        {
            let mut states = self.peer_states.write().await;
            for client in &reached {
                states.insert(client.record().id.clone(), client.state().clone());
            }
        }
        let mut peers = self.peers.lock().await;
        for client in reached {
            peers.insert(client.record().id.clone(), PeerClient::active(client));
        }
    }

    async fn sync_peer(&self, peer: &mut ActivePeerClient) -> PeerReport {
        let mut report = PeerReport::default();

        let mut events = match peer.get_new_deployments().await {
            Ok(events) => events,
            Err(e) => {
                warn!(peer = %peer.peer_name(), "skipping peer this tick: {}", e);
                return report;
            }
        };

        events.sort_by(|a, b| a.chronological_cmp(b));
        let mut seen = HashSet::new();
        events.retain(|event| seen.insert((event.entity_type, event.entity_id.clone())));

        if !events.is_empty() {
            debug!(peer = %peer.peer_name(), count = events.len(), "new deployments");
        }

        let mut latest_applied: Option<Timestamp> = None;
        for event in &events {
            let Some(_guard) = InFlight::acquire(&self.in_flight, event) else {
                debug!(entity = %event.entity_key(), "already being applied, dropping duplicate");
                report.skipped += 1;
                continue;
            };

            match self.apply_event(peer, event).await {
                Ok(applied) => {
                    let timestamp = match &applied {
                        Applied::Deployed(timestamp) => {
                            report.applied += 1;
                            *timestamp
                        }
                        Applied::AlreadyDeployed => {
                            report.skipped += 1;
                            event.timestamp
                        }
                    };
                    if let Err(e) = self.record_success(event, &applied).await {
                        error!(entity = %event.entity_key(), "failed to record deployment: {}", e);
                    }
                    latest_applied = latest_applied.max(Some(timestamp));
                }
                Err(reason) => {
                    report.failed += 1;
                    if let Err(e) = self.failed.report_failure(
                        event.entity_type,
                        &event.entity_id,
                        event.timestamp,
                        &event.server_name,
                        reason,
                    ) {
                        error!(entity = %event.entity_key(), "failed to record failure: {}", e);
                    }
                }
            }
        }

        peer.update_estimated_local_immutable_time(latest_applied).await;
        report
    }

    async fn apply_event(
        &self,
        peer: &ActivePeerClient,
        event: &DeploymentEvent,
    ) -> std::result::Result<Applied, FailureReason> {
        if self
            .deployer
            .is_deployed(event.entity_type, &event.entity_id)
            .await
        {
            return Ok(Applied::AlreadyDeployed);
        }

        let entity = match peer.get_entity(event.entity_type, &event.entity_id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => return Err(FailureReason::NoEntityOrAudit),
            Err(e) => {
                debug!(entity = %event.entity_key(), "entity fetch failed: {}", e);
                return Err(FailureReason::FetchProblem);
            }
        };
        let audit_info = match peer.get_audit_info(event.entity_type, &event.entity_id).await {
            Ok(Some(audit_info)) => audit_info,
            Ok(None) => return Err(FailureReason::NoEntityOrAudit),
            Err(e) => {
                debug!(entity = %event.entity_key(), "audit fetch failed: {}", e);
                return Err(FailureReason::FetchProblem);
            }
        };

        let mut files = EntityFiles::new();
        for hash in entity.file_hashes() {
            let is_entity_file = hash == entity.id;
            if !is_entity_file && self.deployer.has_content(&hash).await {
                continue;
            }
            match peer.get_content_file(&hash).await {
                Ok(data) => {
                    files.insert(hash, data);
                }
                Err(e) => {
                    warn!(entity = %event.entity_key(), %hash, "content download failed: {}", e);
                    return Err(FailureReason::FetchProblem);
                }
            }
        }

        match self
            .deployer
            .apply(files, &event.entity_id, &audit_info)
            .await
        {
            Ok(timestamp) => Ok(Applied::Deployed(timestamp)),
            Err(e) => {
                warn!(entity = %event.entity_key(), "deployer rejected entity: {}", e);
                Err(FailureReason::DeploymentError)
            }
        }
    }

    async fn record_success(&self, event: &DeploymentEvent, applied: &Applied) -> Result<()> {
        if let Applied::Deployed(_) = applied {
            self.history.write().await.record(
                &event.server_name,
                event.entity_type,
                &event.entity_id,
                event.timestamp,
            )?;
        }
        self.failed
            .report_success(event.entity_type, &event.entity_id)?;
        Ok(())
    }
}
