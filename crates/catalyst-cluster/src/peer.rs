//! Per-peer synchronization client.
//!
//! # Connection state
//!
//! ```text
//!   NeverReached ──ok──► Connected ──err──► ConnectionLost
//!        │                   ▲                    │
//!        └──err (stays)      └────────ok──────────┘
//! ```
//!
//! Only status and history calls move the state machine; point reads
//! (entity, audit, content) are judged per deployment instead.
//!
//! # Immutable time
//!
//! `estimated_immutable_time` is a lower bound on the part of the peer's
//! history that will not change again. It only moves forward, either to the
//! timestamp of a deployment we just applied, or to the peer's current time
//! minus `request_ttl_backwards` when nothing new was found.

use catalyst_history::{DeploymentEvent, DeploymentFilters, EntityType, HistoryPage, Timestamp};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::membership::ServerRecord;
use crate::wire::{hash_content, AuditInfo, ChallengeResponse, Entity, StatusResponse};

/// Connectivity of a peer as observed by its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    ConnectionLost,
    NeverReached,
}

/// Progress tracked for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSyncState {
    pub peer_name: String,
    pub estimated_immutable_time: Timestamp,
    pub connection_state: ConnectionState,
}

/// Client handle shared between the sync loop and retries. Each peer is
/// locked on its own, so one slow peer never blocks the others.
pub type SharedPeerClient = Arc<Mutex<ActivePeerClient>>;

/// A known registry member, as seen by the synchronizer.
pub enum PeerClient {
    /// Peer whose name is known; replicated every tick.
    Active {
        name: String,
        record: ServerRecord,
        client: SharedPeerClient,
    },
    /// Peer that has not answered `/status` yet, so its name is unknown.
    Unreachable(ServerRecord),
}

impl PeerClient {
    pub fn active(client: ActivePeerClient) -> Self {
        PeerClient::Active {
            name: client.peer_name().to_string(),
            record: client.record().clone(),
            client: Arc::new(Mutex::new(client)),
        }
    }

    pub fn record(&self) -> &ServerRecord {
        match self {
            PeerClient::Active { record, .. } => record,
            PeerClient::Unreachable(record) => record,
        }
    }

    pub fn peer_name(&self) -> Option<&str> {
        match self {
            PeerClient::Active { name, .. } => Some(name),
            PeerClient::Unreachable(_) => None,
        }
    }

    pub fn as_active(&self) -> Option<&SharedPeerClient> {
        match self {
            PeerClient::Active { client, .. } => Some(client),
            PeerClient::Unreachable(_) => None,
        }
    }
}

/// HTTP client for one reachable peer, plus its sync progress.
pub struct ActivePeerClient {
    record: ServerRecord,
    http: Client,
    state: PeerSyncState,
    request_ttl_backwards: u64,
    content_retry: RetryPolicy,
    page_limit: usize,
}

impl ActivePeerClient {
    /// Create a client for a peer known by `peer_name`. Starts as `NeverReached`.
    pub fn new(record: ServerRecord, peer_name: String, http: Client, config: &ClusterConfig) -> Self {
        Self {
            record,
            http,
            state: PeerSyncState {
                peer_name,
                estimated_immutable_time: 0,
                connection_state: ConnectionState::NeverReached,
            },
            request_ttl_backwards: config.request_ttl_backwards_millis(),
            content_retry: config.content_retry,
            page_limit: config.history_page_limit,
        }
    }

    /// Ask the peer for its name and build a connected client for it.
    pub async fn connect(record: ServerRecord, http: Client, config: &ClusterConfig) -> Result<Self> {
        let status = fetch_status(&http, &record.base_address).await?;
        let mut client = Self::new(record, status.name, http, config);
        client.track(&Ok::<(), Error>(()));
        Ok(client)
    }

    pub fn record(&self) -> &ServerRecord {
        &self.record
    }

    pub fn peer_name(&self) -> &str {
        &self.state.peer_name
    }

    pub fn state(&self) -> &PeerSyncState {
        &self.state
    }

    pub fn estimated_immutable_time(&self) -> Timestamp {
        self.state.estimated_immutable_time
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state
    }

    /// `GET /status`
    pub async fn get_status(&mut self) -> Result<StatusResponse> {
        let result = fetch_status(&self.http, &self.record.base_address).await;
        self.track(&result);
        result
    }

    /// Every history page matching `filters`, newest first.
    pub async fn get_history(&mut self, filters: &DeploymentFilters) -> Result<Vec<DeploymentEvent>> {
        let result = self.fetch_history(filters).await;
        self.track(&result);
        result
    }

    /// Deployments this peer originated strictly after its immutable time.
    pub async fn get_new_deployments(&mut self) -> Result<Vec<DeploymentEvent>> {
        let filters = DeploymentFilters {
            from: Some(self.state.estimated_immutable_time + 1),
            server_name: Some(self.state.peer_name.clone()),
            ..Default::default()
        };
        self.get_history(&filters).await
    }

    /// `GET /entities/{type}?id={id}`; `None` when the peer has no such entity.
    pub async fn get_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<Entity>> {
        let url = format!("{}/entities/{}", self.record.base_address, entity_type);
        let response = self
            .http
            .get(&url)
            .query(&[("id", entity_id)])
            .send()
            .await?;
        let entities: Option<Vec<Entity>> = read_optional_json(&url, response).await?;
        Ok(entities.and_then(|entities| entities.into_iter().find(|e| e.id == entity_id)))
    }

    /// `GET /audit/{type}/{id}`; `None` when the peer has no audit info.
    pub async fn get_audit_info(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<AuditInfo>> {
        let url = format!(
            "{}/audit/{}/{}",
            self.record.base_address, entity_type, entity_id
        );
        let response = self.http.get(&url).send().await?;
        read_optional_json(&url, response).await
    }

    /// `GET /contents/{hash}`, verified against `hash` and retried per policy.
    pub async fn get_content_file(&self, hash: &str) -> Result<Vec<u8>> {
        let max_attempts = self.content_retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_content_once(hash).await {
                Ok(data) => return Ok(data),
                Err(e) if attempt < max_attempts => {
                    debug!(
                        peer = %self.state.peer_name,
                        hash,
                        attempt,
                        "content download failed, retrying: {}",
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.content_retry.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The peer's current time, or `None` if unknown.
    ///
    /// A peer answering under a different name is treated as unknown so a
    /// replaced server cannot move this client's progress.
    pub async fn peer_current_time(&mut self) -> Option<Timestamp> {
        match self.get_status().await {
            Ok(status) if status.name == self.state.peer_name => Some(status.current_time),
            Ok(status) => {
                warn!(
                    expected = %self.state.peer_name,
                    actual = %status.name,
                    address = %self.record.base_address,
                    "peer answered under a different name, ignoring its time"
                );
                None
            }
            Err(e) => {
                debug!(peer = %self.state.peer_name, "could not read peer time: {}", e);
                None
            }
        }
    }

    /// Advance the immutable time after a sync batch.
    pub async fn update_estimated_local_immutable_time(&mut self, applied: Option<Timestamp>) {
        let candidate = match applied {
            Some(timestamp) => Some(timestamp),
            None => self
                .peer_current_time()
                .await
                .map(|now| now.saturating_sub(self.request_ttl_backwards)),
        };
        if let Some(candidate) = candidate {
            self.advance_immutable_time(candidate);
        }
    }

    fn advance_immutable_time(&mut self, candidate: Timestamp) {
        if candidate > self.state.estimated_immutable_time {
            debug!(
                peer = %self.state.peer_name,
                from = self.state.estimated_immutable_time,
                to = candidate,
                "advancing immutable time"
            );
            self.state.estimated_immutable_time = candidate;
        }
    }

    fn track<T>(&mut self, result: &Result<T>) {
        let previous = self.state.connection_state;
        match result {
            Ok(_) if previous != ConnectionState::Connected => {
                info!(peer = %self.state.peer_name, ?previous, "peer connected");
                self.state.connection_state = ConnectionState::Connected;
            }
            Ok(_) => {}
            Err(e) if previous == ConnectionState::Connected => {
                warn!(peer = %self.state.peer_name, "lost connection to peer: {}", e);
                self.state.connection_state = ConnectionState::ConnectionLost;
            }
            Err(e) => {
                debug!(peer = %self.state.peer_name, ?previous, "peer still unreachable: {}", e);
            }
        }
    }

    async fn fetch_history(&self, filters: &DeploymentFilters) -> Result<Vec<DeploymentEvent>> {
        let url = format!("{}/deployments", self.record.base_address);
        let mut events = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("offset", offset.to_string()),
                ("limit", self.page_limit.to_string()),
            ];
            if let Some(from) = filters.from {
                params.push(("from", from.to_string()));
            }
            if let Some(to) = filters.to {
                params.push(("to", to.to_string()));
            }
            if let Some(server_name) = &filters.server_name {
                params.push(("serverName", server_name.clone()));
            }
            if let Some(entity_type) = filters.entity_type {
                params.push(("entityType", entity_type.to_string()));
            }

            let response = self.http.get(&url).query(&params).send().await?;
            let page: HistoryPage = read_json(&url, response).await?;

            let received = page.deployments.len();
            events.extend(page.deployments);
            if !page.pagination.more_data || received == 0 {
                break;
            }
            offset += received;
        }

        Ok(events)
    }

    async fn fetch_content_once(&self, hash: &str) -> Result<Vec<u8>> {
        let url = format!("{}/contents/{}", self.record.base_address, hash);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus {
                url,
                status: status.as_u16(),
            });
        }

        let data = response.bytes().await?.to_vec();
        let actual = hash_content(&data);
        if actual != hash {
            return Err(Error::IntegrityMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(data)
    }
}

/// `GET /status` on an arbitrary base address.
pub async fn fetch_status(http: &Client, base_address: &str) -> Result<StatusResponse> {
    let url = format!("{}/status", base_address);
    let response = http.get(&url).send().await?;
    read_json(&url, response).await
}

/// `GET /challenge` on an arbitrary base address.
pub async fn fetch_challenge(http: &Client, base_address: &str) -> Result<ChallengeResponse> {
    let url = format!("{}/challenge", base_address);
    let response = http.get(&url).send().await?;
    read_json(&url, response).await
}

async fn read_json<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::UnexpectedStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.json::<T>().await?)
}

async fn read_optional_json<T: DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<Option<T>> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    read_json(url, response).await.map(Some)
}
