//! Append-mostly deployment history.
//!
//! # Layout
//!
//! ```text
//!   newest ──────────────────────────────────────────────► oldest
//!   ┌────────────────────────────┐ ┌──────────────────────────────┐
//!   │ recent window (mutable)    │ │ immutable tail (write-once)  │
//!   │ sorted newest → oldest     │ │ stored oldest → newest       │
//!   │ rewritten on every record  │ │ appended one segment per     │
//!   │                            │ │ promotion, never rewritten   │
//!   └────────────────────────────┘ └──────────────────────────────┘
//!                                 ▲
//!                          immutable boundary
//! ```
//!
//! New deployments land in the recent window. `mark_as_immutable` moves
//! every event at or before the boundary into a new tail segment. Queries
//! that start after the boundary never touch the tail.
//!
//! Events older than the boundary may still be recorded (a peer replaying its
//! history), so neither the tail segments nor the window/tail split are in
//! global order. Queries sort the tail and merge it with the window.

use catalyst_storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::types::{DeploymentEvent, EntityType, Timestamp};

/// Upper bound (and default) for the number of events in one page.
pub const MAX_HISTORY_LIMIT: usize = 500;

const HISTORY_CATEGORY: &str = "history";
const SEGMENT_CATEGORY: &str = "history.immutable";
const RECENT_KEY: &str = "recent";
const META_KEY: &str = "meta";

/// Filters for a history query. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
}

impl DeploymentFilters {
    fn matches(&self, event: &DeploymentEvent) -> bool {
        self.from.map_or(true, |from| event.timestamp >= from)
            && self.to.map_or(true, |to| event.timestamp <= to)
            && self
                .server_name
                .as_deref()
                .map_or(true, |name| event.server_name == name)
            && self.entity_type.map_or(true, |t| event.entity_type == t)
    }
}

/// Pagination metadata of a history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
    pub more_data: bool,
}

/// One page of deployment history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub deployments: Vec<DeploymentEvent>,
    pub filters: DeploymentFilters,
    pub pagination: Pagination,
}

/// Clamp a requested page size into `1..=MAX_HISTORY_LIMIT`.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    match limit {
        Some(limit) if limit > 0 => limit.min(MAX_HISTORY_LIMIT),
        _ => MAX_HISTORY_LIMIT,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerMeta {
    boundary: Timestamp,
    immutable_count: usize,
    segments: u64,
}

/// The node's own deployment history.
pub struct HistoryLedger {
    storage: Arc<dyn Storage>,
    recent: Vec<DeploymentEvent>,
    meta: LedgerMeta,
}

impl HistoryLedger {
    /// Open the ledger, reloading any persisted recent window and metadata.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self> {
        let recent = match storage.get(HISTORY_CATEGORY, RECENT_KEY)? {
            Some(data) => serde_json::from_slice(&data)?,
            None => Vec::new(),
        };
        let meta = match storage.get(HISTORY_CATEGORY, META_KEY)? {
            Some(data) => serde_json::from_slice(&data)?,
            None => LedgerMeta::default(),
        };

        debug!(
            recent = recent.len(),
            immutable = meta.immutable_count,
            boundary = meta.boundary,
            "history ledger opened"
        );

        Ok(Self {
            storage,
            recent,
            meta,
        })
    }

    /// Record a deployment in the recent window.
    pub fn record(
        &mut self,
        server_name: &str,
        entity_type: EntityType,
        entity_id: &str,
        timestamp: Timestamp,
    ) -> Result<()> {
        let event = DeploymentEvent::new(server_name, entity_type, entity_id, timestamp);

        // First position whose event is not newer than the new one.
        let index = self
            .recent
            .iter()
            .position(|existing| !existing.is_newer_than(&event))
            .unwrap_or(self.recent.len());
        self.recent.insert(index, event);

        self.persist_recent()?;
        trace!(entity_id, timestamp, index, "recorded deployment");
        Ok(())
    }

    /// Promote every recent event at or before `boundary` to the immutable tail.
    ///
    /// The boundary is monotonic: a value below the current boundary is ignored,
    /// and the boundary advances even when no event qualifies.
    pub fn mark_as_immutable(&mut self, boundary: Timestamp) -> Result<()> {
        let boundary = boundary.max(self.meta.boundary);

        let split = self.recent.partition_point(|e| e.timestamp > boundary);
        let mut promoted = self.recent.split_off(split);

        if promoted.is_empty() {
            if boundary != self.meta.boundary {
                self.meta.boundary = boundary;
                self.persist_meta()?;
            }
            return Ok(());
        }

        promoted.reverse();
        let segment = self.meta.segments + 1;
        let data = serde_json::to_vec(&promoted)?;
        self.storage
            .put(SEGMENT_CATEGORY, &segment_key(segment), &data)?;

        self.meta = LedgerMeta {
            boundary,
            immutable_count: self.meta.immutable_count + promoted.len(),
            segments: segment,
        };
        self.persist_meta()?;
        self.persist_recent()?;

        debug!(
            promoted = promoted.len(),
            boundary,
            segment,
            "promoted deployments to immutable history"
        );
        Ok(())
    }

    /// Query the history, newest first.
    pub fn query(
        &self,
        filters: DeploymentFilters,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<HistoryPage> {
        let limit = clamp_limit(limit);

        let needs_tail = filters.from.map_or(true, |from| from <= self.meta.boundary);
        let tail = if needs_tail {
            self.load_immutable_tail()?
        } else {
            Vec::new()
        };

        let matching: Vec<&DeploymentEvent> = merge_newest_first(&self.recent, &tail)
            .into_iter()
            .filter(|event| filters.matches(event))
            .collect();

        let deployments = matching
            .iter()
            .skip(offset)
            .take(limit)
            .map(|event| (*event).clone())
            .collect();
        let more_data = offset.saturating_add(limit) < matching.len();

        Ok(HistoryPage {
            deployments,
            filters,
            pagination: Pagination {
                offset,
                limit,
                more_data,
            },
        })
    }

    /// Total number of recorded events.
    pub fn size(&self) -> usize {
        self.meta.immutable_count + self.recent.len()
    }

    /// Current immutable boundary.
    pub fn immutable_boundary(&self) -> Timestamp {
        self.meta.boundary
    }

    /// Events not yet promoted, newest first.
    pub fn recent_window(&self) -> &[DeploymentEvent] {
        &self.recent
    }

    /// The whole tail, oldest first.
    ///
    /// Segments are only ordered internally: an event recorded late (older
    /// than the boundary at the time) lands in a later segment than newer
    /// events, so the concatenation is re-sorted.
    fn load_immutable_tail(&self) -> Result<Vec<DeploymentEvent>> {
        let mut tail = Vec::with_capacity(self.meta.immutable_count);
        for (_, data) in self.storage.list(SEGMENT_CATEGORY)? {
            let segment: Vec<DeploymentEvent> = serde_json::from_slice(&data)?;
            tail.extend(segment);
        }
        tail.sort_by(|a, b| a.chronological_cmp(b));
        Ok(tail)
    }

    fn persist_recent(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.recent)?;
        self.storage.put(HISTORY_CATEGORY, RECENT_KEY, &data)?;
        Ok(())
    }

    fn persist_meta(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.meta)?;
        self.storage.put(HISTORY_CATEGORY, META_KEY, &data)?;
        Ok(())
    }
}

/// Merge the recent window (newest first) with the tail (oldest first).
///
/// Late events can leave the recent window holding events older than parts
/// of the tail, so the two are interleaved rather than concatenated.
fn merge_newest_first<'a>(
    recent: &'a [DeploymentEvent],
    tail: &'a [DeploymentEvent],
) -> Vec<&'a DeploymentEvent> {
    let mut merged = Vec::with_capacity(recent.len() + tail.len());
    let mut recent = recent.iter().peekable();
    let mut older = tail.iter().rev().peekable();

    loop {
        let from_recent = match (recent.peek(), older.peek()) {
            (Some(r), Some(o)) => !o.is_newer_than(r),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if from_recent { recent.next() } else { older.next() };
        merged.extend(next);
    }
    merged
}

fn segment_key(segment: u64) -> String {
    format!("{:012}", segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalyst_storage::MemoryStorage;
    use proptest::prelude::*;

    fn ledger() -> HistoryLedger {
        HistoryLedger::open(Arc::new(MemoryStorage::new())).unwrap()
    }

    fn timestamps(events: &[DeploymentEvent]) -> Vec<Timestamp> {
        events.iter().map(|e| e.timestamp).collect()
    }

    fn is_newest_first(events: &[DeploymentEvent]) -> bool {
        events.windows(2).all(|w| !w[1].is_newer_than(&w[0]))
    }

    #[test]
    fn record_keeps_newest_first() {
        let mut ledger = ledger();
        ledger.record("a", EntityType::Scene, "e1", 100).unwrap();
        ledger.record("a", EntityType::Scene, "e2", 300).unwrap();
        ledger.record("a", EntityType::Scene, "e3", 200).unwrap();
        ledger.record("a", EntityType::Scene, "e4", 50).unwrap();

        assert_eq!(timestamps(ledger.recent_window()), vec![300, 200, 100, 50]);
        assert_eq!(ledger.size(), 4);
    }

    #[test]
    fn mark_as_immutable_promotes_old_events() {
        let mut ledger = ledger();
        for (id, ts) in [("e1", 100), ("e2", 200), ("e3", 300)] {
            ledger.record("a", EntityType::Scene, id, ts).unwrap();
        }

        ledger.mark_as_immutable(200).unwrap();

        assert_eq!(timestamps(ledger.recent_window()), vec![300]);
        assert_eq!(ledger.immutable_boundary(), 200);
        assert_eq!(ledger.size(), 3);

        let tail = ledger.load_immutable_tail().unwrap();
        assert_eq!(timestamps(&tail), vec![100, 200]);
    }

    #[test]
    fn mark_as_immutable_is_idempotent() {
        let mut ledger = ledger();
        ledger.record("a", EntityType::Scene, "e1", 100).unwrap();
        ledger.record("a", EntityType::Scene, "e2", 300).unwrap();

        ledger.mark_as_immutable(150).unwrap();
        let size = ledger.size();
        let tail = ledger.load_immutable_tail().unwrap();

        ledger.mark_as_immutable(150).unwrap();
        assert_eq!(ledger.size(), size);
        assert_eq!(ledger.immutable_boundary(), 150);
        assert_eq!(ledger.load_immutable_tail().unwrap(), tail);
    }

    #[test]
    fn boundary_advances_without_promotion_and_never_regresses() {
        let mut ledger = ledger();
        ledger.record("a", EntityType::Scene, "e1", 500).unwrap();

        ledger.mark_as_immutable(100).unwrap();
        assert_eq!(ledger.immutable_boundary(), 100);
        assert_eq!(ledger.recent_window().len(), 1);

        ledger.mark_as_immutable(50).unwrap();
        assert_eq!(ledger.immutable_boundary(), 100);
    }

    #[test]
    fn query_reads_through_immutable_tail() {
        let mut ledger = ledger();
        for (id, ts) in [("e1", 100), ("e2", 200), ("e3", 300), ("e4", 400)] {
            ledger.record("a", EntityType::Scene, id, ts).unwrap();
        }
        ledger.mark_as_immutable(250).unwrap();

        let page = ledger.query(DeploymentFilters::default(), 0, None).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![400, 300, 200, 100]);
        assert!(!page.pagination.more_data);

        let filters = DeploymentFilters {
            from: Some(150),
            to: Some(350),
            ..Default::default()
        };
        let page = ledger.query(filters, 0, None).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![300, 200]);
    }

    #[test]
    fn query_after_boundary_skips_tail() {
        let mut ledger = ledger();
        ledger.record("a", EntityType::Scene, "e1", 100).unwrap();
        ledger.record("a", EntityType::Scene, "e2", 300).unwrap();
        ledger.mark_as_immutable(200).unwrap();

        let filters = DeploymentFilters {
            from: Some(201),
            ..Default::default()
        };
        let page = ledger.query(filters, 0, None).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![300]);
    }

    #[test]
    fn query_filters_by_server_name() {
        let mut ledger = ledger();
        ledger.record("a", EntityType::Scene, "e1", 100).unwrap();
        ledger.record("b", EntityType::Profile, "e2", 200).unwrap();
        ledger.record("a", EntityType::Wearable, "e3", 300).unwrap();

        let filters = DeploymentFilters {
            server_name: Some("a".into()),
            ..Default::default()
        };
        let page = ledger.query(filters, 0, None).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![300, 100]);
        assert!(page.deployments.iter().all(|e| e.server_name == "a"));
    }

    #[test]
    fn query_paginates() {
        let mut ledger = ledger();
        for ts in 1..=10u64 {
            ledger
                .record("a", EntityType::Scene, &format!("e{}", ts), ts)
                .unwrap();
        }

        let page = ledger.query(DeploymentFilters::default(), 0, Some(4)).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![10, 9, 8, 7]);
        assert!(page.pagination.more_data);

        let page = ledger.query(DeploymentFilters::default(), 8, Some(4)).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![2, 1]);
        assert!(!page.pagination.more_data);

        let page = ledger.query(DeploymentFilters::default(), 6, Some(4)).unwrap();
        assert_eq!(page.deployments.len(), 4);
        assert!(!page.pagination.more_data);
    }

    #[test]
    fn late_event_promoted_in_later_segment_keeps_order() {
        let mut ledger = ledger();
        ledger.record("a", EntityType::Scene, "new", 1000).unwrap();
        ledger.mark_as_immutable(1500).unwrap();
        ledger.record("b", EntityType::Scene, "old", 10).unwrap();

        // Still in the recent window, but older than the tail.
        let page = ledger.query(DeploymentFilters::default(), 0, None).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![1000, 10]);

        ledger.mark_as_immutable(1500).unwrap();
        assert!(ledger.recent_window().is_empty());
        let page = ledger.query(DeploymentFilters::default(), 0, None).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![1000, 10]);

        ledger.record("a", EntityType::Scene, "newest", 2000).unwrap();
        ledger.record("b", EntityType::Scene, "middle", 500).unwrap();
        let page = ledger.query(DeploymentFilters::default(), 0, None).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![2000, 1000, 500, 10]);

        let page = ledger.query(DeploymentFilters::default(), 1, Some(2)).unwrap();
        assert_eq!(timestamps(&page.deployments), vec![1000, 500]);
        assert!(page.pagination.more_data);
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_limit(None), MAX_HISTORY_LIMIT);
        assert_eq!(clamp_limit(Some(0)), MAX_HISTORY_LIMIT);
        assert_eq!(clamp_limit(Some(10_000)), MAX_HISTORY_LIMIT);
        assert_eq!(clamp_limit(Some(7)), 7);
    }

    #[test]
    fn reopen_restores_state() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        {
            let mut ledger = HistoryLedger::open(Arc::clone(&storage)).unwrap();
            ledger.record("a", EntityType::Scene, "e1", 100).unwrap();
            ledger.record("a", EntityType::Scene, "e2", 200).unwrap();
            ledger.mark_as_immutable(150).unwrap();
            ledger.record("a", EntityType::Scene, "e3", 300).unwrap();
        }

        let ledger = HistoryLedger::open(storage).unwrap();
        assert_eq!(ledger.size(), 3);
        assert_eq!(ledger.immutable_boundary(), 150);
        assert_eq!(timestamps(ledger.recent_window()), vec![300, 200]);
    }

    proptest! {
        #[test]
        fn recent_window_stays_sorted(stamps in proptest::collection::vec(0u64..50, 1..40)) {
            let mut ledger = ledger();
            for (i, ts) in stamps.iter().enumerate() {
                ledger.record("a", EntityType::Scene, &format!("e{}", i), *ts).unwrap();
                prop_assert!(is_newest_first(ledger.recent_window()));
            }
        }

        #[test]
        fn promoted_events_round_trip(
            stamps in proptest::collection::vec(0u64..1_000, 1..60),
            boundary in 0u64..1_000,
        ) {
            let mut ledger = ledger();
            for (i, ts) in stamps.iter().enumerate() {
                ledger.record("a", EntityType::Scene, &format!("e{}", i), *ts).unwrap();
            }
            let before = ledger.query(DeploymentFilters::default(), 0, None).unwrap();

            ledger.mark_as_immutable(boundary).unwrap();
            let after = ledger.query(DeploymentFilters { from: Some(0), ..Default::default() }, 0, None).unwrap();

            prop_assert_eq!(before.deployments, after.deployments.clone());
            prop_assert!(is_newest_first(&after.deployments));
            prop_assert_eq!(ledger.size(), stamps.len());
        }

        #[test]
        fn interleaved_promotions_stay_newest_first(
            steps in proptest::collection::vec((0u64..1_000, any::<bool>(), 0u64..1_000), 1..60),
        ) {
            let mut ledger = ledger();
            for (i, (ts, promote, boundary)) in steps.iter().enumerate() {
                ledger.record("a", EntityType::Scene, &format!("e{}", i), *ts).unwrap();
                if *promote {
                    ledger.mark_as_immutable(*boundary).unwrap();
                }
            }

            let page = ledger.query(DeploymentFilters::default(), 0, None).unwrap();
            prop_assert!(is_newest_first(&page.deployments));
            prop_assert_eq!(page.deployments.len(), steps.len());
            prop_assert_eq!(ledger.size(), steps.len());
        }

        #[test]
        fn page_never_exceeds_limit(
            count in 0usize..80,
            offset in 0usize..100,
            limit in 0usize..700,
        ) {
            let mut ledger = ledger();
            for i in 0..count {
                ledger.record("a", EntityType::Scene, &format!("e{}", i), i as u64).unwrap();
            }

            let page = ledger.query(DeploymentFilters::default(), offset, Some(limit)).unwrap();
            let effective = clamp_limit(Some(limit));
            prop_assert!(page.deployments.len() <= effective);
            prop_assert_eq!(page.pagination.more_data, offset + effective < count);
        }
    }
}
