use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::*;

pub mod kv;

pub use kv::KvStore;

const TREE_TRAINS: &str = "trains";
const TREE_SECTIONS: &str = "sections";
const TREE_POSITIONS: &str = "positions";
const TREE_LATEST: &str = "latest_positions";
const TREE_OCCUPANCIES: &str = "occupancies";
const TREE_CONFLICTS: &str = "conflicts";
const TREE_DECISIONS: &str = "decisions";
const TREE_CONTROLLERS: &str = "controllers";

/// Authoritative store for all engine entities. Durable state lives in sled
/// trees (canonical JSON values); the hot indexes (latest position per train,
/// open occupancy per section) are kept in memory and rebuilt from the
/// trees at startup.
pub struct DomainStore {
    db: sled::Db,
    trains: sled::Tree,
    sections: sled::Tree,
    positions: sled::Tree,
    latest: sled::Tree,
    occupancies: sled::Tree,
    conflicts: sled::Tree,
    decisions: sled::Tree,
    controllers: sled::Tree,
    indexes: RwLock<LiveIndexes>,
}

#[derive(Default)]
struct LiveIndexes {
    latest_positions: HashMap<TrainId, PositionReport>,
    /// One open occupancy per train at most.
    open_by_train: HashMap<TrainId, OccupancyRecord>,
    trains_by_section: HashMap<SectionId, BTreeSet<TrainId>>,
}

/// Point-in-time view handed to the conflict detector. Detection is pure over
/// this value, so identical snapshots yield identical conflicts.
#[derive(Debug, Clone)]
pub struct DetectionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub trains: Vec<Train>,
    pub sections: HashMap<SectionId, Section>,
    pub open_occupancies: Vec<OccupancyRecord>,
}

/// Audit query filters; all optional and conjunctive.
#[derive(Debug, Default, Clone)]
pub struct DecisionFilter {
    pub controller_id: Option<ControllerId>,
    pub train_id: Option<TrainId>,
    pub conflict_id: Option<u64>,
    pub action: Option<DecisionAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub executed: Option<bool>,
}

fn encode<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> EngineResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn u32_key(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

fn u64_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Time-series key: train id then timestamp, so a train's reports are
/// contiguous and ordered.
fn position_key(train_id: TrainId, timestamp: DateTime<Utc>) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&train_id.to_be_bytes());
    key[4..].copy_from_slice(&timestamp.timestamp_micros().to_be_bytes());
    key
}

/// Retry a transient storage failure once inline before surfacing it.
pub async fn with_transient_retry<T, F, Fut>(mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!("transient storage failure, retrying once: {}", e);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            op().await
        }
        other => other,
    }
}

impl DomainStore {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let db = sled::open(path)?;
        let latest = db.open_tree(TREE_LATEST)?;
        let occupancies = db.open_tree(TREE_OCCUPANCIES)?;
        let indexes = Self::recover_indexes(&latest, &occupancies)?;
        Ok(Self {
            trains: db.open_tree(TREE_TRAINS)?,
            sections: db.open_tree(TREE_SECTIONS)?,
            positions: db.open_tree(TREE_POSITIONS)?,
            latest,
            occupancies,
            conflicts: db.open_tree(TREE_CONFLICTS)?,
            decisions: db.open_tree(TREE_DECISIONS)?,
            controllers: db.open_tree(TREE_CONTROLLERS)?,
            indexes: RwLock::new(indexes),
            db,
        })
    }

    /// Rebuild the in-memory indexes from the persisted latest-position
    /// snapshot and open occupancy records.
    fn recover_indexes(
        latest: &sled::Tree,
        occupancies: &sled::Tree,
    ) -> EngineResult<LiveIndexes> {
        let mut indexes = LiveIndexes::default();
        for entry in latest.iter() {
            let (_, value) = entry?;
            let report: PositionReport = decode(&value)?;
            indexes.latest_positions.insert(report.train_id, report);
        }
        for entry in occupancies.iter() {
            let (_, value) = entry?;
            let record: OccupancyRecord = decode(&value)?;
            if record.is_open() {
                indexes
                    .trains_by_section
                    .entry(record.section_id)
                    .or_default()
                    .insert(record.train_id);
                indexes.open_by_train.insert(record.train_id, record);
            }
        }
        if !indexes.latest_positions.is_empty() || !indexes.open_by_train.is_empty() {
            info!(
                "recovered {} latest positions and {} open occupancies",
                indexes.latest_positions.len(),
                indexes.open_by_train.len()
            );
        }
        Ok(indexes)
    }

    pub fn next_id(&self) -> EngineResult<u64> {
        Ok(self.db.generate_id()?)
    }

    // ── Trains ──────────────────────────────────────────────────────────

    pub async fn upsert_train(&self, train: &Train) -> EngineResult<()> {
        train.validate().map_err(EngineError::Validation)?;
        self.trains.insert(u32_key(train.id), encode(train)?)?;
        Ok(())
    }

    pub async fn get_train(&self, train_id: TrainId) -> EngineResult<Option<Train>> {
        match self.trains.get(u32_key(train_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn require_train(&self, train_id: TrainId) -> EngineResult<Train> {
        self.get_train(train_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("train {}", train_id)))
    }

    pub async fn list_trains(&self) -> EngineResult<Vec<Train>> {
        let mut trains = Vec::new();
        for entry in self.trains.iter() {
            let (_, value) = entry?;
            trains.push(decode(&value)?);
        }
        Ok(trains)
    }

    pub async fn delete_train(&self, train_id: TrainId) -> EngineResult<bool> {
        let existed = self.trains.remove(u32_key(train_id))?.is_some();
        if existed {
            // Close any occupancy the train still holds.
            let now = Utc::now();
            let mut indexes = self.indexes.write().await;
            if let Some(mut record) = indexes.open_by_train.remove(&train_id) {
                record.exit_time = Some(now);
                if let Some(set) = indexes.trains_by_section.get_mut(&record.section_id) {
                    set.remove(&train_id);
                }
                self.occupancies.insert(u64_key(record.id), encode(&record)?)?;
            }
            indexes.latest_positions.remove(&train_id);
            self.latest.remove(u32_key(train_id))?;
        }
        Ok(existed)
    }

    // ── Sections ────────────────────────────────────────────────────────

    pub async fn upsert_section(&self, section: &Section) -> EngineResult<()> {
        section.validate().map_err(EngineError::Validation)?;
        self.sections.insert(u32_key(section.id), encode(section)?)?;
        Ok(())
    }

    pub async fn get_section(&self, section_id: SectionId) -> EngineResult<Option<Section>> {
        match self.sections.get(u32_key(section_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn require_section(&self, section_id: SectionId) -> EngineResult<Section> {
        self.get_section(section_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("section {}", section_id)))
    }

    pub async fn list_sections(&self) -> EngineResult<Vec<Section>> {
        let mut sections = Vec::new();
        for entry in self.sections.iter() {
            let (_, value) = entry?;
            sections.push(decode(&value)?);
        }
        Ok(sections)
    }

    // ── Positions and occupancy ─────────────────────────────────────────

    pub async fn latest_position(&self, train_id: TrainId) -> Option<PositionReport> {
        self.indexes.read().await.latest_positions.get(&train_id).cloned()
    }

    /// Apply an accepted position report: append to the time series, update
    /// the latest-position index and, when the section changed, close the old
    /// occupancy and open a new one. Returns the transition, if any.
    pub async fn apply_position(
        &self,
        report: &PositionReport,
        expected_exit_time: Option<DateTime<Utc>>,
    ) -> EngineResult<Option<SectionTransition>> {
        let mut indexes = self.indexes.write().await;
        let previous = indexes.latest_positions.get(&report.train_id).cloned();
        if let Some(prev) = &previous {
            // Per-train clock is monotonic; an equal timestamp is a re-send.
            if report.timestamp <= prev.timestamp {
                return Err(EngineError::Stale {
                    train_id: report.train_id,
                    reported: report.timestamp,
                    latest: prev.timestamp,
                });
            }
        }

        let transition = match &previous {
            Some(prev) if prev.section_id == report.section_id => None,
            _ => {
                let closed = if let Some(mut open) = indexes.open_by_train.remove(&report.train_id) {
                    open.exit_time = Some(report.timestamp);
                    if let Some(set) = indexes.trains_by_section.get_mut(&open.section_id) {
                        set.remove(&report.train_id);
                    }
                    self.occupancies.insert(u64_key(open.id), encode(&open)?)?;
                    Some(open)
                } else {
                    None
                };

                let opened = OccupancyRecord {
                    id: self.next_id()?,
                    section_id: report.section_id,
                    train_id: report.train_id,
                    entry_time: report.timestamp,
                    expected_exit_time,
                    exit_time: None,
                };
                self.occupancies.insert(u64_key(opened.id), encode(&opened)?)?;
                indexes
                    .trains_by_section
                    .entry(report.section_id)
                    .or_default()
                    .insert(report.train_id);
                indexes.open_by_train.insert(report.train_id, opened.clone());
                Some(SectionTransition { closed, opened })
            }
        };

        self.positions
            .insert(position_key(report.train_id, report.timestamp), encode(report)?)?;
        self.latest.insert(u32_key(report.train_id), encode(report)?)?;
        indexes.latest_positions.insert(report.train_id, report.clone());

        // Mirror the movement onto the train record.
        if let Some(bytes) = self.trains.get(u32_key(report.train_id))? {
            let mut train: Train = decode(&bytes)?;
            train.current_section = Some(report.section_id);
            train.current_speed_kmh = report.speed_kmh.min(train.max_speed_kmh);
            train.updated_at = report.timestamp;
            if transition.is_some() {
                // Entering a scheduled section consumes the route prefix.
                if let Some(pos) = train.route.iter().position(|&s| s == report.section_id) {
                    train.route.drain(..=pos);
                }
            }
            self.trains.insert(u32_key(train.id), encode(&train)?)?;
        }

        Ok(transition)
    }

    pub async fn trains_in_section(&self, section_id: SectionId) -> Vec<TrainId> {
        self.indexes
            .read()
            .await
            .trains_by_section
            .get(&section_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn open_occupancies(&self) -> Vec<OccupancyRecord> {
        let indexes = self.indexes.read().await;
        let mut records: Vec<_> = indexes.open_by_train.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub async fn positions_for_train(
        &self,
        train_id: TrainId,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<PositionReport>> {
        let start = position_key(train_id, since);
        let end = position_key(train_id, DateTime::<Utc>::MAX_UTC);
        let mut reports = Vec::new();
        for entry in self.positions.range(start..=end) {
            let (_, value) = entry?;
            reports.push(decode(&value)?);
        }
        Ok(reports)
    }

    /// Drop position rows older than the retention cutoff. Returns the number
    /// of rows removed.
    pub async fn prune_positions(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let mut removed = 0;
        for entry in self.positions.iter() {
            let (key, value) = entry?;
            let report: PositionReport = decode(&value)?;
            if report.timestamp < cutoff {
                self.positions.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Conflicts ───────────────────────────────────────────────────────

    pub async fn insert_conflict(&self, mut conflict: Conflict) -> EngineResult<Conflict> {
        conflict.check_invariants().map_err(EngineError::Validation)?;
        if conflict.id == 0 {
            conflict.id = self.next_id()?;
        }
        self.conflicts.insert(u64_key(conflict.id), encode(&conflict)?)?;
        Ok(conflict)
    }

    pub async fn update_conflict(&self, conflict: &Conflict) -> EngineResult<()> {
        conflict.check_invariants().map_err(EngineError::Validation)?;
        self.conflicts.insert(u64_key(conflict.id), encode(conflict)?)?;
        Ok(())
    }

    pub async fn get_conflict(&self, conflict_id: u64) -> EngineResult<Option<Conflict>> {
        match self.conflicts.get(u64_key(conflict_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn unresolved_conflicts(&self) -> EngineResult<Vec<Conflict>> {
        let mut open = Vec::new();
        for entry in self.conflicts.iter() {
            let (_, value) = entry?;
            let conflict: Conflict = decode(&value)?;
            if !conflict.is_resolved() {
                open.push(conflict);
            }
        }
        Ok(open)
    }

    pub async fn all_conflicts(&self) -> EngineResult<Vec<Conflict>> {
        let mut all = Vec::new();
        for entry in self.conflicts.iter() {
            let (_, value) = entry?;
            all.push(decode(&value)?);
        }
        Ok(all)
    }

    // ── Decisions ───────────────────────────────────────────────────────

    pub async fn insert_decision(&self, mut decision: Decision) -> EngineResult<Decision> {
        decision.check_invariants().map_err(EngineError::Validation)?;
        if decision.id == 0 {
            decision.id = self.next_id()?;
        }
        self.decisions.insert(u64_key(decision.id), encode(&decision)?)?;
        Ok(decision)
    }

    pub async fn update_decision(&self, decision: &Decision) -> EngineResult<()> {
        decision.check_invariants().map_err(EngineError::Validation)?;
        self.decisions.insert(u64_key(decision.id), encode(decision)?)?;
        Ok(())
    }

    pub async fn get_decision(&self, decision_id: u64) -> EngineResult<Option<Decision>> {
        match self.decisions.get(u64_key(decision_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn query_decisions(
        &self,
        filter: &DecisionFilter,
        offset: usize,
        limit: usize,
    ) -> EngineResult<(Vec<Decision>, usize)> {
        let mut matched = Vec::new();
        for entry in self.decisions.iter() {
            let (_, value) = entry?;
            let decision: Decision = decode(&value)?;
            if let Some(cid) = &filter.controller_id {
                if decision.controller_id != *cid {
                    continue;
                }
            }
            if let Some(tid) = filter.train_id {
                if decision.train_id != Some(tid) {
                    continue;
                }
            }
            if let Some(kid) = filter.conflict_id {
                if decision.conflict_id != Some(kid) {
                    continue;
                }
            }
            if let Some(action) = filter.action {
                if decision.action != action {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if decision.timestamp < since {
                    continue;
                }
            }
            if let Some(until) = filter.until {
                if decision.timestamp > until {
                    continue;
                }
            }
            if let Some(executed) = filter.executed {
                if decision.executed != executed {
                    continue;
                }
            }
            matched.push(decision);
        }
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        let total = matched.len();
        let page = matched.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    // ── Controllers ─────────────────────────────────────────────────────

    pub async fn upsert_controller(&self, controller: &Controller) -> EngineResult<()> {
        self.controllers
            .insert(controller.id.as_bytes(), encode(controller)?)?;
        Ok(())
    }

    pub async fn get_controller(&self, controller_id: &str) -> EngineResult<Option<Controller>> {
        match self.controllers.get(controller_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn find_controller_by_employee(
        &self,
        employee_id: &str,
    ) -> EngineResult<Option<Controller>> {
        for entry in self.controllers.iter() {
            let (_, value) = entry?;
            let controller: Controller = decode(&value)?;
            if controller.employee_id == employee_id {
                return Ok(Some(controller));
            }
        }
        Ok(None)
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub async fn detection_snapshot(&self) -> EngineResult<DetectionSnapshot> {
        let trains = self.list_trains().await?;
        let sections = self
            .list_sections()
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        let open_occupancies = self.open_occupancies().await;
        Ok(DetectionSnapshot {
            taken_at: Utc::now(),
            trains,
            sections,
            open_occupancies,
        })
    }
}

/// Result of a section change applied by the store: the occupancy that was
/// closed (if the train was somewhere before) and the one opened.
#[derive(Debug, Clone)]
pub struct SectionTransition {
    pub closed: Option<OccupancyRecord>,
    pub opened: OccupancyRecord,
}
