use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DetectionConfig;
use crate::error::EngineResult;
use crate::hub::BroadcastHub;
use crate::metrics::EngineMetrics;
use crate::models::*;
use crate::ratelimit::{EndpointKind, RateLimiter};
use crate::storage::{DomainStore, KvStore};

use super::ConflictDetector;

const LEADER_KEY: &str = "detection:leader";

/// Net result of one detection run, returned synchronously to manual callers.
#[derive(Debug, Default)]
pub struct DetectionDelta {
    pub new_conflicts: Vec<Conflict>,
    pub updated_conflicts: Vec<Conflict>,
    pub alerts_emitted: usize,
}

/// Drives the detector on a fixed period and on demand. One logical driver
/// per cluster: instances race for an advisory lease in the shared KV store.
pub struct DetectionScheduler {
    store: Arc<DomainStore>,
    kv: Arc<KvStore>,
    hub: Arc<BroadcastHub>,
    detector: Arc<ConflictDetector>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<EngineMetrics>,
    config: DetectionConfig,
    run_lock: Mutex<()>,
    instance_id: String,
}

impl DetectionScheduler {
    pub fn new(
        store: Arc<DomainStore>,
        kv: Arc<KvStore>,
        hub: Arc<BroadcastHub>,
        detector: Arc<ConflictDetector>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<EngineMetrics>,
        config: DetectionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            kv,
            hub,
            detector,
            limiter,
            metrics,
            config,
            run_lock: Mutex::new(()),
            instance_id: Uuid::new_v4().to_string(),
        })
    }

    /// Start the periodic driver. Runs until the shutdown signal flips.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(scheduler.config.interval_secs);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                "detection driver started, period {}s",
                scheduler.config.interval_secs
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.tick().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("detection driver stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One periodic tick: skip when a run is already in flight or another
    /// instance holds the lease.
    pub async fn tick(&self) {
        let Ok(guard) = self.run_lock.try_lock() else {
            self.metrics.detection_skipped_ticks.inc();
            debug!("detection tick skipped, run in progress");
            return;
        };
        if !self.acquire_leadership().await {
            debug!("detection tick skipped, another instance holds the lease");
            return;
        }
        if let Err(e) = self.run_under_lock().await {
            error!("detection run failed: {}", e);
        }
        drop(guard);
    }

    async fn acquire_leadership(&self) -> bool {
        let lease = Duration::from_secs(self.config.interval_secs * 2);
        match self.kv.get(LEADER_KEY).await {
            Some(owner) if owner == self.instance_id => {
                self.kv.set_with_ttl(LEADER_KEY, &self.instance_id, lease).await;
                true
            }
            Some(_) => false,
            None => self.kv.try_acquire(LEADER_KEY, &self.instance_id, lease).await,
        }
    }

    /// Manual invocation: rate-limited system-wide, waits for any in-flight
    /// run, returns the resulting delta.
    pub async fn run_detection_once(&self) -> EngineResult<DetectionDelta> {
        self.limiter
            .check("system", EndpointKind::ManualDetection)
            .await?;
        let _guard = self.run_lock.lock().await;
        self.run_under_lock().await
    }

    /// Snapshot, detect (bounded by the run timeout), reconcile, persist and
    /// publish. A timed-out run publishes and persists nothing.
    async fn run_under_lock(&self) -> EngineResult<DetectionDelta> {
        let started = std::time::Instant::now();
        let snapshot = self.store.detection_snapshot().await?;
        let detector = self.detector.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let detected = detector.detect_all(&snapshot);
            (snapshot, detected)
        });

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let (snapshot, detected) = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!("detection task panicked: {}", join_err);
                return Ok(DetectionDelta::default());
            }
            Err(_) => {
                self.metrics.detection_slow_runs.inc();
                warn!("detection run exceeded {}s and was cancelled", self.config.timeout_secs);
                return Ok(DetectionDelta::default());
            }
        };

        let delta = self.reconcile(&snapshot.taken_at, detected).await?;
        if !delta.new_conflicts.is_empty() || !delta.updated_conflicts.is_empty() {
            self.kv.delete("conflicts:active").await;
        }

        let elapsed = started.elapsed();
        self.metrics.detection_runs_total.inc();
        self.metrics.detect_duration.observe(elapsed.as_secs_f64());
        self.metrics
            .conflicts_found_total
            .inc_by(delta.new_conflicts.len() as u64);
        self.metrics
            .conflicts_dedup_total
            .inc_by(delta.updated_conflicts.len() as u64);
        let active = self.store.unresolved_conflicts().await?.len();
        self.metrics.conflicts_active.set(active as i64);
        debug!(
            "detection run: {} new, {} updated, {} alerts in {:?}",
            delta.new_conflicts.len(),
            delta.updated_conflicts.len(),
            delta.alerts_emitted,
            elapsed
        );
        Ok(delta)
    }

    /// Merge a detection pass into the stored conflicts: refresh open ones
    /// sharing an identity key, create the rest, and never resurrect a
    /// resolved condition.
    async fn reconcile(
        &self,
        taken_at: &chrono::DateTime<Utc>,
        detected: Vec<super::DetectedConflict>,
    ) -> EngineResult<DetectionDelta> {
        let existing = self.store.all_conflicts().await?;
        let mut open_by_key: HashMap<ConflictKey, Conflict> = HashMap::new();
        let mut resolved_keys: HashSet<ConflictKey> = HashSet::new();
        for conflict in existing {
            if conflict.is_resolved() {
                resolved_keys.insert(conflict.key());
            } else {
                open_by_key.insert(conflict.key(), conflict);
            }
        }

        let mut delta = DetectionDelta::default();
        for draft in detected {
            let key = draft.key();
            if resolved_keys.contains(&key) {
                continue;
            }
            if let Some(mut open) = open_by_key.remove(&key) {
                open.severity_score = draft.severity_score;
                open.severity = draft.severity;
                open.expected_impact_time = draft.expected_impact_time;
                open.description = draft.description;
                open.suggestions = draft.suggestions;
                self.store.update_conflict(&open).await?;
                self.hub.publish(EngineEvent::new(EventData::ConflictUpdated {
                    conflict: open.clone(),
                }));
                self.maybe_alert(&open, taken_at, &mut delta);
                delta.updated_conflicts.push(open);
            } else {
                let conflict = Conflict {
                    id: 0,
                    kind: draft.kind,
                    severity: draft.severity,
                    severity_score: draft.severity_score,
                    trains_involved: draft.trains_involved,
                    sections_involved: draft.sections_involved,
                    detection_time: *taken_at,
                    expected_impact_time: draft.expected_impact_time,
                    description: draft.description,
                    suggestions: draft.suggestions,
                    resolution_time: None,
                    resolved_by: None,
                    auto_resolved: false,
                    ai: None,
                };
                let conflict = self.store.insert_conflict(conflict).await?;
                self.hub.publish(EngineEvent::new(EventData::ConflictDetected {
                    conflict: conflict.clone(),
                }));
                self.maybe_alert(&conflict, taken_at, &mut delta);
                delta.new_conflicts.push(conflict);
            }
        }
        Ok(delta)
    }

    fn maybe_alert(
        &self,
        conflict: &Conflict,
        now: &chrono::DateTime<Utc>,
        delta: &mut DetectionDelta,
    ) {
        if conflict.severity_score < 6 {
            return;
        }
        let within_window = conflict
            .time_to_impact(*now)
            .map(|tti| tti.num_seconds() as u64 <= self.config.alert_window_secs)
            .unwrap_or(false);
        if !within_window {
            return;
        }
        self.hub.publish(EngineEvent::new(EventData::ConflictAlert {
            conflict_id: conflict.id,
            kind: conflict.kind,
            severity: conflict.severity,
            trains_involved: conflict.trains_involved.clone(),
            sections_involved: conflict.sections_involved.clone(),
            expected_impact_time: conflict.expected_impact_time,
            description: conflict.description.clone(),
            suggestions: conflict.suggestions.clone(),
        }));
        self.metrics.conflict_alerts_total.inc();
        delta.alerts_emitted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PredictionConfig, SeverityWeights};
    use crate::models::{SectionKind, TrainKind};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<DomainStore>,
        scheduler: Arc<DetectionScheduler>,
        hub: Arc<BroadcastHub>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default();
        let store = Arc::new(DomainStore::open(dir.path().join("db")).unwrap());
        let kv = Arc::new(KvStore::new());
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let hub = BroadcastHub::new(config.hub.clone(), metrics.clone());
        let detector = Arc::new(ConflictDetector::new(
            config.detection.clone(),
            PredictionConfig {
                horizon_secs: 3600,
                travel_time_floor_speed_kmh: 10.0,
                travel_time_margin: 1.0,
            },
            SeverityWeights {
                time: 3.0,
                priority: 2.0,
                passengers: 2.5,
                network: 1.5,
                safety: 1.0,
            },
        ));
        let limiter = Arc::new(RateLimiter::new(kv.clone(), config.rate_limits.clone()));
        let scheduler = DetectionScheduler::new(
            store.clone(),
            kv,
            hub.clone(),
            detector,
            limiter,
            metrics,
            config.detection.clone(),
        );
        Fixture {
            _dir: dir,
            store,
            scheduler,
            hub,
        }
    }

    async fn seed_overload(store: &DomainStore) {
        let mut section = Section::new(4, "SEC-004", SectionKind::Track);
        section.capacity = 1;
        section.length_m = 2_000.0;
        store.upsert_section(&section).await.unwrap();
        for id in [401u32, 402] {
            let mut train = Train::new(id, format!("T{id}"), TrainKind::Local, 5);
            train.current_load = 400;
            store.upsert_train(&train).await.unwrap();
            let report = PositionReport::new(id, 4, Utc::now(), 0.0);
            store.apply_position(&report, None).await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn detection_persists_new_conflicts() {
        let fx = fixture().await;
        seed_overload(&fx.store).await;
        let delta = fx.scheduler.run_detection_once().await.unwrap();
        assert_eq!(delta.new_conflicts.len(), 1);
        assert_eq!(delta.new_conflicts[0].kind, ConflictKind::SectionOverload);
        let stored = fx.store.unresolved_conflicts().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].id > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rerun_on_unchanged_state_dedups() {
        let fx = fixture().await;
        seed_overload(&fx.store).await;
        let first = fx.scheduler.run_detection_once().await.unwrap();
        let second = fx.scheduler.run_detection_once().await.unwrap();
        assert_eq!(first.new_conflicts.len(), 1);
        assert!(second.new_conflicts.is_empty());
        assert_eq!(second.updated_conflicts.len(), 1);
        assert_eq!(second.updated_conflicts[0].id, first.new_conflicts[0].id);
        assert_eq!(fx.store.unresolved_conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolved_conflicts_are_not_resurrected() {
        let fx = fixture().await;
        seed_overload(&fx.store).await;
        let delta = fx.scheduler.run_detection_once().await.unwrap();
        let mut conflict = delta.new_conflicts.into_iter().next().unwrap();
        conflict.resolution_time = Some(Utc::now());
        conflict.resolved_by = Some("CTR001".into());
        fx.store.update_conflict(&conflict).await.unwrap();

        let rerun = fx.scheduler.run_detection_once().await.unwrap();
        assert!(rerun.new_conflicts.is_empty());
        assert!(rerun.updated_conflicts.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn alert_broadcast_for_imminent_severe_conflicts() {
        let fx = fixture().await;
        let subscriber = fx.hub.register([crate::hub::Subscription::All].into()).await;
        seed_overload(&fx.store).await;
        let delta = fx.scheduler.run_detection_once().await.unwrap();
        // Overload is immediate; with two loaded locals it scores >= 6.
        assert!(delta.new_conflicts[0].severity_score >= 6);
        assert_eq!(delta.alerts_emitted, 1);
        let mut kinds = Vec::new();
        for _ in 0..2 {
            let event =
                tokio::time::timeout(Duration::from_secs(1), subscriber.next_event())
                    .await
                    .unwrap()
                    .unwrap();
            kinds.push(event.kind_name());
        }
        assert!(kinds.contains(&"ConflictDetected"));
        assert!(kinds.contains(&"ConflictAlert"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_runs_are_rate_limited() {
        let fx = fixture().await;
        let mut limited = 0;
        for _ in 0..7 {
            if fx.scheduler.run_detection_once().await.is_err() {
                limited += 1;
            }
        }
        assert_eq!(limited, 2);
    }
}
