use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IngestionConfig;
use crate::error::{EngineError, EngineResult};
use crate::hub::BroadcastHub;
use crate::metrics::EngineMetrics;
use crate::models::*;
use crate::storage::{with_transient_retry, DomainStore};

pub mod occupancy;

pub use occupancy::SectionLocks;

/// Acknowledgement returned for an accepted position report.
#[derive(Debug, Serialize, Deserialize)]
pub struct PositionAck {
    pub train_id: TrainId,
    pub section_id: SectionId,
    pub section_changed: bool,
}

/// High-rate position intake: validates reports, maintains the time series
/// and occupancy state through the domain store, and fans resulting events
/// out to the hub. Reports may be submitted synchronously or queued onto the
/// bounded worker pool.
pub struct PositionPipeline {
    store: Arc<DomainStore>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<EngineMetrics>,
    locks: SectionLocks,
    config: IngestionConfig,
    floor_speed_kmh: f32,
    queue_tx: mpsc::Sender<PositionReport>,
    queue_rx: Mutex<Option<mpsc::Receiver<PositionReport>>>,
}

impl PositionPipeline {
    pub fn new(
        store: Arc<DomainStore>,
        hub: Arc<BroadcastHub>,
        metrics: Arc<EngineMetrics>,
        config: IngestionConfig,
        floor_speed_kmh: f32,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        Arc::new(Self {
            store,
            hub,
            metrics,
            locks: SectionLocks::new(),
            config,
            floor_speed_kmh,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Start the worker pool draining the bounded queue.
    pub async fn spawn_workers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let receiver = self
            .queue_rx
            .lock()
            .await
            .take()
            .expect("ingestion workers already started");
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(self.config.worker_count);
        for worker in 0..self.config.worker_count {
            let pipeline = self.clone();
            let receiver = receiver.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                debug!("ingestion worker {} started", worker);
                loop {
                    let report = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            report = rx.recv() => report,
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() { None } else { continue }
                            }
                        }
                    };
                    let Some(report) = report else { break };
                    pipeline.metrics.ingestion_queue_depth.dec();
                    let train_id = report.train_id;
                    if let Err(e) = pipeline.report_position(report).await {
                        warn!("queued report for train {} rejected: {}", train_id, e);
                    }
                }
                debug!("ingestion worker {} stopped", worker);
            }));
        }
        info!("{} ingestion workers running", self.config.worker_count);
        handles
    }

    /// Queue a report for asynchronous processing. Applies backpressure for
    /// up to the configured wait, then sheds with OVERLOADED.
    pub async fn enqueue(&self, report: PositionReport) -> EngineResult<()> {
        let wait = Duration::from_millis(self.config.enqueue_wait_ms);
        match self.queue_tx.send_timeout(report, wait).await {
            Ok(()) => {
                self.metrics.ingestion_queue_depth.inc();
                Ok(())
            }
            Err(_) => Err(EngineError::Overloaded),
        }
    }

    /// Validate and apply a single report. On success the time series holds
    /// the report, the current-position index reflects it, and transition
    /// events have been emitted in exit-entry-update order.
    pub async fn report_position(&self, report: PositionReport) -> EngineResult<PositionAck> {
        match self.process(report).await {
            Ok(ack) => {
                self.metrics.positions_ingested_total.inc();
                Ok(ack)
            }
            Err(e) => {
                self.metrics.positions_rejected_total.inc();
                Err(e)
            }
        }
    }

    async fn process(&self, report: PositionReport) -> EngineResult<PositionAck> {
        report
            .validate(Utc::now(), self.config.max_clock_skew_secs)
            .map_err(EngineError::Validation)?;

        let train = self.store.require_train(report.train_id).await?;
        if !train.is_reportable() {
            return Err(EngineError::Validation(format!(
                "train {} is out of service",
                train.id
            )));
        }
        let section = self.store.require_section(report.section_id).await?;
        if !section.active {
            return Err(EngineError::Validation(format!(
                "section {} is not active",
                section.id
            )));
        }

        let previous_section = self
            .store
            .latest_position(report.train_id)
            .await
            .map(|p| p.section_id);

        let expected_exit = report.timestamp
            + chrono::Duration::milliseconds(
                (section.traversal_seconds(report.speed_kmh, self.floor_speed_kmh) * 1000.0) as i64,
            );

        // Serialize against other transitions touching either section, so
        // entry/exit events per section keep a total order.
        let _guards = self
            .locks
            .guard(report.section_id, previous_section)
            .await;

        let transition = with_transient_retry(|| async {
            self.store.apply_position(&report, Some(expected_exit)).await
        })
        .await?;

        if let Some(transition) = &transition {
            self.metrics.occupancy_transitions_total.inc();
            if let Some(closed) = &transition.closed {
                self.hub.publish(EngineEvent::new(EventData::SectionExit {
                    train_id: closed.train_id,
                    section_id: closed.section_id,
                    exit_time: closed.exit_time.unwrap_or(report.timestamp),
                }));
            }
            self.hub.publish(EngineEvent::new(EventData::SectionEntry {
                train_id: transition.opened.train_id,
                section_id: transition.opened.section_id,
                entry_time: transition.opened.entry_time,
                expected_exit_time: transition.opened.expected_exit_time,
            }));
        }
        self.hub.publish(EngineEvent::new(EventData::PositionUpdate {
            train_id: report.train_id,
            section_id: report.section_id,
            coordinates: report.coordinates,
            speed_kmh: report.speed_kmh,
            heading_deg: report.heading_deg,
            timestamp: report.timestamp,
        }));
        if let Some(transition) = &transition {
            let occupancy = self.store.trains_in_section(report.section_id).await;
            self.hub.publish(EngineEvent::new(EventData::SectionStatus {
                section_id: report.section_id,
                occupancy: occupancy.len() as u32,
                capacity: section.capacity,
                trains: occupancy,
            }));
            if let Some(closed) = &transition.closed {
                let remaining = self.store.trains_in_section(closed.section_id).await;
                let exited_capacity = self
                    .store
                    .get_section(closed.section_id)
                    .await?
                    .map(|s| s.capacity)
                    .unwrap_or_default();
                self.hub.publish(EngineEvent::new(EventData::SectionStatus {
                    section_id: closed.section_id,
                    occupancy: remaining.len() as u32,
                    capacity: exited_capacity,
                    trains: remaining,
                }));
            }
        }

        Ok(PositionAck {
            train_id: report.train_id,
            section_id: report.section_id,
            section_changed: transition.is_some(),
        })
    }

    /// Each report in the batch is judged on its own; partial success is the
    /// normal case.
    pub async fn report_bulk(&self, reports: Vec<PositionReport>) -> BulkReport {
        let mut accepted_count = 0;
        let mut rejections = Vec::new();
        for (index, report) in reports.into_iter().enumerate() {
            let train_id = report.train_id;
            match self.report_position(report).await {
                Ok(_) => accepted_count += 1,
                Err(e) => rejections.push(BulkRejection {
                    index,
                    train_id,
                    reason: e.to_string(),
                }),
            }
        }
        BulkReport {
            accepted_count,
            rejections,
        }
    }

    pub async fn current_position(&self, train_id: TrainId) -> Option<PositionReport> {
        self.store.latest_position(train_id).await
    }

    pub async fn trains_in_section(&self, section_id: SectionId) -> Vec<TrainId> {
        self.store.trains_in_section(section_id).await
    }

    pub async fn open_occupancies(&self) -> Vec<OccupancyRecord> {
        self.store.open_occupancies().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::{SectionKind, TrainKind};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<DomainStore>,
        pipeline: Arc<PositionPipeline>,
        hub: Arc<BroadcastHub>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default();
        let store = Arc::new(DomainStore::open(dir.path().join("db")).unwrap());
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let hub = BroadcastHub::new(config.hub.clone(), metrics.clone());
        let pipeline = PositionPipeline::new(
            store.clone(),
            hub.clone(),
            metrics,
            config.ingestion.clone(),
            config.prediction.travel_time_floor_speed_kmh,
        );
        Fixture {
            _dir: dir,
            store,
            pipeline,
            hub,
        }
    }

    async fn seed(store: &DomainStore) {
        for id in [7u32, 8] {
            let mut section = Section::new(id, format!("SEC-{id:03}"), SectionKind::Track);
            section.length_m = 3_000.0;
            store.upsert_section(&section).await.unwrap();
        }
        store
            .upsert_train(&Train::new(301, "T301", TrainKind::Local, 5))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accepted_report_updates_index_and_series() {
        let fx = fixture().await;
        seed(&fx.store).await;
        let now = Utc::now();
        let ack = fx
            .pipeline
            .report_position(PositionReport::new(301, 7, now, 60.0))
            .await
            .unwrap();
        assert!(ack.section_changed);
        assert_eq!(fx.pipeline.current_position(301).await.unwrap().timestamp, now);
        assert_eq!(fx.pipeline.trains_in_section(7).await, vec![301]);
        let open = fx.pipeline.open_occupancies().await;
        assert_eq!(open.len(), 1);
        assert!(open[0].expected_exit_time.unwrap() > now);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_report_rejected_and_index_unchanged() {
        let fx = fixture().await;
        seed(&fx.store).await;
        let t_latest = Utc::now();
        fx.pipeline
            .report_position(PositionReport::new(301, 7, t_latest, 60.0))
            .await
            .unwrap();

        let earlier = t_latest - chrono::Duration::seconds(30);
        let err = fx
            .pipeline
            .report_position(PositionReport::new(301, 8, earlier, 60.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Stale { .. }));
        // Current position still points at the newer report.
        let current = fx.pipeline.current_position(301).await.unwrap();
        assert_eq!(current.timestamp, t_latest);
        assert_eq!(current.section_id, 7);
        assert_eq!(fx.pipeline.trains_in_section(8).await.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_timestamp_is_idempotent() {
        let fx = fixture().await;
        seed(&fx.store).await;
        let now = Utc::now();
        let report = PositionReport::new(301, 7, now, 60.0);
        fx.pipeline.report_position(report.clone()).await.unwrap();
        let err = fx.pipeline.report_position(report).await.unwrap_err();
        assert!(matches!(err, EngineError::Stale { .. }));
        assert_eq!(fx.pipeline.open_occupancies().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_train_and_inactive_section_rejected() {
        let fx = fixture().await;
        seed(&fx.store).await;
        let err = fx
            .pipeline
            .report_position(PositionReport::new(999, 7, Utc::now(), 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let mut dead = Section::new(99, "SEC-099", SectionKind::Track);
        dead.active = false;
        fx.store.upsert_section(&dead).await.unwrap();
        let err = fx
            .pipeline
            .report_position(PositionReport::new(301, 99, Utc::now(), 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transition_emits_exit_entry_update_in_order() {
        let fx = fixture().await;
        seed(&fx.store).await;
        let subscriber = fx.hub.register([crate::hub::Subscription::Train(301)].into()).await;
        let t0 = Utc::now();
        fx.pipeline
            .report_position(PositionReport::new(301, 7, t0, 60.0))
            .await
            .unwrap();
        fx.pipeline
            .report_position(PositionReport::new(
                301,
                8,
                t0 + chrono::Duration::seconds(60),
                60.0,
            ))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        for _ in 0..6 {
            match tokio::time::timeout(Duration::from_millis(500), subscriber.next_event()).await {
                Ok(Some(event)) => kinds.push(event.kind_name().to_string()),
                _ => break,
            }
        }
        let exit = kinds.iter().position(|k| k == "SectionExit").unwrap();
        let entry = kinds.iter().rposition(|k| k == "SectionEntry").unwrap();
        let update = kinds.iter().rposition(|k| k == "PositionUpdate").unwrap();
        assert!(exit < entry, "exit after entry: {kinds:?}");
        assert!(entry < update, "entry after update: {kinds:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_reports_partial_success() {
        let fx = fixture().await;
        seed(&fx.store).await;
        let now = Utc::now();
        let reports = vec![
            PositionReport::new(301, 7, now, 60.0),
            PositionReport::new(999, 7, now, 60.0), // unknown train
            PositionReport::new(301, 7, now - chrono::Duration::seconds(5), 60.0), // stale
        ];
        let outcome = fx.pipeline.report_bulk(reports).await;
        assert_eq!(outcome.accepted_count, 1);
        assert_eq!(outcome.rejections.len(), 2);
        assert_eq!(outcome.rejections[0].index, 1);
        assert_eq!(outcome.rejections[1].index, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn occupancy_matches_latest_reports_after_shuffle() {
        let fx = fixture().await;
        seed(&fx.store).await;
        for id in 302..=305u32 {
            fx.store
                .upsert_train(&Train::new(id, format!("T{id}"), TrainKind::Local, 5))
                .await
                .unwrap();
        }
        let t0 = Utc::now();
        // Every train reports into 7, then half move on to 8.
        for (i, id) in [301u32, 302, 303, 304, 305].iter().enumerate() {
            fx.pipeline
                .report_position(PositionReport::new(
                    *id,
                    7,
                    t0 + chrono::Duration::milliseconds(i as i64),
                    40.0,
                ))
                .await
                .unwrap();
        }
        for (i, id) in [302u32, 304].iter().enumerate() {
            fx.pipeline
                .report_position(PositionReport::new(
                    *id,
                    8,
                    t0 + chrono::Duration::seconds(10 + i as i64),
                    40.0,
                ))
                .await
                .unwrap();
        }
        assert_eq!(fx.pipeline.trains_in_section(7).await, vec![301, 303, 305]);
        assert_eq!(fx.pipeline.trains_in_section(8).await, vec![302, 304]);
        // One open occupancy per train.
        assert_eq!(fx.pipeline.open_occupancies().await.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_reports_are_processed_by_workers() {
        let fx = fixture().await;
        seed(&fx.store).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _workers = fx.pipeline.spawn_workers(shutdown_rx).await;
        fx.pipeline
            .enqueue(PositionReport::new(301, 7, Utc::now(), 50.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.pipeline.trains_in_section(7).await, vec![301]);
    }
}
