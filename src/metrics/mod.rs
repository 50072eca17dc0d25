use anyhow::Result;
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Engine metrics collection.
#[derive(Clone)]
pub struct EngineMetrics {
    // Ingestion
    pub positions_ingested_total: IntCounter,
    pub positions_rejected_total: IntCounter,
    pub ingestion_queue_depth: IntGauge,
    pub occupancy_transitions_total: IntCounter,

    // Detection
    pub detection_runs_total: IntCounter,
    pub detection_skipped_ticks: IntCounter,
    pub detection_slow_runs: IntCounter,
    pub detect_duration: Histogram,
    pub conflicts_found_total: IntCounter,
    pub conflicts_dedup_total: IntCounter,
    pub conflict_alerts_total: IntCounter,
    pub conflicts_active: IntGauge,

    // Decisions
    pub decisions_total: IntCounter,
    pub decisions_executed_total: IntCounter,
    pub decision_failures_total: IntCounter,
    pub executor_retries_total: IntCounter,
    pub rate_limited_total: IntCounter,

    // AI strategies
    pub ai_timeouts_total: IntCounter,
    pub ai_fallbacks_total: IntCounter,

    // Broadcast hub
    pub ws_connections_active: IntGauge,
    pub events_published_total: IntCounter,
    pub events_delivered_total: IntCounter,
    pub backlog_drops_total: IntCounter,

    // System
    pub uptime_seconds: Gauge,

    pub registry: Registry,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let positions_ingested_total = IntCounter::with_opts(Opts::new(
            "positions_ingested_total",
            "Position reports accepted",
        ))?;
        let positions_rejected_total = IntCounter::with_opts(Opts::new(
            "positions_rejected_total",
            "Position reports rejected (stale, invalid or unknown)",
        ))?;
        let ingestion_queue_depth = IntGauge::with_opts(Opts::new(
            "ingestion_queue_depth",
            "Reports waiting in the bounded ingestion queue",
        ))?;
        let occupancy_transitions_total = IntCounter::with_opts(Opts::new(
            "occupancy_transitions_total",
            "Section entry/exit transitions applied",
        ))?;

        let detection_runs_total = IntCounter::with_opts(Opts::new(
            "detection_runs_total",
            "Completed conflict detection runs",
        ))?;
        let detection_skipped_ticks = IntCounter::with_opts(Opts::new(
            "detection_skipped_ticks",
            "Scheduler ticks skipped because a run was in progress",
        ))?;
        let detection_slow_runs = IntCounter::with_opts(Opts::new(
            "detection_slow_runs",
            "Detection runs cancelled on timeout",
        ))?;
        let detect_duration = Histogram::with_opts(HistogramOpts::new(
            "detect_duration_seconds",
            "Duration of a detection run",
        ))?;
        let conflicts_found_total = IntCounter::with_opts(Opts::new(
            "conflicts_found_total",
            "New conflicts persisted by the detector",
        ))?;
        let conflicts_dedup_total = IntCounter::with_opts(Opts::new(
            "conflicts_dedup_total",
            "Detections merged into an existing open conflict",
        ))?;
        let conflict_alerts_total = IntCounter::with_opts(Opts::new(
            "conflict_alerts_total",
            "ConflictAlert events broadcast",
        ))?;
        let conflicts_active = IntGauge::with_opts(Opts::new(
            "conflicts_active",
            "Currently unresolved conflicts",
        ))?;

        let decisions_total = IntCounter::with_opts(Opts::new(
            "decisions_total",
            "Decisions accepted and persisted",
        ))?;
        let decisions_executed_total = IntCounter::with_opts(Opts::new(
            "decisions_executed_total",
            "Decisions successfully executed",
        ))?;
        let decision_failures_total = IntCounter::with_opts(Opts::new(
            "decision_failures_total",
            "Deferred executions that failed",
        ))?;
        let executor_retries_total = IntCounter::with_opts(Opts::new(
            "executor_retries_total",
            "Deferred execution retries scheduled by the reaper",
        ))?;
        let rate_limited_total = IntCounter::with_opts(Opts::new(
            "rate_limited_total",
            "Requests rejected by the rate limiter",
        ))?;

        let ai_timeouts_total = IntCounter::with_opts(Opts::new(
            "ai_timeouts_total",
            "Recommender calls that exceeded their deadline",
        ))?;
        let ai_fallbacks_total = IntCounter::with_opts(Opts::new(
            "ai_fallbacks_total",
            "Recommendations served by the rule-based fallback",
        ))?;

        let ws_connections_active = IntGauge::with_opts(Opts::new(
            "ws_connections_active",
            "Active streaming client connections",
        ))?;
        let events_published_total = IntCounter::with_opts(Opts::new(
            "events_published_total",
            "Events published into the broadcast hub",
        ))?;
        let events_delivered_total = IntCounter::with_opts(Opts::new(
            "events_delivered_total",
            "Events delivered to client backlogs",
        ))?;
        let backlog_drops_total = IntCounter::with_opts(Opts::new(
            "backlog_drops_total",
            "Events dropped from slow client backlogs",
        ))?;

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "uptime_seconds",
            "Engine uptime in seconds",
        ))?;

        registry.register(Box::new(positions_ingested_total.clone()))?;
        registry.register(Box::new(positions_rejected_total.clone()))?;
        registry.register(Box::new(ingestion_queue_depth.clone()))?;
        registry.register(Box::new(occupancy_transitions_total.clone()))?;
        registry.register(Box::new(detection_runs_total.clone()))?;
        registry.register(Box::new(detection_skipped_ticks.clone()))?;
        registry.register(Box::new(detection_slow_runs.clone()))?;
        registry.register(Box::new(detect_duration.clone()))?;
        registry.register(Box::new(conflicts_found_total.clone()))?;
        registry.register(Box::new(conflicts_dedup_total.clone()))?;
        registry.register(Box::new(conflict_alerts_total.clone()))?;
        registry.register(Box::new(conflicts_active.clone()))?;
        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(decisions_executed_total.clone()))?;
        registry.register(Box::new(decision_failures_total.clone()))?;
        registry.register(Box::new(executor_retries_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(ai_timeouts_total.clone()))?;
        registry.register(Box::new(ai_fallbacks_total.clone()))?;
        registry.register(Box::new(ws_connections_active.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(events_delivered_total.clone()))?;
        registry.register(Box::new(backlog_drops_total.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            positions_ingested_total,
            positions_rejected_total,
            ingestion_queue_depth,
            occupancy_transitions_total,
            detection_runs_total,
            detection_skipped_ticks,
            detection_slow_runs,
            detect_duration,
            conflicts_found_total,
            conflicts_dedup_total,
            conflict_alerts_total,
            conflicts_active,
            decisions_total,
            decisions_executed_total,
            decision_failures_total,
            executor_retries_total,
            rate_limited_total,
            ai_timeouts_total,
            ai_fallbacks_total,
            ws_connections_active,
            events_published_total,
            events_delivered_total,
            backlog_drops_total,
            uptime_seconds,
            registry,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
