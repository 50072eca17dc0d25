use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub mod ai;
pub mod api;
pub mod auth;
pub mod config;
pub mod decision;
pub mod detection;
pub mod error;
pub mod hub;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod prediction;
pub mod ratelimit;
pub mod storage;
pub mod synthetic;
pub mod websocket;

use crate::ai::StrategySelector;
use crate::auth::AuthService;
use crate::config::EngineConfig;
use crate::decision::{DecisionEngine, DecisionExecutor};
use crate::detection::{ConflictDetector, DetectionScheduler};
use crate::hub::BroadcastHub;
use crate::ingestion::PositionPipeline;
use crate::metrics::EngineMetrics;
use crate::ratelimit::RateLimiter;
use crate::storage::{DomainStore, KvStore};

/// Shared handles injected into the transport layer.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub store: Arc<DomainStore>,
    pub kv: Arc<KvStore>,
    pub metrics: Arc<EngineMetrics>,
    pub hub: Arc<BroadcastHub>,
    pub pipeline: Arc<PositionPipeline>,
    pub scheduler: Arc<DetectionScheduler>,
    pub decision_engine: Arc<DecisionEngine>,
    pub auth_service: Arc<AuthService>,
}

/// The engine value owns every long-lived resource and the background task
/// set. Components receive their collaborators through constructors; nothing
/// is process-global.
pub struct Engine {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    pub async fn start(config: EngineConfig) -> anyhow::Result<Engine> {
        let config = Arc::new(config);
        let metrics = Arc::new(EngineMetrics::new()?);
        let store = Arc::new(DomainStore::open(&config.store.path)?);
        let kv = Arc::new(KvStore::new());
        let hub = BroadcastHub::new(config.hub.clone(), metrics.clone());
        let limiter = Arc::new(RateLimiter::new(kv.clone(), config.rate_limits.clone()));

        let pipeline = PositionPipeline::new(
            store.clone(),
            hub.clone(),
            metrics.clone(),
            config.ingestion.clone(),
            config.prediction.travel_time_floor_speed_kmh,
        );
        let detector = Arc::new(ConflictDetector::new(
            config.detection.clone(),
            config.prediction.clone(),
            config.severity_weights.clone(),
        ));
        let scheduler = DetectionScheduler::new(
            store.clone(),
            kv.clone(),
            hub.clone(),
            detector,
            limiter.clone(),
            metrics.clone(),
            config.detection.clone(),
        );
        let executor = DecisionExecutor::new(
            store.clone(),
            kv.clone(),
            hub.clone(),
            metrics.clone(),
            config.executor.clone(),
        );
        let selector = Arc::new(StrategySelector::new(config.ai.clone(), metrics.clone()));
        let decision_engine = Arc::new(DecisionEngine::new(
            store.clone(),
            kv.clone(),
            hub.clone(),
            limiter,
            executor.clone(),
            selector,
            metrics.clone(),
        ));
        let auth_service = Arc::new(AuthService::new(
            &config.security.jwt_secret,
            config.security.jwt_expiry_hours,
        ));

        let state = AppState {
            config: config.clone(),
            store: store.clone(),
            kv: kv.clone(),
            metrics: metrics.clone(),
            hub,
            pipeline: pipeline.clone(),
            scheduler: scheduler.clone(),
            decision_engine,
            auth_service,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        handles.extend(pipeline.spawn_workers(shutdown_rx.clone()).await);
        handles.extend(executor.spawn(shutdown_rx.clone()).await);
        handles.push(scheduler.spawn(shutdown_rx.clone()));
        handles.push(spawn_housekeeping(
            store,
            kv,
            metrics,
            config.store.position_retention_days,
            shutdown_rx,
        ));

        Ok(Engine {
            state,
            shutdown_tx,
            handles,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Signal every background task and wait for them to drain.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

/// Retention pruning, KV expiry sweeps and the uptime gauge.
fn spawn_housekeeping(
    store: Arc<DomainStore>,
    kv: Arc<KvStore>,
    metrics: Arc<EngineMetrics>,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let mut prune_tick = tokio::time::interval(Duration::from_secs(3600));
        let mut gauge_tick = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = prune_tick.tick() => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
                    match store.prune_positions(cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => info!("pruned {} expired position rows", removed),
                        Err(e) => error!("position pruning failed: {}", e),
                    }
                    kv.purge_expired().await;
                }
                _ = gauge_tick.tick() => {
                    metrics.uptime_seconds.set(started.elapsed().as_secs_f64());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// The HTTP/WS binding over the engine operations.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        // Authentication
        .route("/api/v1/auth/login", post(auth::login))
        // Position ingestion
        .route("/api/v1/positions", post(api::positions::report_position))
        .route("/api/v1/positions/bulk", post(api::positions::report_bulk))
        .route("/api/v1/positions/queue", post(api::positions::enqueue_position))
        .route("/api/v1/occupancies", get(api::positions::open_occupancies))
        // Trains
        .route(
            "/api/v1/trains",
            get(api::trains::list_trains).post(api::trains::create_train),
        )
        .route(
            "/api/v1/trains/:train_id",
            get(api::trains::get_train)
                .put(api::trains::update_train)
                .delete(api::trains::delete_train),
        )
        .route("/api/v1/trains/:train_id/position", get(api::positions::current_position))
        .route("/api/v1/trains/:train_id/positions", get(api::positions::position_history))
        .route("/api/v1/trains/control", post(api::trains::control_train))
        // Sections
        .route(
            "/api/v1/sections",
            get(api::sections::list_sections).post(api::sections::create_section),
        )
        .route("/api/v1/sections/:section_id/state", get(api::sections::get_section_state))
        .route("/api/v1/sections/:section_id/trains", get(api::positions::trains_in_section))
        // Controllers
        .route("/api/v1/controllers", post(api::sections::register_controller))
        // Conflicts
        .route("/api/v1/conflicts/active", get(api::conflicts::get_active_conflicts))
        .route("/api/v1/conflicts/detect", post(api::conflicts::run_detection))
        .route("/api/v1/conflicts/resolve", post(api::conflicts::resolve_conflict))
        .route("/api/v1/conflicts/:conflict_id", get(api::conflicts::get_conflict))
        .route("/api/v1/conflicts/:conflict_id/recommend", post(api::conflicts::recommend))
        // Decisions and audit
        .route(
            "/api/v1/decisions",
            get(api::audit::query_audit).post(api::audit::log_decision),
        )
        .route("/api/v1/decisions/:decision_id/approve", put(api::audit::approve_decision))
        .route("/api/v1/metrics/performance", get(api::audit::performance_metrics))
        // Streaming
        .route("/ws", get(websocket::websocket_handler))
        // Prometheus
        .route("/metrics", get(api::audit::prometheus_metrics));

    if state.config.server.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    router.with_state(state)
}

async fn health_check() -> axum::response::Json<serde_json::Value> {
    axum::response::Json(serde_json::json!({
        "status": "healthy",
        "service": "railway-conflict-engine",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
