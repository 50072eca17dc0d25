use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{EngineError, EngineResult};
use crate::hub::BroadcastHub;
use crate::metrics::EngineMetrics;
use crate::models::*;
use crate::storage::{DomainStore, KvStore};

const ACTIVE_CONFLICTS_CACHE: &str = "conflicts:active";

/// Deferred execution of accepted decisions. A pool of workers drains the
/// queue; a reaper retries failures with exponential backoff until the retry
/// budget is spent.
pub struct DecisionExecutor {
    store: Arc<DomainStore>,
    kv: Arc<KvStore>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<EngineMetrics>,
    config: ExecutorConfig,
    queue_tx: mpsc::Sender<u64>,
    queue_rx: Mutex<Option<mpsc::Receiver<u64>>>,
}

impl DecisionExecutor {
    pub fn new(
        store: Arc<DomainStore>,
        kv: Arc<KvStore>,
        hub: Arc<BroadcastHub>,
        metrics: Arc<EngineMetrics>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(256);
        Arc::new(Self {
            store,
            kv,
            hub,
            metrics,
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        })
    }

    /// Start the worker pool and the retry reaper.
    pub async fn spawn(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let receiver = self
            .queue_rx
            .lock()
            .await
            .take()
            .expect("decision executors already started");
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(self.config.pool_size + 1);
        for worker in 0..self.config.pool_size {
            let executor = self.clone();
            let receiver = receiver.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                debug!("decision executor {} started", worker);
                loop {
                    let decision_id = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            id = rx.recv() => id,
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() { None } else { continue }
                            }
                        }
                    };
                    let Some(decision_id) = decision_id else { break };
                    executor.execute(decision_id).await;
                }
                debug!("decision executor {} stopped", worker);
            }));
        }
        handles.push(self.spawn_reaper(shutdown));
        info!("{} decision executors running", self.config.pool_size);
        handles
    }

    fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = executor.reap().await {
                            error!("decision reaper pass failed: {}", e);
                        }
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

    /// Queue a decision for execution.
    pub async fn submit(&self, decision_id: u64) -> EngineResult<()> {
        self.queue_tx
            .send(decision_id)
            .await
            .map_err(|_| EngineError::Overloaded)
    }

    /// Backoff before attempt `n + 1`: 1 s, 5 s, 25 s with the default base.
    fn backoff(&self, attempts: u32) -> chrono::Duration {
        let secs = self.config.backoff_base_secs * 5u64.pow(attempts.saturating_sub(1));
        chrono::Duration::seconds(secs as i64)
    }

    /// Re-queue failed decisions whose backoff has elapsed, and pick up
    /// approved decisions stranded by a restart.
    async fn reap(&self) -> EngineResult<()> {
        let filter = crate::storage::DecisionFilter {
            executed: Some(false),
            ..Default::default()
        };
        let (pending, _) = self.store.query_decisions(&filter, 0, usize::MAX).await?;
        let now = Utc::now();
        for decision in pending {
            if !decision.is_approved() {
                continue;
            }
            if decision.execution_attempts > self.config.max_retries {
                continue;
            }
            let due = match (decision.execution_attempts, decision.last_attempt_at) {
                (0, None) => decision.timestamp + chrono::Duration::seconds(2) <= now,
                (attempts, Some(last)) => last + self.backoff(attempts) <= now,
                (_, None) => true,
            };
            if due {
                self.metrics.executor_retries_total.inc();
                debug!(
                    "reaper re-queueing decision {} (attempt {})",
                    decision.id, decision.execution_attempts
                );
                let _ = self.submit(decision.id).await;
            }
        }
        Ok(())
    }

    /// Execute one decision: apply its state mutation, flip `executed`, and
    /// notify. Failures are recorded on the row for the reaper.
    pub async fn execute(&self, decision_id: u64) {
        let decision = match self.store.get_decision(decision_id).await {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                warn!("executor asked for unknown decision {}", decision_id);
                return;
            }
            Err(e) => {
                error!("failed to load decision {}: {}", decision_id, e);
                return;
            }
        };
        if decision.executed {
            return;
        }
        if !decision.is_approved() {
            debug!("decision {} still awaits approval", decision_id);
            return;
        }

        let mut decision = decision;
        decision.execution_attempts += 1;
        decision.last_attempt_at = Some(Utc::now());

        match self.apply(&decision).await {
            Ok(result) => {
                decision.executed = true;
                // Clock skew between submit and execute must not produce an
                // execution that appears to precede its decision.
                decision.execution_time = Some(Utc::now().max(decision.timestamp));
                decision.execution_result = Some(result.clone());
                if let Err(e) = self.store.update_decision(&decision).await {
                    error!("failed to persist executed decision {}: {}", decision.id, e);
                    return;
                }
                self.metrics.decisions_executed_total.inc();
                self.hub.publish(EngineEvent::new(EventData::DecisionExecuted {
                    decision_id: decision.id,
                    controller_id: decision.controller_id.clone(),
                    action: decision.action,
                    train_id: decision.train_id,
                    conflict_id: decision.conflict_id,
                    execution_time: decision.execution_time.unwrap_or_else(Utc::now),
                    execution_result: result,
                }));
            }
            Err(e) => {
                warn!("execution of decision {} failed: {}", decision.id, e);
                decision.execution_result = Some(format!("attempt {} failed: {}", decision.execution_attempts, e));
                self.metrics.decision_failures_total.inc();
                if let Err(persist_err) = self.store.update_decision(&decision).await {
                    error!(
                        "failed to record failure of decision {}: {}",
                        decision.id, persist_err
                    );
                }
            }
        }
    }

    async fn apply(&self, decision: &Decision) -> EngineResult<String> {
        let mut notes = Vec::new();

        if let Some(train_id) = decision.train_id {
            let note = self.apply_train_action(train_id, &decision.parameters).await?;
            notes.push(note);
        }

        if let Some(conflict_id) = decision.conflict_id {
            if decision.action == DecisionAction::ManualOverride && decision.train_id.is_none() {
                // A rejection: the decision is recorded, the conflict stays
                // open for the next round of suggestions.
                notes.push(format!("conflict {} left open", conflict_id));
            } else {
                let note = self.resolve_conflict_state(conflict_id, &decision.controller_id).await?;
                notes.push(note);
            }
        }

        if notes.is_empty() {
            notes.push("recorded".to_string());
        }
        Ok(notes.join("; "))
    }

    async fn apply_train_action(
        &self,
        train_id: TrainId,
        parameters: &DecisionParameters,
    ) -> EngineResult<String> {
        let mut train = self.store.require_train(train_id).await?;
        let note = match parameters {
            DecisionParameters::Delay { delay_minutes } => {
                train.delay_minutes += *delay_minutes as i32;
                format!("train {} held {} minutes", train_id, delay_minutes)
            }
            DecisionParameters::Reroute { new_route } => {
                train.route = new_route.clone();
                format!("train {} rerouted via {:?}", train_id, new_route)
            }
            DecisionParameters::PriorityChange { new_priority } => {
                train.priority = *new_priority;
                format!("train {} priority set to {}", train_id, new_priority)
            }
            DecisionParameters::EmergencyStop {} => {
                train.operational_status = TrainStatus::Emergency;
                train.current_speed_kmh = 0.0;
                format!("train {} emergency stopped", train_id)
            }
            DecisionParameters::SpeedLimit { max_speed_kmh } => {
                train.current_speed_kmh = train.current_speed_kmh.min(*max_speed_kmh);
                format!("train {} limited to {} km/h", train_id, max_speed_kmh)
            }
            DecisionParameters::Resume {} => {
                train.operational_status = TrainStatus::Active;
                format!("train {} resumed", train_id)
            }
            DecisionParameters::ManualOverride { note } => {
                format!(
                    "manual override on train {}{}",
                    train_id,
                    note.as_deref().map(|n| format!(": {n}")).unwrap_or_default()
                )
            }
        };
        train.updated_at = Utc::now();
        self.store.upsert_train(&train).await?;
        Ok(note)
    }

    async fn resolve_conflict_state(
        &self,
        conflict_id: u64,
        controller_id: &str,
    ) -> EngineResult<String> {
        let mut conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conflict {}", conflict_id)))?;
        if conflict.is_resolved() {
            return Ok(format!("conflict {} was already resolved", conflict_id));
        }
        conflict.resolution_time = Some(Utc::now().max(conflict.detection_time));
        conflict.resolved_by = Some(controller_id.to_string());
        self.store.update_conflict(&conflict).await?;
        self.kv.delete(ACTIVE_CONFLICTS_CACHE).await;
        self.metrics.conflicts_active.set(
            self.store.unresolved_conflicts().await?.len() as i64,
        );
        self.hub.publish(EngineEvent::new(EventData::ConflictResolved {
            conflict_id,
            trains_involved: conflict.trains_involved.clone(),
            sections_involved: conflict.sections_involved.clone(),
            resolved_by: controller_id.to_string(),
            resolution_time: conflict.resolution_time.unwrap_or_else(Utc::now),
        }));
        Ok(format!("conflict {} resolved", conflict_id))
    }
}
