use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ai::{RecommendationContext, StrategySelector};
use crate::error::{EngineError, EngineResult, Precondition};
use crate::hub::BroadcastHub;
use crate::metrics::EngineMetrics;
use crate::models::*;
use crate::ratelimit::{EndpointKind, RateLimiter};
use crate::storage::{DecisionFilter, DomainStore, KvStore};

pub mod executor;

pub use executor::DecisionExecutor;

const ACTIVE_CONFLICTS_CACHE: &str = "conflicts:active";
const DECISION_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveAction {
    Accept,
    Modify,
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub conflict_id: u64,
    pub action: ResolveAction,
    pub rationale: String,
    pub modifications: Option<DecisionParameters>,
    pub target_train_id: Option<TrainId>,
    pub ai_solution_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub train_id: TrainId,
    pub parameters: DecisionParameters,
    pub reason: String,
    #[serde(default)]
    pub emergency: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogDecisionRequest {
    pub conflict_id: Option<u64>,
    pub train_id: Option<TrainId>,
    pub section_id: Option<SectionId>,
    pub parameters: DecisionParameters,
    pub rationale: String,
}

#[derive(Debug, Serialize)]
pub struct DecisionAck {
    pub decision_id: u64,
    pub action: DecisionAction,
    pub approval_required: bool,
    pub approval_pending: bool,
    pub executed: bool,
}

#[derive(Debug, Serialize)]
pub struct AuditPage {
    pub decisions: Vec<Decision>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Controller command surface: authorizes, rate-limits, persists decisions
/// and hands the state mutation to the deferred executor pool.
pub struct DecisionEngine {
    store: Arc<DomainStore>,
    kv: Arc<KvStore>,
    hub: Arc<BroadcastHub>,
    limiter: Arc<RateLimiter>,
    executor: Arc<DecisionExecutor>,
    selector: Arc<StrategySelector>,
    metrics: Arc<EngineMetrics>,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<DomainStore>,
        kv: Arc<KvStore>,
        hub: Arc<BroadcastHub>,
        limiter: Arc<RateLimiter>,
        executor: Arc<DecisionExecutor>,
        selector: Arc<StrategySelector>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            kv,
            hub,
            limiter,
            executor,
            selector,
            metrics,
        }
    }

    async fn check_rate(&self, controller: &Controller, kind: EndpointKind) -> EngineResult<()> {
        match self.limiter.check(&controller.id, kind).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.metrics.rate_limited_total.inc();
                Err(e)
            }
        }
    }

    /// Resolve a conflict with one of the proposed suggestions, a modified
    /// action, or an explicit rejection.
    pub async fn resolve_conflict(
        &self,
        controller: &Controller,
        request: ResolveRequest,
    ) -> EngineResult<DecisionAck> {
        if !controller.at_least(AuthLevel::Supervisor) {
            return Err(EngineError::Forbidden(
                "resolving conflicts requires SUPERVISOR".into(),
            ));
        }
        self.check_rate(controller, EndpointKind::Critical).await?;

        let conflict = self
            .store
            .get_conflict(request.conflict_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conflict {}", request.conflict_id)))?;
        if conflict.is_resolved() {
            return Err(EngineError::Precondition(Precondition::AlreadyResolved));
        }
        if let Some(solution_id) = &request.ai_solution_id {
            let known = conflict.suggestions.iter().any(|s| &s.id == solution_id)
                || conflict
                    .ai
                    .as_ref()
                    .and_then(|a| a.solution_id.as_ref())
                    .is_some_and(|id| id == solution_id);
            if !known {
                return Err(EngineError::Precondition(Precondition::AiSolutionMismatch));
            }
        }

        let (parameters, train_id) = match request.action {
            ResolveAction::Accept => {
                let suggestion = match &request.ai_solution_id {
                    Some(id) => conflict.suggestions.iter().find(|s| &s.id == id),
                    None => conflict.suggestions.first(),
                };
                match suggestion.and_then(|s| s.actions.first()) {
                    Some(action) => (action.parameters.clone(), Some(action.train_id)),
                    None => (
                        DecisionParameters::ManualOverride {
                            note: Some("accepted without an action plan".into()),
                        },
                        None,
                    ),
                }
            }
            ResolveAction::Modify => {
                let parameters = request.modifications.clone().ok_or_else(|| {
                    EngineError::Validation("MODIFY requires modified parameters".into())
                })?;
                parameters.validate().map_err(EngineError::Validation)?;
                (parameters, request.target_train_id)
            }
            ResolveAction::Reject => (
                DecisionParameters::ManualOverride {
                    note: Some("suggestions rejected".into()),
                },
                None,
            ),
        };

        let decision = self
            .commit_decision(
                controller,
                parameters,
                request.rationale,
                Some(conflict.id),
                train_id,
                conflict.sections_involved.first().copied(),
            )
            .await?;
        self.kv.delete(ACTIVE_CONFLICTS_CACHE).await;
        self.ack(decision)
    }

    /// Direct command against one train.
    pub async fn control_train(
        &self,
        controller: &Controller,
        request: ControlRequest,
    ) -> EngineResult<DecisionAck> {
        if !controller.at_least(AuthLevel::Supervisor) {
            return Err(EngineError::Forbidden(
                "controlling trains requires SUPERVISOR".into(),
            ));
        }
        if request.emergency && !controller.at_least(AuthLevel::Manager) {
            return Err(EngineError::Forbidden(
                "emergency commands require MANAGER".into(),
            ));
        }
        self.check_rate(controller, EndpointKind::Critical).await?;

        let train = self.store.require_train(request.train_id).await?;
        request.parameters.validate().map_err(EngineError::Validation)?;
        if let DecisionParameters::Reroute { new_route } = &request.parameters {
            for section_id in new_route {
                if self.store.get_section(*section_id).await?.is_none() {
                    return Err(EngineError::Validation(format!(
                        "reroute references unknown section {}",
                        section_id
                    )));
                }
            }
        }
        if let Some(section_id) = train.current_section {
            if !controller.responsible_for(section_id) {
                return Err(EngineError::Forbidden(format!(
                    "train {} is in section {} outside your responsibility",
                    train.id, section_id
                )));
            }
        }

        let decision = self
            .commit_decision(
                controller,
                request.parameters,
                request.reason,
                None,
                Some(train.id),
                train.current_section,
            )
            .await?;
        self.ack(decision)
    }

    /// Approve a pending decision (MANAGER+), releasing it for execution.
    pub async fn approve(
        &self,
        controller: &Controller,
        decision_id: u64,
    ) -> EngineResult<DecisionAck> {
        if !controller.at_least(AuthLevel::Manager) {
            return Err(EngineError::Forbidden("approval requires MANAGER".into()));
        }
        self.check_rate(controller, EndpointKind::Critical).await?;

        let mut decision = self
            .store
            .get_decision(decision_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("decision {}", decision_id)))?;
        if decision.executed {
            return Err(EngineError::Precondition(Precondition::AlreadyExecuted));
        }
        if !decision.approval_required || decision.is_approved() {
            return Err(EngineError::Validation(
                "decision is not awaiting approval".into(),
            ));
        }
        decision.approved_by = Some(controller.id.clone());
        decision.approval_time = Some(Utc::now());
        self.store.update_decision(&decision).await?;
        info!("decision {} approved by {}", decision.id, controller.id);
        self.executor.submit(decision.id).await?;
        self.ack(decision)
    }

    /// Unresolved conflicts, most urgent first. Served from the short-TTL
    /// cache when fresh.
    pub async fn get_active_conflicts(&self) -> EngineResult<Vec<Conflict>> {
        if let Some(cached) = self.kv.get(ACTIVE_CONFLICTS_CACHE).await {
            if let Ok(conflicts) = serde_json::from_str::<Vec<Conflict>>(&cached) {
                return Ok(conflicts);
            }
        }
        let now = Utc::now();
        let mut conflicts = self.store.unresolved_conflicts().await?;
        conflicts.sort_by(|a, b| {
            b.priority_score(now)
                .total_cmp(&a.priority_score(now))
                .then(a.id.cmp(&b.id))
        });
        if let Ok(serialized) = serde_json::to_string(&conflicts) {
            self.kv
                .set_with_ttl(ACTIVE_CONFLICTS_CACHE, serialized, Duration::from_secs(30))
                .await;
        }
        Ok(conflicts)
    }

    /// Ask the configured recommenders for a solution to one conflict and
    /// annotate it, without deciding anything.
    pub async fn recommend(&self, conflict_id: u64) -> EngineResult<crate::ai::Recommendation> {
        let mut conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conflict {}", conflict_id)))?;
        let context = RecommendationContext {
            active_conflicts: self.store.unresolved_conflicts().await?.len(),
        };
        let recommendation = self.selector.recommend_inline(&conflict, &context).await?;
        conflict.ai = Some(AiAnnotation {
            analyzed: true,
            confidence: Some(recommendation.confidence),
            solution_id: Some(recommendation.solution_id.clone()),
        });
        self.store.update_conflict(&conflict).await?;
        Ok(recommendation)
    }

    /// Record a decision in the audit trail without dispatching execution;
    /// approval-gated actions still go through the approval workflow.
    pub async fn log_decision(
        &self,
        controller: &Controller,
        request: LogDecisionRequest,
    ) -> EngineResult<DecisionAck> {
        self.check_rate(controller, EndpointKind::Standard).await?;
        request.parameters.validate().map_err(EngineError::Validation)?;

        let action = request.parameters.action();
        let approval_required = action == DecisionAction::Reroute;
        let auto_approved = approval_required && controller.at_least(AuthLevel::Supervisor);
        let now = Utc::now();
        let decision = Decision {
            id: 0,
            controller_id: controller.id.clone(),
            conflict_id: request.conflict_id,
            train_id: request.train_id,
            section_id: request.section_id,
            action,
            timestamp: now,
            rationale: request.rationale,
            parameters: request.parameters,
            executed: false,
            execution_time: None,
            execution_result: Some("logged".into()),
            execution_attempts: 0,
            last_attempt_at: Some(now),
            approval_required,
            approved_by: auto_approved.then(|| controller.id.clone()),
            approval_time: auto_approved.then(Utc::now),
            ai: None,
        };
        let decision = self.store.insert_decision(decision).await?;
        self.metrics.decisions_total.inc();
        self.cache_decision(&decision).await;
        self.hub.publish(EngineEvent::new(EventData::DecisionLogged {
            decision: decision.clone(),
        }));
        self.ack(decision)
    }

    /// Paged audit query over the decision trail.
    pub async fn query_audit(
        &self,
        filter: DecisionFilter,
        offset: usize,
        limit: usize,
    ) -> EngineResult<AuditPage> {
        let limit = limit.clamp(1, 500);
        let (decisions, total) = self.store.query_decisions(&filter, offset, limit).await?;
        Ok(AuditPage {
            decisions,
            total,
            offset,
            limit,
        })
    }

    /// One transaction: re-validated insert with `executed = false`, KV
    /// cache entry, notification, then deferred dispatch.
    async fn commit_decision(
        &self,
        controller: &Controller,
        parameters: DecisionParameters,
        rationale: String,
        conflict_id: Option<u64>,
        train_id: Option<TrainId>,
        section_id: Option<SectionId>,
    ) -> EngineResult<Decision> {
        let action = parameters.action();
        let approval_required = action == DecisionAction::Reroute;
        let auto_approved = approval_required && controller.at_least(AuthLevel::Supervisor);
        let decision = Decision {
            id: 0,
            controller_id: controller.id.clone(),
            conflict_id,
            train_id,
            section_id,
            action,
            timestamp: Utc::now(),
            rationale,
            parameters,
            executed: false,
            execution_time: None,
            execution_result: None,
            execution_attempts: 0,
            last_attempt_at: None,
            approval_required,
            approved_by: auto_approved.then(|| controller.id.clone()),
            approval_time: auto_approved.then(Utc::now),
            ai: None,
        };
        let decision = self.store.insert_decision(decision).await?;
        self.metrics.decisions_total.inc();
        self.cache_decision(&decision).await;
        self.hub.publish(EngineEvent::new(EventData::DecisionLogged {
            decision: decision.clone(),
        }));

        if decision.is_approved() {
            self.executor.submit(decision.id).await?;
        } else {
            warn!(
                "decision {} by {} awaits approval before execution",
                decision.id, decision.controller_id
            );
        }
        Ok(decision)
    }

    async fn cache_decision(&self, decision: &Decision) {
        if let Ok(serialized) = serde_json::to_string(decision) {
            self.kv
                .set_with_ttl(
                    &format!("decision:{}", decision.id),
                    serialized,
                    DECISION_CACHE_TTL,
                )
                .await;
        }
    }

    fn ack(&self, decision: Decision) -> EngineResult<DecisionAck> {
        Ok(DecisionAck {
            decision_id: decision.id,
            action: decision.action,
            approval_required: decision.approval_required,
            approval_pending: decision.approval_required && !decision.is_approved(),
            executed: decision.executed,
        })
    }
}
