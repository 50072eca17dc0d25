use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AiConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use crate::models::{Conflict, SuggestedAction};

/// A recommender's proposed resolution for one conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub solution_id: String,
    pub confidence: f32,
    pub actions: Vec<SuggestedAction>,
    pub estimated_cost: f64,
    pub estimated_resolution_time: Option<DateTime<Utc>>,
    pub solver_method: String,
}

/// Context handed to strategies alongside the conflict. Deliberately small:
/// strategies needing more state fetch it through their own handles.
#[derive(Debug, Clone, Default)]
pub struct RecommendationContext {
    pub active_conflicts: usize,
}

/// Pluggable recommender. Implementations may run anything from heuristics
/// to an external solver; the engine only sees this contract.
#[async_trait]
pub trait RecommendationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn recommend(
        &self,
        conflict: &Conflict,
        context: &RecommendationContext,
    ) -> EngineResult<Recommendation>;
}

/// Built-in fallback: adopt the detector's top-ranked suggestion. Always
/// available, never blocks.
pub struct RuleBasedStrategy;

#[async_trait]
impl RecommendationStrategy for RuleBasedStrategy {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    async fn recommend(
        &self,
        conflict: &Conflict,
        _context: &RecommendationContext,
    ) -> EngineResult<Recommendation> {
        let suggestion = conflict
            .suggestions
            .iter()
            .min_by(|a, b| a.estimated_cost.total_cmp(&b.estimated_cost))
            .ok_or_else(|| {
                EngineError::NotFound(format!("conflict {} carries no suggestions", conflict.id))
            })?;
        Ok(Recommendation {
            solution_id: suggestion.id.clone(),
            confidence: 0.6,
            actions: suggestion.actions.clone(),
            estimated_cost: suggestion.estimated_cost,
            estimated_resolution_time: conflict.expected_impact_time,
            solver_method: self.name().to_string(),
        })
    }
}

/// Chooses among registered strategies: configured preference first, else the
/// highest-confidence answer, else the rule-based fallback. Deadlines are
/// enforced here so a stuck solver can never stall the decision path.
pub struct StrategySelector {
    strategies: Vec<Arc<dyn RecommendationStrategy>>,
    fallback: RuleBasedStrategy,
    config: AiConfig,
    metrics: Arc<EngineMetrics>,
}

impl StrategySelector {
    pub fn new(config: AiConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            strategies: Vec::new(),
            fallback: RuleBasedStrategy,
            config,
            metrics,
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn RecommendationStrategy>) {
        self.strategies.push(strategy);
    }

    /// Inline path, used while a controller request waits. Hard 2 s budget.
    pub async fn recommend_inline(
        &self,
        conflict: &Conflict,
        context: &RecommendationContext,
    ) -> EngineResult<Recommendation> {
        self.recommend_with_deadline(
            conflict,
            context,
            Duration::from_millis(self.config.inline_timeout_ms),
        )
        .await
    }

    /// Background path for the detection scheduler.
    pub async fn recommend_background(
        &self,
        conflict: &Conflict,
        context: &RecommendationContext,
    ) -> EngineResult<Recommendation> {
        self.recommend_with_deadline(
            conflict,
            context,
            Duration::from_millis(self.config.background_timeout_ms),
        )
        .await
    }

    async fn recommend_with_deadline(
        &self,
        conflict: &Conflict,
        context: &RecommendationContext,
        deadline: Duration,
    ) -> EngineResult<Recommendation> {
        if !self.config.enabled || self.strategies.is_empty() {
            self.metrics.ai_fallbacks_total.inc();
            return self.fallback.recommend(conflict, context).await;
        }

        if let Some(preferred) = &self.config.default_strategy {
            if let Some(strategy) = self.strategies.iter().find(|s| s.name() == preferred) {
                match tokio::time::timeout(deadline, strategy.recommend(conflict, context)).await {
                    Ok(Ok(recommendation)) => return Ok(recommendation),
                    Ok(Err(e)) => warn!("strategy {} failed: {}", strategy.name(), e),
                    Err(_) => {
                        self.metrics.ai_timeouts_total.inc();
                        warn!("strategy {} timed out after {:?}", strategy.name(), deadline);
                    }
                }
                self.metrics.ai_fallbacks_total.inc();
                return self.fallback.recommend(conflict, context).await;
            }
        }

        // No usable preference: ask everyone and keep the most confident.
        let mut best: Option<Recommendation> = None;
        for strategy in &self.strategies {
            match tokio::time::timeout(deadline, strategy.recommend(conflict, context)).await {
                Ok(Ok(candidate)) => {
                    debug!(
                        "strategy {} answered with confidence {:.2}",
                        strategy.name(),
                        candidate.confidence
                    );
                    let better = best
                        .as_ref()
                        .map(|b| candidate.confidence > b.confidence)
                        .unwrap_or(true);
                    if better {
                        best = Some(candidate);
                    }
                }
                Ok(Err(e)) => warn!("strategy {} failed: {}", strategy.name(), e),
                Err(_) => {
                    self.metrics.ai_timeouts_total.inc();
                    warn!("strategy {} timed out after {:?}", strategy.name(), deadline);
                }
            }
        }
        match best {
            Some(recommendation) => Ok(recommendation),
            None => {
                self.metrics.ai_fallbacks_total.inc();
                self.fallback.recommend(conflict, context).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictKind, ConflictSeverity, DecisionParameters, ResolutionSuggestion};

    fn conflict_with_suggestions() -> Conflict {
        Conflict {
            id: 1,
            kind: ConflictKind::CollisionRisk,
            severity: ConflictSeverity::High,
            severity_score: 7,
            trains_involved: vec![101, 102],
            sections_involved: vec![7],
            detection_time: Utc::now(),
            expected_impact_time: Some(Utc::now() + chrono::Duration::seconds(120)),
            description: "test".into(),
            suggestions: vec![
                ResolutionSuggestion {
                    id: "collision:delay:102".into(),
                    actions: vec![SuggestedAction {
                        train_id: 102,
                        parameters: DecisionParameters::Delay { delay_minutes: 5 },
                    }],
                    estimated_cost: 5.0,
                },
                ResolutionSuggestion {
                    id: "collision:reroute:102".into(),
                    actions: vec![SuggestedAction {
                        train_id: 102,
                        parameters: DecisionParameters::Reroute { new_route: vec![8] },
                    }],
                    estimated_cost: 20.0,
                },
            ],
            resolution_time: None,
            resolved_by: None,
            auto_resolved: false,
            ai: None,
        }
    }

    struct SlowStrategy;

    #[async_trait]
    impl RecommendationStrategy for SlowStrategy {
        fn name(&self) -> &'static str {
            "slow"
        }
        async fn recommend(
            &self,
            _conflict: &Conflict,
            _context: &RecommendationContext,
        ) -> EngineResult<Recommendation> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("the deadline fires first")
        }
    }

    struct ConfidentStrategy(f32);

    #[async_trait]
    impl RecommendationStrategy for ConfidentStrategy {
        fn name(&self) -> &'static str {
            "confident"
        }
        async fn recommend(
            &self,
            conflict: &Conflict,
            _context: &RecommendationContext,
        ) -> EngineResult<Recommendation> {
            Ok(Recommendation {
                solution_id: format!("ml:{}", conflict.id),
                confidence: self.0,
                actions: Vec::new(),
                estimated_cost: 1.0,
                estimated_resolution_time: None,
                solver_method: "confident".into(),
            })
        }
    }

    fn selector(enabled: bool) -> StrategySelector {
        let config = AiConfig {
            enabled,
            default_strategy: None,
            inline_timeout_ms: 50,
            background_timeout_ms: 100,
        };
        StrategySelector::new(config, Arc::new(EngineMetrics::new().unwrap()))
    }

    #[tokio::test]
    async fn disabled_ai_uses_rule_based_cheapest_suggestion() {
        let selector = selector(false);
        let conflict = conflict_with_suggestions();
        let rec = selector
            .recommend_inline(&conflict, &RecommendationContext::default())
            .await
            .unwrap();
        assert_eq!(rec.solver_method, "rule_based");
        assert_eq!(rec.solution_id, "collision:delay:102");
    }

    #[tokio::test]
    async fn timeout_falls_back_to_rule_based() {
        let mut selector = selector(true);
        selector.register(Arc::new(SlowStrategy));
        let conflict = conflict_with_suggestions();
        let started = std::time::Instant::now();
        let rec = selector
            .recommend_inline(&conflict, &RecommendationContext::default())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(rec.solver_method, "rule_based");
    }

    #[tokio::test]
    async fn highest_confidence_strategy_wins() {
        let mut selector = selector(true);
        selector.register(Arc::new(ConfidentStrategy(0.4)));
        selector.register(Arc::new(ConfidentStrategy(0.9)));
        let conflict = conflict_with_suggestions();
        let rec = selector
            .recommend_inline(&conflict, &RecommendationContext::default())
            .await
            .unwrap();
        assert_eq!(rec.confidence, 0.9);
    }
}
