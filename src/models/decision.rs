use super::*;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionAction {
    Delay,
    Reroute,
    PriorityChange,
    EmergencyStop,
    SpeedLimit,
    ManualOverride,
    Resume,
}

/// Per-action parameters. Each variant is statically typed; the tagged form
/// is what crosses the persistence boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionParameters {
    Delay { delay_minutes: u32 },
    Reroute { new_route: Vec<SectionId> },
    PriorityChange { new_priority: u8 },
    EmergencyStop {},
    SpeedLimit { max_speed_kmh: f32 },
    ManualOverride { note: Option<String> },
    Resume {},
}

impl DecisionParameters {
    pub fn action(&self) -> DecisionAction {
        match self {
            DecisionParameters::Delay { .. } => DecisionAction::Delay,
            DecisionParameters::Reroute { .. } => DecisionAction::Reroute,
            DecisionParameters::PriorityChange { .. } => DecisionAction::PriorityChange,
            DecisionParameters::EmergencyStop {} => DecisionAction::EmergencyStop,
            DecisionParameters::SpeedLimit { .. } => DecisionAction::SpeedLimit,
            DecisionParameters::ManualOverride { .. } => DecisionAction::ManualOverride,
            DecisionParameters::Resume {} => DecisionAction::Resume,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            DecisionParameters::Delay { delay_minutes } => {
                if *delay_minutes > 180 {
                    return Err(format!("delay_minutes {} outside 0..=180", delay_minutes));
                }
            }
            DecisionParameters::SpeedLimit { max_speed_kmh } => {
                if !(0.0..=300.0).contains(max_speed_kmh) {
                    return Err(format!("max_speed_kmh {} outside 0..=300", max_speed_kmh));
                }
            }
            DecisionParameters::PriorityChange { new_priority } => {
                if !(1..=10).contains(new_priority) {
                    return Err(format!("new_priority {} outside 1..=10", new_priority));
                }
            }
            DecisionParameters::Reroute { new_route } => {
                if new_route.is_empty() {
                    return Err("new_route must not be empty".into());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// AI attribution carried by decisions produced from a recommender solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDecisionInfo {
    pub solver_method: String,
    pub score: Option<f64>,
    pub confidence: Option<f32>,
}

/// A persistent, attributable record of a controller-initiated action.
/// Append-only; immutable once `executed` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: u64,
    pub controller_id: ControllerId,
    pub conflict_id: Option<u64>,
    pub train_id: Option<TrainId>,
    pub section_id: Option<SectionId>,
    pub action: DecisionAction,
    pub timestamp: DateTime<Utc>,
    pub rationale: String,
    pub parameters: DecisionParameters,
    pub executed: bool,
    pub execution_time: Option<DateTime<Utc>>,
    pub execution_result: Option<String>,
    pub execution_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub approval_required: bool,
    pub approved_by: Option<ControllerId>,
    pub approval_time: Option<DateTime<Utc>>,
    pub ai: Option<AiDecisionInfo>,
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        !self.approval_required || (self.approved_by.is_some() && self.approval_time.is_some())
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.rationale.trim().len() < 10 {
            return Err("rationale must be at least 10 characters".into());
        }
        if self.executed {
            match self.execution_time {
                Some(t) if t >= self.timestamp => {}
                _ => return Err("executed decision must carry execution_time >= timestamp".into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_parameters_range_checked() {
        assert!(DecisionParameters::Delay { delay_minutes: 180 }.validate().is_ok());
        assert!(DecisionParameters::Delay { delay_minutes: 181 }.validate().is_err());
    }

    #[test]
    fn reroute_requires_nonempty_route() {
        assert!(DecisionParameters::Reroute { new_route: vec![] }.validate().is_err());
        assert!(DecisionParameters::Reroute { new_route: vec![3, 4] }.validate().is_ok());
    }

    #[test]
    fn parameters_serialize_tagged_on_action() {
        let params = DecisionParameters::SpeedLimit { max_speed_kmh: 80.0 };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["action"], "speed_limit");
        assert_eq!(json["max_speed_kmh"], 80.0);
    }

    #[test]
    fn executed_decision_needs_ordered_execution_time() {
        let now = Utc::now();
        let mut decision = Decision {
            id: 1,
            controller_id: "CTR001".into(),
            conflict_id: None,
            train_id: Some(101),
            section_id: None,
            action: DecisionAction::Delay,
            timestamp: now,
            rationale: "hold for crossing traffic".into(),
            parameters: DecisionParameters::Delay { delay_minutes: 5 },
            executed: true,
            execution_time: Some(now - chrono::Duration::seconds(1)),
            execution_result: None,
            execution_attempts: 1,
            last_attempt_at: Some(now),
            approval_required: false,
            approved_by: None,
            approval_time: None,
            ai: None,
        };
        assert!(decision.check_invariants().is_err());
        decision.execution_time = Some(now + chrono::Duration::seconds(1));
        assert!(decision.check_invariants().is_ok());
    }
}
