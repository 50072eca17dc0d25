use super::*;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictKind {
    CollisionRisk,
    SectionOverload,
    PriorityConflict,
    JunctionConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=3 => ConflictSeverity::Low,
            4..=6 => ConflictSeverity::Medium,
            7..=8 => ConflictSeverity::High,
            _ => ConflictSeverity::Critical,
        }
    }
}

/// One proposed way out of a conflict: an ordered action plan plus a cost
/// estimate used to rank alternatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSuggestion {
    pub id: String,
    pub actions: Vec<SuggestedAction>,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub train_id: TrainId,
    pub parameters: DecisionParameters,
}

/// Optional recommender attribution composed onto a conflict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiAnnotation {
    pub analyzed: bool,
    pub confidence: Option<f32>,
    pub solution_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: u64,
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub severity_score: u8,
    pub trains_involved: Vec<TrainId>,
    pub sections_involved: Vec<SectionId>,
    pub detection_time: DateTime<Utc>,
    pub expected_impact_time: Option<DateTime<Utc>>,
    pub description: String,
    pub suggestions: Vec<ResolutionSuggestion>,
    pub resolution_time: Option<DateTime<Utc>>,
    pub resolved_by: Option<ControllerId>,
    pub auto_resolved: bool,
    pub ai: Option<AiAnnotation>,
}

/// The logical identity of a conflict: kind plus the sorted train and section
/// sets. Two detections sharing a key describe the same condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictKey {
    pub kind: ConflictKind,
    pub trains: Vec<TrainId>,
    pub sections: Vec<SectionId>,
}

impl Conflict {
    pub fn key(&self) -> ConflictKey {
        ConflictKey {
            kind: self.kind,
            trains: self.trains_involved.clone(),
            sections: self.sections_involved.clone(),
        }
    }

    /// Full identity tuple including the detection time rounded to 10 s.
    pub fn identity(&self) -> (ConflictKey, i64) {
        (self.key(), round_to_bucket(self.detection_time))
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution_time.is_some()
    }

    pub fn time_to_impact(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expected_impact_time.map(|t| (t - now).max(Duration::zero()))
    }

    /// Ranking used by the active-conflict listing: severity plus an urgency
    /// term that grows as impact approaches.
    pub fn priority_score(&self, now: DateTime<Utc>) -> f64 {
        let minutes = self
            .time_to_impact(now)
            .map(|d| d.num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        self.severity_score as f64 + 100.0 / (minutes + 1.0)
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.trains_involved.is_empty() {
            return Err("conflict must involve at least one train".into());
        }
        if self.sections_involved.is_empty() {
            return Err("conflict must involve at least one section".into());
        }
        match (self.resolution_time, &self.resolved_by) {
            (Some(t), Some(_)) if t < self.detection_time => {
                return Err("resolution_time precedes detection_time".into())
            }
            (Some(_), None) if !self.auto_resolved => {
                return Err("resolved conflict must name a resolving controller".into())
            }
            (None, Some(_)) => return Err("resolved_by set without resolution_time".into()),
            _ => {}
        }
        Ok(())
    }
}

/// Detection timestamps are bucketed to 10 s for identity comparison.
pub fn round_to_bucket(t: DateTime<Utc>) -> i64 {
    let secs = t.timestamp();
    secs - secs.rem_euclid(10)
}
