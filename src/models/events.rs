use super::*;
use chrono::{DateTime, Utc};

/// Kind-specific payload of a broadcast event. Serialized adjacently tagged so
/// the wire form is `{"type": ..., "data": {...}, "occurred_at": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventData {
    PositionUpdate {
        train_id: TrainId,
        section_id: SectionId,
        coordinates: Option<GeoPoint>,
        speed_kmh: f32,
        heading_deg: f32,
        timestamp: DateTime<Utc>,
    },
    SectionEntry {
        train_id: TrainId,
        section_id: SectionId,
        entry_time: DateTime<Utc>,
        expected_exit_time: Option<DateTime<Utc>>,
    },
    SectionExit {
        train_id: TrainId,
        section_id: SectionId,
        exit_time: DateTime<Utc>,
    },
    SectionStatus {
        section_id: SectionId,
        occupancy: u32,
        capacity: u32,
        trains: Vec<TrainId>,
    },
    ConflictDetected {
        conflict: Conflict,
    },
    ConflictUpdated {
        conflict: Conflict,
    },
    ConflictResolved {
        conflict_id: u64,
        trains_involved: Vec<TrainId>,
        sections_involved: Vec<SectionId>,
        resolved_by: ControllerId,
        resolution_time: DateTime<Utc>,
    },
    ConflictAlert {
        conflict_id: u64,
        kind: ConflictKind,
        severity: ConflictSeverity,
        trains_involved: Vec<TrainId>,
        sections_involved: Vec<SectionId>,
        expected_impact_time: Option<DateTime<Utc>>,
        description: String,
        suggestions: Vec<ResolutionSuggestion>,
    },
    DecisionLogged {
        decision: Decision,
    },
    DecisionExecuted {
        decision_id: u64,
        controller_id: ControllerId,
        action: DecisionAction,
        train_id: Option<TrainId>,
        conflict_id: Option<u64>,
        execution_time: DateTime<Utc>,
        execution_result: String,
    },
    SystemMessage {
        message: String,
        severity: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(flatten)]
    pub data: EventData,
    pub occurred_at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(data: EventData) -> Self {
        Self {
            data,
            occurred_at: Utc::now(),
        }
    }

    /// Train and section ids this event is tagged with, used for both
    /// subscription matching and shard routing.
    pub fn routing_keys(&self) -> (Vec<TrainId>, Vec<SectionId>) {
        match &self.data {
            EventData::PositionUpdate { train_id, section_id, .. }
            | EventData::SectionEntry { train_id, section_id, .. }
            | EventData::SectionExit { train_id, section_id, .. } => {
                (vec![*train_id], vec![*section_id])
            }
            EventData::SectionStatus { section_id, trains, .. } => (trains.clone(), vec![*section_id]),
            EventData::ConflictDetected { conflict } | EventData::ConflictUpdated { conflict } => {
                (conflict.trains_involved.clone(), conflict.sections_involved.clone())
            }
            EventData::ConflictResolved { trains_involved, sections_involved, .. }
            | EventData::ConflictAlert { trains_involved, sections_involved, .. } => {
                (trains_involved.clone(), sections_involved.clone())
            }
            EventData::DecisionLogged { decision } => (
                decision.train_id.into_iter().collect(),
                decision.section_id.into_iter().collect(),
            ),
            EventData::DecisionExecuted { train_id, .. } => {
                (train_id.iter().copied().collect(), Vec::new())
            }
            EventData::SystemMessage { .. } => (Vec::new(), Vec::new()),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.data {
            EventData::PositionUpdate { .. } => "PositionUpdate",
            EventData::SectionEntry { .. } => "SectionEntry",
            EventData::SectionExit { .. } => "SectionExit",
            EventData::SectionStatus { .. } => "SectionStatus",
            EventData::ConflictDetected { .. } => "ConflictDetected",
            EventData::ConflictUpdated { .. } => "ConflictUpdated",
            EventData::ConflictResolved { .. } => "ConflictResolved",
            EventData::ConflictAlert { .. } => "ConflictAlert",
            EventData::DecisionLogged { .. } => "DecisionLogged",
            EventData::DecisionExecuted { .. } => "DecisionExecuted",
            EventData::SystemMessage { .. } => "SystemMessage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_carries_type_data_and_occurred_at() {
        let event = EngineEvent::new(EventData::SectionExit {
            train_id: 101,
            section_id: 7,
            exit_time: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SectionExit");
        assert_eq!(json["data"]["train_id"], 101);
        assert!(json["occurred_at"].is_string());
    }

    #[test]
    fn routing_keys_cover_conflict_participants() {
        let event = EngineEvent::new(EventData::ConflictAlert {
            conflict_id: 9,
            kind: ConflictKind::JunctionConflict,
            severity: ConflictSeverity::High,
            trains_involved: vec![1, 2, 3, 4],
            sections_involved: vec![9],
            expected_impact_time: None,
            description: "junction window exceeded".into(),
            suggestions: Vec::new(),
        });
        let (trains, sections) = event.routing_keys();
        assert_eq!(trains, vec![1, 2, 3, 4]);
        assert_eq!(sections, vec![9]);
    }

    #[test]
    fn system_message_has_no_keys() {
        let event = EngineEvent::new(EventData::SystemMessage {
            message: "detector restarted".into(),
            severity: "info".into(),
        });
        let (trains, sections) = event.routing_keys();
        assert!(trains.is_empty());
        assert!(sections.is_empty());
    }
}
