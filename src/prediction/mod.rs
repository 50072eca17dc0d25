use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::PredictionConfig;
use crate::models::{OccupancyRecord, Section, SectionId, Train, TrainId};

/// One predicted stay inside a section.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedVisit {
    pub section_id: SectionId,
    pub entry: DateTime<Utc>,
    pub exit: DateTime<Utc>,
}

/// Forward path model: a train follows the remaining sections of its schedule
/// at the slower of its own and each section's speed limit; without a
/// schedule it is assumed to stay where it is.
pub struct Predictor {
    config: PredictionConfig,
}

impl Predictor {
    pub fn new(config: PredictionConfig) -> Self {
        Self { config }
    }

    fn dwell(&self, section: &Section, train: &Train) -> Duration {
        let speed = train.max_speed_kmh.min(section.max_speed_kmh);
        let seconds = section.traversal_seconds(speed, self.config.travel_time_floor_speed_kmh)
            * self.config.travel_time_margin;
        Duration::milliseconds((seconds * 1000.0) as i64)
    }

    /// Predict the train's section visits from `now` out to the horizon. The
    /// returned list is ordered, finite, and ends at or before the horizon.
    pub fn predict_path(
        &self,
        train: &Train,
        sections: &HashMap<SectionId, Section>,
        open_occupancy: Option<&OccupancyRecord>,
        now: DateTime<Utc>,
    ) -> Vec<PredictedVisit> {
        let horizon_end = now + Duration::seconds(self.config.horizon_secs as i64);
        let Some(current_id) = train.current_section else {
            return Vec::new();
        };
        let Some(current) = sections.get(&current_id) else {
            return Vec::new();
        };

        let mut visits = Vec::new();
        let entry = open_occupancy.map(|o| o.entry_time).unwrap_or(now);
        let mut exit = entry + self.dwell(current, train);
        // An announced hold keeps the train in place for its delay.
        if train.delay_minutes > 0 {
            exit = exit + Duration::minutes(train.delay_minutes as i64);
        }
        // An overdue train is treated as about to leave, not already gone.
        if exit < now {
            exit = now;
        }
        visits.push(PredictedVisit {
            section_id: current_id,
            entry,
            exit: exit.min(horizon_end),
        });

        let mut cursor = exit;
        for &next_id in &train.route {
            if next_id == current_id {
                continue;
            }
            if cursor >= horizon_end {
                break;
            }
            let Some(next) = sections.get(&next_id) else {
                break;
            };
            let exit = cursor + self.dwell(next, train);
            visits.push(PredictedVisit {
                section_id: next_id,
                entry: cursor,
                exit: exit.min(horizon_end),
            });
            cursor = exit;
        }
        visits
    }

    /// Paths for every reportable train in one pass, keyed by train id.
    pub fn predict_all(
        &self,
        trains: &[Train],
        sections: &HashMap<SectionId, Section>,
        open_occupancies: &[OccupancyRecord],
        now: DateTime<Utc>,
    ) -> HashMap<TrainId, Vec<PredictedVisit>> {
        let occupancy_by_train: HashMap<TrainId, &OccupancyRecord> = open_occupancies
            .iter()
            .map(|record| (record.train_id, record))
            .collect();
        trains
            .iter()
            .filter(|t| t.is_reportable())
            .map(|train| {
                let path = self.predict_path(
                    train,
                    sections,
                    occupancy_by_train.get(&train.id).copied(),
                    now,
                );
                (train.id, path)
            })
            .collect()
    }
}
