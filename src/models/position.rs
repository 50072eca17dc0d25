use super::*;
use chrono::{DateTime, Duration, Utc};

/// A single time-stamped position sample from a train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub train_id: TrainId,
    pub section_id: SectionId,
    pub timestamp: DateTime<Utc>,
    pub coordinates: Option<GeoPoint>,
    pub speed_kmh: f32,
    pub heading_deg: f32,
    pub distance_from_start_m: Option<f32>,
    pub signal_strength: Option<f32>,
    pub gps_accuracy_m: Option<f32>,
}

impl PositionReport {
    pub fn new(train_id: TrainId, section_id: SectionId, timestamp: DateTime<Utc>, speed_kmh: f32) -> Self {
        Self {
            train_id,
            section_id,
            timestamp,
            coordinates: None,
            speed_kmh,
            heading_deg: 0.0,
            distance_from_start_m: None,
            signal_strength: None,
            gps_accuracy_m: None,
        }
    }

    pub fn validate(&self, now: DateTime<Utc>, max_clock_skew_secs: i64) -> Result<(), String> {
        if self.speed_kmh < 0.0 {
            return Err(format!("negative speed {}", self.speed_kmh));
        }
        if !(0.0..360.0).contains(&self.heading_deg) {
            return Err(format!("heading {} outside [0, 360)", self.heading_deg));
        }
        if self.timestamp > now + Duration::seconds(max_clock_skew_secs) {
            return Err(format!(
                "timestamp {} is further than {}s into the future",
                self.timestamp, max_clock_skew_secs
            ));
        }
        Ok(())
    }
}

/// The open interval during which a train is recorded inside a section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyRecord {
    pub id: u64,
    pub section_id: SectionId,
    pub train_id: TrainId,
    pub entry_time: DateTime<Utc>,
    pub expected_exit_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
}

impl OccupancyRecord {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}

/// Outcome of a bulk position submission; each report is judged independently.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkReport {
    pub accepted_count: usize,
    pub rejections: Vec<BulkRejection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkRejection {
    pub index: usize,
    pub train_id: TrainId,
    pub reason: String,
}
