use super::*;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub section_code: String,
    pub kind: SectionKind,
    pub length_m: f32,
    pub max_speed_kmh: f32,
    pub capacity: u32,
    pub adjacent_sections: Vec<SectionId>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionKind {
    Track,
    Junction,
    Station,
    Yard,
}

impl Section {
    pub fn new(id: SectionId, section_code: impl Into<String>, kind: SectionKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            section_code: section_code.into(),
            kind,
            length_m: 5_000.0,
            max_speed_kmh: 120.0,
            capacity: 1,
            adjacent_sections: Vec::new(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Seconds a train needs to traverse this section at `speed_kmh`, with the
    /// speed floored so a stationary train still yields a finite estimate.
    pub fn traversal_seconds(&self, speed_kmh: f32, floor_speed_kmh: f32) -> f64 {
        let effective_kmh = speed_kmh.max(floor_speed_kmh) as f64;
        let metres_per_second = effective_kmh * 1000.0 / 3600.0;
        self.length_m as f64 / metres_per_second
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.capacity < 1 {
            return Err(format!("section {} capacity must be >= 1", self.id));
        }
        if self.length_m <= 0.0 {
            return Err(format!("section {} length must be positive", self.id));
        }
        if self.section_code.is_empty() {
            return Err(format!("section {} has an empty section_code", self.id));
        }
        Ok(())
    }
}
