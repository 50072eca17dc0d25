use super::*;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Train {
    pub id: TrainId,
    pub train_number: String,
    pub kind: TrainKind,
    pub max_speed_kmh: f32,
    pub capacity: u32,
    pub length_m: f32,
    pub weight_t: f32,
    pub priority: u8,
    pub operational_status: TrainStatus,
    pub current_section: Option<SectionId>,
    pub current_speed_kmh: f32,
    pub current_load: u32,
    pub delay_minutes: i32,
    /// Scheduled sequence of sections still ahead of the train.
    pub route: Vec<SectionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainKind {
    Express,
    Local,
    Freight,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainStatus {
    Active,
    Maintenance,
    OutOfService,
    Emergency,
}

impl Train {
    pub fn new(id: TrainId, train_number: impl Into<String>, kind: TrainKind, priority: u8) -> Self {
        let now = Utc::now();
        let max_speed_kmh = match kind {
            TrainKind::Express => 160.0,
            TrainKind::Local => 110.0,
            TrainKind::Freight => 90.0,
            TrainKind::Maintenance => 60.0,
        };
        Self {
            id,
            train_number: train_number.into(),
            kind,
            max_speed_kmh,
            capacity: 1200,
            length_m: 400.0,
            weight_t: 900.0,
            priority: priority.clamp(1, 10),
            operational_status: TrainStatus::Active,
            current_section: None,
            current_speed_kmh: 0.0,
            current_load: 0,
            delay_minutes: 0,
            route: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Load counted toward the passenger-impact severity factor. Freight and
    /// maintenance consists carry tonnage, not passengers.
    pub fn passenger_count(&self) -> u32 {
        match self.kind {
            TrainKind::Express | TrainKind::Local => self.current_load,
            TrainKind::Freight | TrainKind::Maintenance => 0,
        }
    }

    pub fn is_reportable(&self) -> bool {
        self.operational_status != TrainStatus::OutOfService
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=10).contains(&self.priority) {
            return Err(format!("train {} priority {} outside 1..=10", self.id, self.priority));
        }
        if self.current_load > self.capacity {
            return Err(format!(
                "train {} load {} exceeds capacity {}",
                self.id, self.current_load, self.capacity
            ));
        }
        if self.current_speed_kmh < 0.0 || self.current_speed_kmh > self.max_speed_kmh {
            return Err(format!(
                "train {} speed {} outside 0..={}",
                self.id, self.current_speed_kmh, self.max_speed_kmh
            ));
        }
        if self.train_number.is_empty() {
            return Err(format!("train {} has an empty train_number", self.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_train_is_valid() {
        let train = Train::new(101, "12951", TrainKind::Express, 8);
        assert!(train.validate().is_ok());
        assert_eq!(train.operational_status, TrainStatus::Active);
    }

    #[test]
    fn priority_is_clamped_into_range() {
        let train = Train::new(1, "T1", TrainKind::Local, 0);
        assert_eq!(train.priority, 1);
        let train = Train::new(2, "T2", TrainKind::Local, 99);
        assert_eq!(train.priority, 10);
    }

    #[test]
    fn overloaded_train_fails_validation() {
        let mut train = Train::new(1, "T1", TrainKind::Local, 5);
        train.current_load = train.capacity + 1;
        assert!(train.validate().is_err());
    }

    #[test]
    fn freight_carries_no_passengers() {
        let mut train = Train::new(201, "F201", TrainKind::Freight, 3);
        train.current_load = 2000;
        assert_eq!(train.passenger_count(), 0);
    }

    #[test]
    fn out_of_service_train_cannot_report() {
        let mut train = Train::new(1, "T1", TrainKind::Local, 5);
        train.operational_status = TrainStatus::OutOfService;
        assert!(!train.is_reportable());
    }
}
