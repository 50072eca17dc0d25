use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tracing::info;

use crate::error::EngineResult;
use crate::models::*;
use crate::storage::DomainStore;

/// Synthetic network and traffic generator, used by the demo bootstrap and
/// by load experiments.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub section_count: u32,
    pub junction_every: u32,
    pub train_count: u32,
    pub route_length: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            section_count: 24,
            junction_every: 6,
            train_count: 12,
            route_length: 5,
        }
    }
}

pub struct SyntheticNetwork {
    pub sections: Vec<Section>,
    pub trains: Vec<Train>,
    pub controllers: Vec<Controller>,
}

/// Build a ring of sections with periodic junctions, a controller roster and
/// a fleet spread around the ring.
pub fn generate_network(config: &SyntheticConfig) -> SyntheticNetwork {
    let mut rng = rand::thread_rng();
    let mut sections = Vec::with_capacity(config.section_count as usize);
    for i in 0..config.section_count {
        let id = i + 1;
        let kind = if id % config.junction_every == 0 {
            SectionKind::Junction
        } else if id % config.junction_every == 1 && id > 1 {
            SectionKind::Station
        } else {
            SectionKind::Track
        };
        let mut section = Section::new(id, format!("SEC-{id:03}"), kind);
        section.length_m = rng.gen_range(1_500.0..8_000.0);
        section.max_speed_kmh = match kind {
            SectionKind::Junction => 60.0,
            SectionKind::Station => 40.0,
            _ => 120.0,
        };
        section.capacity = match kind {
            SectionKind::Junction => 2,
            SectionKind::Station => 4,
            SectionKind::Yard => 6,
            SectionKind::Track => 1,
        };
        let prev = if id == 1 { config.section_count } else { id - 1 };
        let next = if id == config.section_count { 1 } else { id + 1 };
        section.adjacent_sections = vec![prev, next];
        sections.push(section);
    }

    let mut trains = Vec::with_capacity(config.train_count as usize);
    for i in 0..config.train_count {
        let id = 100 + i;
        let kind = match i % 4 {
            0 => TrainKind::Express,
            1 | 2 => TrainKind::Local,
            _ => TrainKind::Freight,
        };
        let priority = match kind {
            TrainKind::Express => rng.gen_range(7..=9),
            TrainKind::Local => rng.gen_range(4..=6),
            TrainKind::Freight => rng.gen_range(2..=4),
            TrainKind::Maintenance => 1,
        };
        let mut train = Train::new(id, format!("{}{:04}", kind_prefix(kind), 1000 + id), kind, priority);
        train.current_load = match kind {
            TrainKind::Express | TrainKind::Local => rng.gen_range(100..=1_100),
            _ => 0,
        };
        let start = rng.gen_range(1..=config.section_count);
        train.route = (1..=config.route_length as u32)
            .map(|step| (start + step - 1) % config.section_count + 1)
            .collect();
        trains.push(train);
    }

    let mut supervisor = Controller::new("CTR001", "EMP-1001", AuthLevel::Supervisor, "supervisor");
    supervisor.section_responsibility = (1..=config.section_count).collect();
    let manager = Controller::new("MGR001", "EMP-2001", AuthLevel::Manager, "manager");
    let admin = Controller::new("ADM001", "EMP-3001", AuthLevel::Admin, "admin");
    let controllers = vec![supervisor, manager, admin];

    SyntheticNetwork {
        sections,
        trains,
        controllers,
    }
}

fn kind_prefix(kind: TrainKind) -> &'static str {
    match kind {
        TrainKind::Express => "EXP",
        TrainKind::Local => "LOC",
        TrainKind::Freight => "FRT",
        TrainKind::Maintenance => "MNT",
    }
}

/// Seed the store with a generated network when it is empty. Returns whether
/// anything was written.
pub async fn seed_if_empty(store: &Arc<DomainStore>, config: &SyntheticConfig) -> EngineResult<bool> {
    if !store.list_sections().await?.is_empty() {
        return Ok(false);
    }
    let network = generate_network(config);
    for section in &network.sections {
        store.upsert_section(section).await?;
    }
    for train in &network.trains {
        store.upsert_train(train).await?;
    }
    for controller in &network.controllers {
        store.upsert_controller(controller).await?;
    }
    info!(
        "seeded demo network: {} sections, {} trains, {} controllers at {}",
        network.sections.len(),
        network.trains.len(),
        network.controllers.len(),
        Utc::now()
    );
    Ok(true)
}
