use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::{DetectionConfig, PredictionConfig, SeverityWeights};
use crate::models::*;
use crate::prediction::{PredictedVisit, Predictor};
use crate::storage::DetectionSnapshot;

pub mod scheduler;

pub use scheduler::DetectionScheduler;

/// A conflict produced by one detection pass, before it has been reconciled
/// with open conflicts and given an id.
#[derive(Debug, Clone)]
pub struct DetectedConflict {
    pub kind: ConflictKind,
    pub trains_involved: Vec<TrainId>,
    pub sections_involved: Vec<SectionId>,
    pub expected_impact_time: Option<DateTime<Utc>>,
    pub description: String,
    pub suggestions: Vec<ResolutionSuggestion>,
    pub severity_score: u8,
    pub severity: ConflictSeverity,
}

impl DetectedConflict {
    pub fn key(&self) -> ConflictKey {
        ConflictKey {
            kind: self.kind,
            trains: self.trains_involved.clone(),
            sections: self.sections_involved.clone(),
        }
    }
}

/// Pure conflict detector: everything is derived from one snapshot, so a
/// fixed snapshot always yields the same conflicts in the same order.
pub struct ConflictDetector {
    detection: DetectionConfig,
    weights: SeverityWeights,
    predictor: Predictor,
}

struct SectionVisit<'a> {
    train: &'a Train,
    visit: PredictedVisit,
}

fn overlap(a: &PredictedVisit, b: &PredictedVisit) -> Option<Duration> {
    let start = a.entry.max(b.entry);
    let end = a.exit.min(b.exit);
    if start < end {
        Some(end - start)
    } else {
        None
    }
}

fn ceil_minutes(duration: Duration) -> u32 {
    let secs = duration.num_seconds().max(0) as u64;
    secs.div_ceil(60) as u32
}

impl ConflictDetector {
    pub fn new(
        detection: DetectionConfig,
        prediction: PredictionConfig,
        weights: SeverityWeights,
    ) -> Self {
        Self {
            detection,
            weights,
            predictor: Predictor::new(prediction),
        }
    }

    /// Run all four rules over the snapshot. Output is ordered by severity,
    /// then earlier expected impact.
    pub fn detect_all(&self, snapshot: &DetectionSnapshot) -> Vec<DetectedConflict> {
        let now = snapshot.taken_at;
        let trains_by_id: BTreeMap<TrainId, &Train> =
            snapshot.trains.iter().map(|t| (t.id, t)).collect();
        let paths = self.predictor.predict_all(
            &snapshot.trains,
            &snapshot.sections,
            &snapshot.open_occupancies,
            now,
        );

        // Spatial pre-filter: bucket every predicted visit by section so only
        // trains sharing a section are ever compared.
        let mut visits_by_section: BTreeMap<SectionId, Vec<SectionVisit<'_>>> = BTreeMap::new();
        for (train_id, path) in paths.iter() {
            let Some(train) = trains_by_id.get(train_id).copied() else {
                continue;
            };
            for visit in path {
                visits_by_section
                    .entry(visit.section_id)
                    .or_default()
                    .push(SectionVisit {
                        train,
                        visit: visit.clone(),
                    });
            }
        }
        for bucket in visits_by_section.values_mut() {
            bucket.sort_by(|a, b| a.visit.entry.cmp(&b.visit.entry).then(a.train.id.cmp(&b.train.id)));
        }

        let mut found = Vec::new();
        found.extend(self.rule_section_overload(snapshot, &trains_by_id, now));
        found.extend(self.rule_collision_risk(snapshot, &visits_by_section, now));
        found.extend(self.rule_priority_conflict(snapshot, &visits_by_section, now));
        found.extend(self.rule_junction_conflict(snapshot, &visits_by_section, &trains_by_id, now));

        // Two visits of the same pair to the same section collapse onto one
        // identity; keep the more severe reading.
        let mut by_key: BTreeMap<ConflictKey, DetectedConflict> = BTreeMap::new();
        for conflict in found {
            match by_key.get(&conflict.key()) {
                Some(existing) if existing.severity_score >= conflict.severity_score => {}
                _ => {
                    by_key.insert(conflict.key(), conflict);
                }
            }
        }
        let mut conflicts: Vec<DetectedConflict> = by_key.into_values().collect();

        conflicts.sort_by(|a, b| {
            b.severity_score.cmp(&a.severity_score).then_with(|| {
                let impact_a = a.expected_impact_time.unwrap_or(now);
                let impact_b = b.expected_impact_time.unwrap_or(now);
                impact_a.cmp(&impact_b)
            })
        });
        debug!("detection pass produced {} conflicts", conflicts.len());
        conflicts
    }

    // ── Rule 1: SECTION_OVERLOAD ────────────────────────────────────────

    fn rule_section_overload(
        &self,
        snapshot: &DetectionSnapshot,
        trains_by_id: &BTreeMap<TrainId, &Train>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut live_by_section: BTreeMap<SectionId, Vec<&OccupancyRecord>> = BTreeMap::new();
        for record in &snapshot.open_occupancies {
            live_by_section.entry(record.section_id).or_default().push(record);
        }

        let mut conflicts = Vec::new();
        for (section_id, records) in live_by_section {
            let Some(section) = snapshot.sections.get(&section_id) else {
                continue;
            };
            if records.len() as u32 <= section.capacity {
                continue;
            }
            let mut train_ids: Vec<TrainId> = records.iter().map(|r| r.train_id).collect();
            train_ids.sort_unstable();
            let suggestions = self.suggest_for_overload(section, &records, trains_by_id, now);
            let trains: Vec<&Train> = train_ids
                .iter()
                .filter_map(|id| trains_by_id.get(id).copied())
                .collect();
            let description = format!(
                "section {} holds {} trains over capacity {}",
                section.section_code,
                records.len(),
                section.capacity
            );
            conflicts.push(self.finish(
                ConflictKind::SectionOverload,
                train_ids,
                vec![section_id],
                Some(now),
                description,
                suggestions,
                &trains,
                now,
            ));
        }
        conflicts
    }

    // ── Rule 2: COLLISION_RISK ──────────────────────────────────────────

    fn rule_collision_risk(
        &self,
        snapshot: &DetectionSnapshot,
        visits_by_section: &BTreeMap<SectionId, Vec<SectionVisit<'_>>>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut conflicts = Vec::new();
        for (&section_id, bucket) in visits_by_section {
            let Some(section) = snapshot.sections.get(&section_id) else {
                continue;
            };
            // Only future entries: a train already inside is the priority
            // rule's concern, not a predicted convergence.
            let future: Vec<&SectionVisit<'_>> =
                bucket.iter().filter(|sv| sv.visit.entry > now).collect();
            for i in 0..future.len() {
                for j in (i + 1)..future.len() {
                    let (a, b) = (future[i], future[j]);
                    if a.train.id == b.train.id {
                        continue;
                    }
                    let Some(shared) = overlap(&a.visit, &b.visit) else {
                        continue;
                    };
                    let impact = a.visit.entry.max(b.visit.entry);
                    let mut train_ids = vec![a.train.id, b.train.id];
                    train_ids.sort_unstable();
                    let suggestions =
                        self.suggest_for_collision(section, a, b, shared, snapshot);
                    let description = format!(
                        "trains {} and {} are predicted to overlap in section {} for {}s",
                        a.train.id,
                        b.train.id,
                        section.section_code,
                        shared.num_seconds()
                    );
                    conflicts.push(self.finish(
                        ConflictKind::CollisionRisk,
                        train_ids,
                        vec![section_id],
                        Some(impact),
                        description,
                        suggestions,
                        &[a.train, b.train],
                        now,
                    ));
                }
            }
        }
        conflicts
    }

    // ── Rule 3: PRIORITY_CONFLICT ───────────────────────────────────────

    fn rule_priority_conflict(
        &self,
        snapshot: &DetectionSnapshot,
        visits_by_section: &BTreeMap<SectionId, Vec<SectionVisit<'_>>>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut conflicts = Vec::new();
        for (&section_id, bucket) in visits_by_section {
            let Some(section) = snapshot.sections.get(&section_id) else {
                continue;
            };
            if section.capacity != 1 {
                continue;
            }
            for i in 0..bucket.len() {
                for j in 0..bucket.len() {
                    if i == j {
                        continue;
                    }
                    let blocker = &bucket[i];
                    let victim = &bucket[j];
                    if blocker.train.id == victim.train.id {
                        continue;
                    }
                    // The blocker holds the section first; the later,
                    // higher-priority train is the one held up.
                    if blocker.visit.entry >= victim.visit.entry {
                        continue;
                    }
                    if victim.train.priority <= blocker.train.priority {
                        continue;
                    }
                    let Some(shared) = overlap(&blocker.visit, &victim.visit) else {
                        continue;
                    };
                    let mut train_ids = vec![blocker.train.id, victim.train.id];
                    train_ids.sort_unstable();
                    let suggestions =
                        self.suggest_for_priority(blocker.train, shared);
                    let description = format!(
                        "train {} (priority {}) blocks higher-priority train {} in section {}",
                        blocker.train.id,
                        blocker.train.priority,
                        victim.train.id,
                        section.section_code
                    );
                    conflicts.push(self.finish(
                        ConflictKind::PriorityConflict,
                        train_ids,
                        vec![section_id],
                        Some(victim.visit.entry.max(now)),
                        description,
                        suggestions,
                        &[blocker.train, victim.train],
                        now,
                    ));
                }
            }
        }
        conflicts
    }

    // ── Rule 4: JUNCTION_CONFLICT ───────────────────────────────────────

    fn rule_junction_conflict(
        &self,
        snapshot: &DetectionSnapshot,
        visits_by_section: &BTreeMap<SectionId, Vec<SectionVisit<'_>>>,
        trains_by_id: &BTreeMap<TrainId, &Train>,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let window = Duration::seconds(self.detection.junction_window_secs as i64);
        let mut conflicts = Vec::new();
        for (&section_id, bucket) in visits_by_section {
            let Some(section) = snapshot.sections.get(&section_id) else {
                continue;
            };
            if section.kind != SectionKind::Junction {
                continue;
            }
            // Slide the window from each visit's entry; first window that
            // exceeds capacity wins.
            let mut flagged: Option<Vec<&SectionVisit<'_>>> = None;
            for anchor in bucket {
                let window_start = anchor.visit.entry;
                let window_end = window_start + window;
                let mut inside: Vec<&SectionVisit<'_>> = bucket
                    .iter()
                    .filter(|sv| sv.visit.entry < window_end && sv.visit.exit > window_start)
                    .collect();
                let distinct: BTreeSet<TrainId> = inside.iter().map(|sv| sv.train.id).collect();
                if distinct.len() as u32 > section.capacity {
                    inside.sort_by(|a, b| {
                        a.visit.entry.cmp(&b.visit.entry).then(a.train.id.cmp(&b.train.id))
                    });
                    flagged = Some(inside);
                    break;
                }
            }
            let Some(inside) = flagged else {
                continue;
            };
            let mut train_ids: Vec<TrainId> = inside
                .iter()
                .map(|sv| sv.train.id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            train_ids.sort_unstable();
            // Impact when the first train beyond capacity arrives.
            let impact = inside
                .get(section.capacity as usize)
                .map(|sv| sv.visit.entry.max(now))
                .unwrap_or(now);
            let suggestions = self.suggest_for_junction(section, &inside);
            let trains: Vec<&Train> = train_ids
                .iter()
                .filter_map(|id| trains_by_id.get(id).copied())
                .collect();
            let description = format!(
                "{} trains converge on junction {} (capacity {}) within {}s",
                train_ids.len(),
                section.section_code,
                section.capacity,
                window.num_seconds()
            );
            conflicts.push(self.finish(
                ConflictKind::JunctionConflict,
                train_ids,
                vec![section_id],
                Some(impact),
                description,
                suggestions,
                &trains,
                now,
            ));
        }
        conflicts
    }

    // ── Severity ────────────────────────────────────────────────────────

    fn severity_score(
        &self,
        kind: ConflictKind,
        trains: &[&Train],
        sections_involved: &[SectionId],
        expected_impact_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> u8 {
        let alert_window = self.detection.alert_window_secs as f64;
        let f_time = match expected_impact_time {
            Some(impact) => {
                let tti = (impact - now).num_seconds().max(0) as f64;
                (1.0 - tti / alert_window).clamp(0.0, 1.0)
            }
            None => 0.0,
        };
        let f_prio = trains
            .iter()
            .map(|t| t.priority)
            .max()
            .unwrap_or(1) as f64
            / 10.0;
        let passengers: u32 = trains.iter().map(|t| t.passenger_count()).sum();
        let f_pax = (passengers as f64 / 1000.0).clamp(0.0, 1.0);
        let f_net = (sections_involved.len() as f64 / 5.0).clamp(0.0, 1.0);
        let f_safety = match kind {
            ConflictKind::CollisionRisk => 1.0,
            ConflictKind::JunctionConflict => 0.6,
            _ => 0.3,
        };
        let w = &self.weights;
        let score = w.time * f_time
            + w.priority * f_prio
            + w.passengers * f_pax
            + w.network * f_net
            + w.safety * f_safety;
        (score.round() as i64).clamp(1, 10) as u8
    }

    fn finish(
        &self,
        kind: ConflictKind,
        trains_involved: Vec<TrainId>,
        sections_involved: Vec<SectionId>,
        expected_impact_time: Option<DateTime<Utc>>,
        description: String,
        suggestions: Vec<ResolutionSuggestion>,
        trains: &[&Train],
        now: DateTime<Utc>,
    ) -> DetectedConflict {
        let score = self.severity_score(kind, trains, &sections_involved, expected_impact_time, now);
        DetectedConflict {
            kind,
            trains_involved,
            sections_involved,
            expected_impact_time,
            description,
            suggestions,
            severity_score: score,
            severity: ConflictSeverity::from_score(score),
        }
    }

    // ── Suggestions ─────────────────────────────────────────────────────

    fn suggest_for_collision(
        &self,
        section: &Section,
        a: &SectionVisit<'_>,
        b: &SectionVisit<'_>,
        shared: Duration,
        snapshot: &DetectionSnapshot,
    ) -> Vec<ResolutionSuggestion> {
        let buffer_min = self.detection.safety_buffer_secs.div_ceil(60) as u32;
        // Hold the lower-priority train; on a tie the later arrival yields.
        let yielder = if a.train.priority != b.train.priority {
            if a.train.priority < b.train.priority { a } else { b }
        } else if a.visit.entry <= b.visit.entry {
            b
        } else {
            a
        };
        let delay_minutes = ceil_minutes(shared) + buffer_min;
        let mut suggestions = Vec::new();
        if delay_minutes <= 180 {
            suggestions.push(ResolutionSuggestion {
                id: format!("collision:delay:{}", yielder.train.id),
                actions: vec![SuggestedAction {
                    train_id: yielder.train.id,
                    parameters: DecisionParameters::Delay { delay_minutes },
                }],
                estimated_cost: delay_minutes as f64,
            });
        }
        if let Some(alternative) = self.detour_around(section, snapshot) {
            suggestions.push(ResolutionSuggestion {
                id: format!("collision:reroute:{}", yielder.train.id),
                actions: vec![SuggestedAction {
                    train_id: yielder.train.id,
                    parameters: DecisionParameters::Reroute {
                        new_route: vec![alternative],
                    },
                }],
                estimated_cost: delay_minutes as f64 * 2.0 + 10.0,
            });
        }
        if suggestions.is_empty() {
            suggestions.push(ResolutionSuggestion {
                id: format!("collision:delay:{}", yielder.train.id),
                actions: vec![SuggestedAction {
                    train_id: yielder.train.id,
                    parameters: DecisionParameters::Delay { delay_minutes: 180 },
                }],
                estimated_cost: 180.0,
            });
        }
        suggestions
    }

    fn detour_around(&self, section: &Section, snapshot: &DetectionSnapshot) -> Option<SectionId> {
        section
            .adjacent_sections
            .iter()
            .copied()
            .find(|id| {
                snapshot
                    .sections
                    .get(id)
                    .map(|s| s.active && s.id != section.id)
                    .unwrap_or(false)
            })
    }

    fn suggest_for_overload(
        &self,
        section: &Section,
        live: &[&OccupancyRecord],
        trains_by_id: &BTreeMap<TrainId, &Train>,
        now: DateTime<Utc>,
    ) -> Vec<ResolutionSuggestion> {
        let buffer_min = self.detection.safety_buffer_secs.div_ceil(60) as u32;
        let mut occupants: Vec<(&OccupancyRecord, u8)> = live
            .iter()
            .map(|r| {
                let priority = trains_by_id.get(&r.train_id).map(|t| t.priority).unwrap_or(1);
                (*r, priority)
            })
            .collect();
        // Lowest priority leaves last; they are the ones asked to hold.
        occupants.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.train_id.cmp(&b.0.train_id)));
        let excess = live.len().saturating_sub(section.capacity as usize);
        let holders = &occupants[..excess];
        let retained = &occupants[excess..];
        let mut exits: Vec<DateTime<Utc>> = retained
            .iter()
            .filter_map(|(r, _)| r.expected_exit_time)
            .collect();
        exits.sort_unstable();

        let mut actions = Vec::new();
        let mut total_cost = 0.0;
        for (k, (record, _)) in holders.iter().enumerate() {
            let delay_minutes = match exits.get(k) {
                Some(exit) => ceil_minutes(*exit - now) + buffer_min,
                None => buffer_min,
            }
            .min(180);
            total_cost += delay_minutes as f64;
            actions.push(SuggestedAction {
                train_id: record.train_id,
                parameters: DecisionParameters::Delay { delay_minutes },
            });
        }
        vec![ResolutionSuggestion {
            id: format!("overload:hold:{}", section.id),
            actions,
            estimated_cost: total_cost,
        }]
    }

    fn suggest_for_priority(&self, blocker: &Train, shared: Duration) -> Vec<ResolutionSuggestion> {
        let delay_minutes = ceil_minutes(shared).max(1).min(180);
        vec![ResolutionSuggestion {
            id: format!("priority:delay:{}", blocker.id),
            actions: vec![SuggestedAction {
                train_id: blocker.id,
                parameters: DecisionParameters::Delay { delay_minutes },
            }],
            estimated_cost: delay_minutes as f64,
        }]
    }

    fn suggest_for_junction(
        &self,
        section: &Section,
        inside: &[&SectionVisit<'_>],
    ) -> Vec<ResolutionSuggestion> {
        // Sequence by descending priority, then earlier arrival; everyone
        // past the junction's capacity waits for a slot to clear.
        let mut sequence: Vec<&SectionVisit<'_>> = inside.to_vec();
        sequence.sort_by(|a, b| {
            b.train
                .priority
                .cmp(&a.train.priority)
                .then(a.visit.entry.cmp(&b.visit.entry))
                .then(a.train.id.cmp(&b.train.id))
        });
        let capacity = section.capacity as usize;
        let mut actions = Vec::new();
        let mut total_cost = 0.0;
        for (i, sv) in sequence.iter().enumerate().skip(capacity) {
            let predecessor = sequence[i - capacity];
            let wait = predecessor.visit.exit - sv.visit.entry;
            let delay_minutes = ceil_minutes(wait).max(1).min(180);
            total_cost += delay_minutes as f64;
            actions.push(SuggestedAction {
                train_id: sv.train.id,
                parameters: DecisionParameters::Delay { delay_minutes },
            });
        }
        vec![ResolutionSuggestion {
            id: format!("junction:sequence:{}", section.id),
            actions,
            estimated_cost: total_cost,
        }]
    }
}
