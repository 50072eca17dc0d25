//! Property-style checks over the engine: occupancy bookkeeping, overload
//! correspondence, dedup and decision invariants.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use railway_conflict_engine::config::EngineConfig;
use railway_conflict_engine::decision::{ControlRequest, ResolveAction, ResolveRequest};
use railway_conflict_engine::models::*;
use railway_conflict_engine::storage::DecisionFilter;
use railway_conflict_engine::{AppState, Engine};

struct TestEngine {
    _dir: TempDir,
    engine: Option<Engine>,
    state: AppState,
}

impl TestEngine {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.store.path = dir.path().join("db").to_string_lossy().into_owned();
        config.prediction.travel_time_margin = 1.0;
        let engine = Engine::start(config).await.unwrap();
        let state = engine.state();
        Self {
            _dir: dir,
            engine: Some(engine),
            state,
        }
    }

    async fn stop(mut self) {
        if let Some(engine) = self.engine.take() {
            engine.shutdown().await;
        }
    }
}

async fn seed_grid(state: &AppState, sections: u32, trains: u32) {
    for id in 1..=sections {
        let mut section = Section::new(id, format!("SEC-{id:03}"), SectionKind::Track);
        section.length_m = 2_000.0;
        section.capacity = 2;
        state.store.upsert_section(&section).await.unwrap();
    }
    for i in 0..trains {
        let id = 100 + i;
        let mut train = Train::new(id, format!("T{id}"), TrainKind::Local, 5);
        train.current_load = 200;
        state.store.upsert_train(&train).await.unwrap();
    }
}

/// P1: after any accepted sequence of reports, open occupancies per section
/// equal the set of trains whose latest report names that section.
#[tokio::test(flavor = "multi_thread")]
async fn occupancy_matches_latest_positions() {
    let fx = TestEngine::start().await;
    let state = &fx.state;
    seed_grid(state, 6, 8).await;

    // A deterministic walk: every train hops through sections with strictly
    // increasing timestamps; some reports repeat the section.
    let t0 = Utc::now() - chrono::Duration::seconds(600);
    for step in 0..40u32 {
        let train_id = 100 + (step % 8);
        let section_id = (step * 7 + train_id) % 6 + 1;
        let report = PositionReport::new(
            train_id,
            section_id,
            t0 + chrono::Duration::seconds(step as i64 * 10),
            30.0,
        );
        state.pipeline.report_position(report).await.unwrap();
    }

    // Ground truth from the latest report per train.
    let mut expected: HashMap<SectionId, Vec<TrainId>> = HashMap::new();
    for i in 0..8u32 {
        let train_id = 100 + i;
        let latest = state.pipeline.current_position(train_id).await.unwrap();
        expected.entry(latest.section_id).or_default().push(train_id);
    }
    for trains in expected.values_mut() {
        trains.sort_unstable();
    }

    for section_id in 1..=6u32 {
        let observed = state.pipeline.trains_in_section(section_id).await;
        let expected = expected.remove(&section_id).unwrap_or_default();
        assert_eq!(observed, expected, "section {section_id}");
    }
    // Exactly one open occupancy per train that ever reported.
    assert_eq!(state.pipeline.open_occupancies().await.len(), 8);

    fx.stop().await;
}

/// P2: whenever live occupancy exceeds capacity, the next detection run
/// emits a SECTION_OVERLOAD naming the section and every live train.
#[tokio::test(flavor = "multi_thread")]
async fn overload_is_always_classified() {
    let fx = TestEngine::start().await;
    let state = &fx.state;

    let mut section = Section::new(3, "SEC-003", SectionKind::Track);
    section.length_m = 2_000.0;
    section.capacity = 2;
    state.store.upsert_section(&section).await.unwrap();
    for id in [501u32, 502, 503] {
        let mut train = Train::new(id, format!("T{id}"), TrainKind::Local, 5);
        train.current_load = 300;
        state.store.upsert_train(&train).await.unwrap();
        state
            .pipeline
            .report_position(PositionReport::new(id, 3, Utc::now(), 10.0))
            .await
            .unwrap();
    }

    let delta = state.scheduler.run_detection_once().await.unwrap();
    let overload = delta
        .new_conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::SectionOverload)
        .expect("overload must be classified");
    assert_eq!(overload.sections_involved, vec![3]);
    assert_eq!(overload.trains_involved, vec![501, 502, 503]);

    fx.stop().await;
}

/// P4 + P5: re-detection dedups onto the same conflict id, and a resolved
/// conflict never reappears.
#[tokio::test(flavor = "multi_thread")]
async fn dedup_and_no_resurrection() {
    let fx = TestEngine::start().await;
    let state = &fx.state;

    let mut section = Section::new(4, "SEC-004", SectionKind::Track);
    section.length_m = 2_000.0;
    section.capacity = 1;
    state.store.upsert_section(&section).await.unwrap();
    for id in [601u32, 602] {
        let mut train = Train::new(id, format!("T{id}"), TrainKind::Local, 5);
        train.current_load = 300;
        state.store.upsert_train(&train).await.unwrap();
        state
            .pipeline
            .report_position(PositionReport::new(id, 4, Utc::now(), 10.0))
            .await
            .unwrap();
    }

    let first = state.scheduler.run_detection_once().await.unwrap();
    assert_eq!(first.new_conflicts.len(), 1);
    let conflict_id = first.new_conflicts[0].id;

    let second = state.scheduler.run_detection_once().await.unwrap();
    assert!(second.new_conflicts.is_empty(), "rerun must not mint new conflicts");
    assert_eq!(second.updated_conflicts.len(), 1);
    assert_eq!(second.updated_conflicts[0].id, conflict_id);

    // Resolve it, then re-run detection on unchanged state.
    let mut supervisor = Controller::new("CTR001", "EMP-1", AuthLevel::Supervisor, "pw");
    supervisor.section_responsibility = vec![4];
    let ack = state
        .decision_engine
        .resolve_conflict(
            &supervisor,
            ResolveRequest {
                conflict_id,
                action: ResolveAction::Accept,
                rationale: "hold the junior occupant".into(),
                modifications: None,
                target_train_id: None,
                ai_solution_id: None,
            },
        )
        .await
        .unwrap();
    for _ in 0..60 {
        let resolved = state
            .store
            .get_conflict(conflict_id)
            .await
            .unwrap()
            .unwrap()
            .is_resolved();
        if resolved {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let _ = ack;

    let third = state.scheduler.run_detection_once().await.unwrap();
    assert!(third.new_conflicts.is_empty(), "resolved conflict resurrected");
    assert!(third.updated_conflicts.is_empty());

    fx.stop().await;
}

/// P6: every decision row keeps its execution and approval invariants.
#[tokio::test(flavor = "multi_thread")]
async fn decision_rows_keep_their_invariants() {
    let fx = TestEngine::start().await;
    let state = &fx.state;
    seed_grid(state, 3, 3).await;
    for (i, id) in [100u32, 101, 102].iter().enumerate() {
        state
            .pipeline
            .report_position(PositionReport::new(
                *id,
                i as u32 + 1,
                Utc::now(),
                20.0,
            ))
            .await
            .unwrap();
    }

    let mut supervisor = Controller::new("CTR001", "EMP-1", AuthLevel::Supervisor, "pw");
    supervisor.section_responsibility = vec![1, 2, 3];

    for (train_id, parameters) in [
        (100u32, DecisionParameters::Delay { delay_minutes: 15 }),
        (101, DecisionParameters::PriorityChange { new_priority: 9 }),
        (102, DecisionParameters::Reroute { new_route: vec![2, 3] }),
    ] {
        state
            .decision_engine
            .control_train(
                &supervisor,
                ControlRequest {
                    train_id,
                    parameters,
                    reason: "scheduled traffic adjustment".into(),
                    emergency: false,
                },
            )
            .await
            .unwrap();
    }

    // Give the executor pool time to drain the queue.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let (rows, _) = state
            .store
            .query_decisions(&DecisionFilter::default(), 0, 100)
            .await
            .unwrap();
        if rows.iter().all(|d| d.executed) || std::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (rows, total) = state
        .store
        .query_decisions(&DecisionFilter::default(), 0, 100)
        .await
        .unwrap();
    assert_eq!(total, 3);
    for decision in rows {
        decision.check_invariants().expect("decision invariant violated");
        if decision.executed {
            assert!(decision.execution_time.unwrap() >= decision.timestamp);
            assert!(decision.execution_result.is_some());
        }
        if decision.approval_required {
            assert!(decision.approved_by.is_some());
            assert!(decision.approval_time.is_some());
        }
    }
    // The delay reached the train record.
    assert_eq!(state.store.require_train(100).await.unwrap().delay_minutes, 15);
    // The reroute was auto-approved for the supervisor and applied.
    assert_eq!(state.store.require_train(102).await.unwrap().route, vec![2, 3]);

    fx.stop().await;
}
