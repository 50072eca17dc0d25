//! End-to-end scenarios driven through a running engine: position intake,
//! detection, controller decisions and the broadcast stream.

use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use railway_conflict_engine::config::EngineConfig;
use railway_conflict_engine::decision::{ResolveAction, ResolveRequest};
use railway_conflict_engine::error::EngineError;
use railway_conflict_engine::hub::Subscription;
use railway_conflict_engine::models::*;
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
        // Exact traversal times make the scenario arithmetic predictable.
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

fn supervisor() -> Controller {
    let mut ctrl = Controller::new("CTR001", "EMP-1", AuthLevel::Supervisor, "pw");
    ctrl.section_responsibility = (1..=50).collect();
    ctrl
}

async fn seed_section(state: &AppState, id: SectionId, kind: SectionKind, length_m: f32, capacity: u32) {
    let mut section = Section::new(id, format!("SEC-{id:03}"), kind);
    section.length_m = length_m;
    section.max_speed_kmh = 60.0;
    section.capacity = capacity;
    state.store.upsert_section(&section).await.unwrap();
}

async fn seed_train(
    state: &AppState,
    id: TrainId,
    kind: TrainKind,
    priority: u8,
    load: u32,
    route: Vec<SectionId>,
) {
    let mut train = Train::new(id, format!("T{id}"), kind, priority);
    train.max_speed_kmh = 60.0;
    train.current_load = load;
    train.route = route;
    state.store.upsert_train(&train).await.unwrap();
}

async fn wait_for_execution(state: &AppState, decision_id: u64) -> Decision {
    for _ in 0..60 {
        if let Some(decision) = state.store.get_decision(decision_id).await.unwrap() {
            if decision.executed {
                return decision;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("decision {decision_id} never executed");
}

/// S1: two trains converging on a single-capacity track section.
#[tokio::test(flavor = "multi_thread")]
async fn head_on_conflict_detected_and_resolved() {
    let fx = TestEngine::start().await;
    let state = &fx.state;

    seed_section(state, 5, SectionKind::Track, 2_000.0, 1).await;
    seed_section(state, 6, SectionKind::Track, 2_500.0, 1).await;
    seed_section(state, 7, SectionKind::Track, 3_000.0, 1).await;
    seed_train(state, 101, TrainKind::Express, 8, 600, vec![7]).await;
    seed_train(state, 102, TrainKind::Local, 5, 500, vec![7]).await;

    let subscriber = state.hub.register([Subscription::Section(7)].into()).await;

    let t0 = Utc::now();
    state
        .pipeline
        .report_position(PositionReport::new(101, 5, t0, 60.0))
        .await
        .unwrap();
    state
        .pipeline
        .report_position(PositionReport::new(102, 6, t0, 60.0))
        .await
        .unwrap();

    let delta = state.scheduler.run_detection_once().await.unwrap();
    let conflict = delta
        .new_conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::CollisionRisk)
        .expect("collision risk expected");
    assert_eq!(conflict.trains_involved, vec![101, 102]);
    assert_eq!(conflict.sections_involved, vec![7]);
    assert!(conflict.severity_score >= 7);
    assert!(conflict.severity >= ConflictSeverity::High);
    let tti = (conflict.expected_impact_time.unwrap() - t0).num_seconds();
    assert!((100..=170).contains(&tti), "time to impact {tti}s");

    // Suggested way out: hold the lower-priority train at least the safety
    // buffer plus the predicted overlap.
    let suggestion = &conflict.suggestions[0];
    assert_eq!(suggestion.actions[0].train_id, 102);
    match suggestion.actions[0].parameters {
        DecisionParameters::Delay { delay_minutes } => assert!(delay_minutes >= 2),
        _ => panic!("expected a delay suggestion"),
    }

    // Controller accepts; the deferred executor resolves the conflict.
    let ack = state
        .decision_engine
        .resolve_conflict(
            &supervisor(),
            ResolveRequest {
                conflict_id: conflict.id,
                action: ResolveAction::Accept,
                rationale: "accept recommended hold of the local".into(),
                modifications: None,
                target_train_id: None,
                ai_solution_id: None,
            },
        )
        .await
        .unwrap();
    let decision = wait_for_execution(state, ack.decision_id).await;
    assert!(decision.executed);
    assert!(decision.execution_time.unwrap() >= decision.timestamp);

    let resolved = state.store.get_conflict(conflict.id).await.unwrap().unwrap();
    assert!(resolved.resolution_time.is_some());
    assert_eq!(resolved.resolved_by.as_deref(), Some("CTR001"));

    // The stream saw the lifecycle: detected (+ alert) ... resolved.
    let mut kinds = Vec::new();
    for _ in 0..8 {
        match tokio::time::timeout(Duration::from_millis(500), subscriber.next_event()).await {
            Ok(Some(event)) => kinds.push(event.kind_name().to_string()),
            _ => break,
        }
    }
    let detected = kinds.iter().position(|k| k == "ConflictDetected");
    let resolved_at = kinds.iter().position(|k| k == "ConflictResolved");
    assert!(detected.is_some(), "events: {kinds:?}");
    assert!(resolved_at.is_some(), "events: {kinds:?}");
    assert!(detected.unwrap() < resolved_at.unwrap());

    fx.stop().await;
}

/// S2: a freight sitting on single track ahead of an express.
#[tokio::test(flavor = "multi_thread")]
async fn freight_blocking_express_is_a_priority_conflict() {
    let fx = TestEngine::start().await;
    let state = &fx.state;

    seed_section(state, 11, SectionKind::Track, 1_000.0, 1).await;
    seed_section(state, 12, SectionKind::Track, 6_000.0, 1).await;
    seed_train(state, 201, TrainKind::Freight, 3, 0, vec![]).await;
    seed_train(state, 202, TrainKind::Express, 9, 800, vec![12]).await;

    let t0 = Utc::now();
    state
        .pipeline
        .report_position(PositionReport::new(201, 12, t0 - chrono::Duration::seconds(60), 40.0))
        .await
        .unwrap();
    state
        .pipeline
        .report_position(PositionReport::new(202, 11, t0, 60.0))
        .await
        .unwrap();

    let delta = state.scheduler.run_detection_once().await.unwrap();
    let conflict = delta
        .new_conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::PriorityConflict)
        .expect("priority conflict expected");
    assert_eq!(conflict.trains_involved, vec![201, 202]);
    assert_eq!(conflict.sections_involved, vec![12]);
    assert!(conflict.severity_score >= 6);
    // The freight is the one asked to make way.
    assert_eq!(conflict.suggestions[0].actions[0].train_id, 201);

    fx.stop().await;
}

/// S3: four trains timed into a two-slot junction inside one window.
#[tokio::test(flavor = "multi_thread")]
async fn junction_congestion_flags_all_four_trains() {
    let fx = TestEngine::start().await;
    let state = &fx.state;

    seed_section(state, 9, SectionKind::Junction, 500.0, 2).await;
    let feeders = [(21u32, 1_000.0f32), (22, 1_250.0), (23, 1_500.0), (24, 1_750.0)];
    for (id, length) in feeders {
        seed_section(state, id, SectionKind::Track, length, 1).await;
    }
    let t0 = Utc::now();
    for (i, (feeder, _)) in feeders.iter().enumerate() {
        let train_id = 301 + i as u32;
        seed_train(state, train_id, TrainKind::Local, 5, 400, vec![9]).await;
        state
            .pipeline
            .report_position(PositionReport::new(train_id, *feeder, t0, 60.0))
            .await
            .unwrap();
    }

    let delta = state.scheduler.run_detection_once().await.unwrap();
    let conflict = delta
        .new_conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::JunctionConflict)
        .expect("junction conflict expected");
    assert_eq!(conflict.trains_involved, vec![301, 302, 303, 304]);
    assert_eq!(conflict.sections_involved, vec![9]);
    assert!((7..=9).contains(&conflict.severity_score));
    // Two fit, two are sequenced behind by priority then arrival.
    assert_eq!(conflict.suggestions[0].actions.len(), 2);

    fx.stop().await;
}

/// S4: a burst of resolve calls over the critical budget.
#[tokio::test(flavor = "multi_thread")]
async fn resolve_burst_is_rate_limited_at_ten() {
    let fx = TestEngine::start().await;
    let state = &fx.state;
    let supervisor = supervisor();

    let conflict = state
        .store
        .insert_conflict(Conflict {
            id: 0,
            kind: ConflictKind::SectionOverload,
            severity: ConflictSeverity::Medium,
            severity_score: 5,
            trains_involved: vec![101],
            sections_involved: vec![7],
            detection_time: Utc::now(),
            expected_impact_time: Some(Utc::now()),
            description: "two locals on single track".into(),
            suggestions: Vec::new(),
            resolution_time: None,
            resolved_by: None,
            auto_resolved: false,
            ai: None,
        })
        .await
        .unwrap();

    let mut accepted = 0;
    let mut limited = 0;
    let mut retry_hint = 0;
    for _ in 0..12 {
        match state
            .decision_engine
            .resolve_conflict(
                &supervisor,
                ResolveRequest {
                    conflict_id: conflict.id,
                    action: ResolveAction::Reject,
                    rationale: "rejected during triage sweep".into(),
                    modifications: None,
                    target_train_id: None,
                    ai_solution_id: None,
                },
            )
            .await
        {
            Ok(_) => accepted += 1,
            Err(EngineError::RateLimited { retry_after_secs }) => {
                limited += 1;
                retry_hint = retry_after_secs;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 10);
    assert_eq!(limited, 2);
    assert!(retry_hint >= 1 && retry_hint <= 60);

    fx.stop().await;
}

/// S5: an older report for a train never rewinds its position.
#[tokio::test(flavor = "multi_thread")]
async fn stale_report_is_rejected_without_side_effects() {
    let fx = TestEngine::start().await;
    let state = &fx.state;

    seed_section(state, 7, SectionKind::Track, 3_000.0, 1).await;
    seed_section(state, 8, SectionKind::Track, 3_000.0, 1).await;
    seed_train(state, 301, TrainKind::Local, 5, 300, vec![]).await;

    let accepted_at = Utc::now();
    state
        .pipeline
        .report_position(PositionReport::new(301, 7, accepted_at, 50.0))
        .await
        .unwrap();

    let err = state
        .pipeline
        .report_position(PositionReport::new(
            301,
            8,
            accepted_at - chrono::Duration::seconds(30),
            50.0,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Stale { .. }));

    let current = state.pipeline.current_position(301).await.unwrap();
    assert_eq!(current.section_id, 7);
    assert_eq!(current.timestamp, accepted_at);
    assert_eq!(state.pipeline.trains_in_section(8).await.len(), 0);

    fx.stop().await;
}

/// S6: emergency commands need MANAGER; a refused command leaves no trace.
#[tokio::test(flavor = "multi_thread")]
async fn emergency_without_authority_leaves_no_trace() {
    let fx = TestEngine::start().await;
    let state = &fx.state;

    seed_section(state, 7, SectionKind::Track, 3_000.0, 1).await;
    seed_train(state, 101, TrainKind::Express, 8, 500, vec![]).await;
    state
        .pipeline
        .report_position(PositionReport::new(101, 7, Utc::now(), 60.0))
        .await
        .unwrap();

    let subscriber = state.hub.register([Subscription::Train(101)].into()).await;
    // Drain the position events before the refused command.
    while tokio::time::timeout(Duration::from_millis(200), subscriber.next_event())
        .await
        .is_ok()
    {}

    let err = state
        .decision_engine
        .control_train(
            &supervisor(),
            railway_conflict_engine::decision::ControlRequest {
                train_id: 101,
                parameters: DecisionParameters::EmergencyStop {},
                reason: "obstruction reported ahead".into(),
                emergency: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    // No decision row...
    let (rows, total) = state
        .store
        .query_decisions(&railway_conflict_engine::storage::DecisionFilter::default(), 0, 10)
        .await
        .unwrap();
    assert_eq!((rows.len(), total), (0, 0));
    // ...and no event reached the stream.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), subscriber.next_event())
            .await
            .is_err()
    );

    fx.stop().await;
}
