//! Orchestrator lifecycle against the in-memory multiplexer.
//!
//! Run with: DATABASE_URL=postgresql://... cargo test --test orchestrator_integration

mod common;

use std::sync::Arc;

use railyard::adapters::{FakeMultiplexer, Multiplexer};
use railyard::config::{RailyardConfig, TimingConfig, TrackConfig};
use railyard::orchestrator::Orchestrator;
use railyard::RailyardError;

// `stop` marks every non-dead engine dead; tests that touch engine rows
// take turns.
static YARD_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn track(name: &str, slots: i32) -> TrackConfig {
    TrackConfig {
        name: name.to_string(),
        language: String::new(),
        conventions: Default::default(),
        file_patterns: Vec::new(),
        engine_slots: slots,
        system_prompt: String::new(),
        test_command: None,
    }
}

fn config(session: &str, tracks: Vec<TrackConfig>) -> RailyardConfig {
    RailyardConfig {
        owner: "yard".into(),
        repository: "/srv/unused".into(),
        branch_prefix: Some("yard".into()),
        database_url: None,
        session_name: session.to_string(),
        agent_command: vec!["true".into()],
        tracks,
        stall: Default::default(),
        timing: TimingConfig {
            drain_timeout_secs: 1,
            ..TimingConfig::default()
        },
    }
}

#[tokio::test]
async fn start_lays_out_supervisor_and_engines() {
    let _turn = YARD_LOCK.lock().await;
    let fixture = require_db!();
    let session = format!("yard-{}", fixture.suffix);
    let backend = fixture.track("backend");
    let frontend = fixture.track("frontend");
    let mux = Arc::new(FakeMultiplexer::default());

    let orchestrator = Orchestrator::new(
        config(&session, vec![track(&backend, 2), track(&frontend, 1)]),
        "/etc/railyard.yaml",
        fixture.pool.clone(),
        mux.clone(),
    );

    let report = orchestrator.start(3).await.unwrap();
    assert_eq!(report.engines.len(), 3);
    let total: usize = report.assignment.iter().map(|(_, c)| c).sum();
    assert_eq!(total, 3);

    let commands = mux.pane_commands(&session);
    assert_eq!(commands.len(), 4, "supervisor pane plus three engines");
    assert!(commands.iter().any(|c| c.contains("supervisor")));
    assert_eq!(
        commands.iter().filter(|c| c.contains("engine --track")).count(),
        3
    );

    // Starting again is a session-state error.
    let again = orchestrator.start(3).await;
    assert!(matches!(again, Err(RailyardError::SessionRunning)));
    assert_eq!(again.unwrap_err().exit_code(), 4);

    orchestrator.stop().await.unwrap();
    assert!(!mux.has_session(&session));
}

#[tokio::test]
async fn stop_without_a_session_is_rejected() {
    let fixture = require_db!();
    let session = format!("yard-{}", fixture.suffix);
    let orchestrator = Orchestrator::new(
        config(&session, vec![track(&fixture.track("backend"), 1)]),
        "/etc/railyard.yaml",
        fixture.pool.clone(),
        Arc::new(FakeMultiplexer::default()),
    );
    let err = orchestrator.stop().await.unwrap_err();
    assert!(matches!(err, RailyardError::SessionNotRunning));
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn scale_caps_growth_and_drains_newest_on_shrink() {
    let _turn = YARD_LOCK.lock().await;
    let fixture = require_db!();
    let session = format!("yard-{}", fixture.suffix);
    let backend = fixture.track("backend");
    let mux = Arc::new(FakeMultiplexer::default());

    let orchestrator = Orchestrator::new(
        config(&session, vec![track(&backend, 2)]),
        "/etc/railyard.yaml",
        fixture.pool.clone(),
        mux.clone(),
    );
    mux.create_session(&session).await.unwrap();

    // Growth past engine_slots is capped.
    let grown = orchestrator.scale(&backend, 5).await.unwrap();
    assert_eq!(grown.target, 2);
    assert_eq!(grown.spawned.len(), 2);

    // Shrink drains exactly one engine, the newest first.
    let shrunk = orchestrator.scale(&backend, 1).await.unwrap();
    assert_eq!(shrunk.draining.len(), 1);
    let drained = &shrunk.draining[0];
    assert_eq!(drained, grown.spawned.last().unwrap());

    let inbox = fixture.messages().inbox(drained).await.unwrap();
    assert!(inbox.iter().any(|m| m.subject == "drain"));

    // Unknown tracks are a validation error.
    let unknown = orchestrator.scale("no-such-track", 1).await;
    assert!(matches!(unknown, Err(RailyardError::Validation(_))));
}

#[tokio::test]
async fn restart_replaces_an_engine_on_its_track() {
    let _turn = YARD_LOCK.lock().await;
    let fixture = require_db!();
    let session = format!("yard-{}", fixture.suffix);
    let backend = fixture.track("backend");
    let mux = Arc::new(FakeMultiplexer::default());

    let orchestrator = Orchestrator::new(
        config(&session, vec![track(&backend, 3)]),
        "/etc/railyard.yaml",
        fixture.pool.clone(),
        mux.clone(),
    );
    mux.create_session(&session).await.unwrap();

    let grown = orchestrator.scale(&backend, 1).await.unwrap();
    let original = grown.spawned[0].clone();

    let replacement = orchestrator.restart(&original).await.unwrap();
    assert_ne!(replacement, original);

    let (status,): (String,) = sqlx::query_as("SELECT status FROM engines WHERE id = $1")
        .bind(&original)
        .fetch_one(&fixture.pool)
        .await
        .unwrap();
    assert_eq!(status, "dead");

    let (track_name,): (String,) = sqlx::query_as("SELECT track FROM engines WHERE id = $1")
        .bind(&replacement)
        .fetch_one(&fixture.pool)
        .await
        .unwrap();
    assert_eq!(track_name, backend);

    let missing = orchestrator.restart("eng-zzzzz").await;
    assert!(matches!(missing, Err(RailyardError::NotFound { .. })));
}

#[tokio::test]
async fn status_aggregates_cars_engines_and_queue() {
    let fixture = require_db!();
    let session = format!("yard-{}", fixture.suffix);
    let backend = fixture.track("backend");
    let cars = fixture.cars();

    let orchestrator = Orchestrator::new(
        config(&session, vec![track(&backend, 2)]),
        "/etc/railyard.yaml",
        fixture.pool.clone(),
        Arc::new(FakeMultiplexer::default()),
    );

    let free = fixture.create_car(&backend, "free", 1).await;
    let gated = fixture.create_car(&backend, "gated", 2).await;
    let blocker = fixture.create_car(&backend, "blocker", 2).await;
    cars.add_dep(&gated.id, &blocker.id).await.unwrap();
    fixture.drive_to_done(&free.id, &fixture.agent("e1")).await;

    let report = orchestrator.status().await.unwrap();
    let track_status = report
        .tracks
        .iter()
        .find(|t| t.track == backend)
        .expect("configured track appears in status");

    // gated + blocker are open; gated is not ready, blocker is.
    assert_eq!(track_status.open, 2);
    assert_eq!(track_status.ready, 1);
    assert_eq!(track_status.done, 1);
    assert_eq!(track_status.in_progress, 0);
    assert!(report.queue_depth >= 0);
}
