//! Atomic claim semantics under concurrency.
//!
//! Run with: DATABASE_URL=postgresql://... cargo test --test claim_integration

mod common;

use railyard::engine::claim::claim_next;
use railyard::models::CarStatus;

#[tokio::test]
async fn claim_stamps_status_assignee_and_timestamp() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let engine = fixture.agent("eng");

    let car = fixture.create_car(&track, "solo", 1).await;
    let claimed = claim_next(&fixture.pool, &track, &engine)
        .await
        .unwrap()
        .expect("one ready car must be claimable");

    assert_eq!(claimed.id, car.id);
    assert_eq!(claimed.status, CarStatus::Claimed);
    assert_eq!(claimed.assignee, engine);
    assert!(claimed.claimed_at.is_some());

    // And it left the ready set.
    assert!(fixture.ready_ids(&track).await.is_empty());
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    fixture.create_car(&track, "contested", 1).await;

    let mut claims = Vec::new();
    for i in 0..3 {
        let pool = fixture.pool.clone();
        let track = track.clone();
        let engine = fixture.agent(&format!("eng{i}"));
        claims.push(tokio::spawn(async move {
            claim_next(&pool, &track, &engine).await.unwrap()
        }));
    }

    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one engine may win the claim race");
}

#[tokio::test]
async fn claim_respects_track_and_priority() {
    let fixture = require_db!();
    let backend = fixture.track("backend");
    let frontend = fixture.track("frontend");

    fixture.create_car(&backend, "urgent backend", 0).await;
    fixture.create_car(&backend, "later backend", 3).await;
    fixture.create_car(&frontend, "frontend work", 0).await;

    let claimed = claim_next(&fixture.pool, &backend, &fixture.agent("eng"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.title, "urgent backend");
    assert_eq!(claimed.track, backend);
}

#[tokio::test]
async fn blocked_cars_are_never_claimed() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 0).await;
    let b = fixture.create_car(&track, "B", 2).await;
    cars.add_dep(&a.id, &b.id).await.unwrap();

    // A is more urgent but blocked; B must win.
    let claimed = claim_next(&fixture.pool, &track, &fixture.agent("eng"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, b.id);

    // Nothing else is claimable now.
    let second = claim_next(&fixture.pool, &track, &fixture.agent("eng2"))
        .await
        .unwrap();
    assert!(second.is_none());
}
