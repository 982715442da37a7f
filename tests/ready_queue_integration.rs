//! Ready-set and dependency semantics against a real store.
//!
//! Run with: DATABASE_URL=postgresql://... cargo test --test ready_queue_integration

mod common;

use railyard::cars::CarPatch;
use railyard::error::RailyardError;
use railyard::models::CarStatus;

#[tokio::test]
async fn chain_progression_releases_cars_in_order() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 2).await;
    let b = fixture.create_car(&track, "B", 2).await;
    let c = fixture.create_car(&track, "C", 2).await;

    // A blocks B; B blocks C.
    cars.add_dep(&b.id, &a.id).await.unwrap();
    cars.add_dep(&c.id, &b.id).await.unwrap();

    assert_eq!(fixture.ready_ids(&track).await, vec![a.id.clone()]);

    fixture.drive_to_done(&a.id, &fixture.agent("e1")).await;
    assert_eq!(fixture.ready_ids(&track).await, vec![b.id.clone()]);

    fixture.drive_to_done(&b.id, &fixture.agent("e1")).await;
    cars.set_status(&b.id, CarStatus::Merged).await.unwrap();
    assert_eq!(fixture.ready_ids(&track).await, vec![c.id.clone()]);
}

#[tokio::test]
async fn priority_orders_the_ready_set() {
    let fixture = require_db!();
    let track = fixture.track("backend");

    let low = fixture.create_car(&track, "L", 3).await;
    let high = fixture.create_car(&track, "H", 0).await;

    assert_eq!(fixture.ready_ids(&track).await, vec![high.id, low.id]);
}

#[tokio::test]
async fn cancelled_blocker_satisfies_the_dependency() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 2).await;
    let b = fixture.create_car(&track, "B", 2).await;
    cars.add_dep(&a.id, &b.id).await.unwrap();

    assert_eq!(fixture.ready_ids(&track).await, vec![b.id.clone()]);

    cars.set_status(&b.id, CarStatus::Cancelled).await.unwrap();
    assert_eq!(fixture.ready_ids(&track).await, vec![a.id]);
}

#[tokio::test]
async fn one_resolved_blocker_of_two_is_not_enough() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 2).await;
    let b = fixture.create_car(&track, "B", 2).await;
    let c = fixture.create_car(&track, "C", 2).await;
    cars.add_dep(&a.id, &b.id).await.unwrap();
    cars.add_dep(&a.id, &c.id).await.unwrap();

    fixture.drive_to_done(&b.id, &fixture.agent("e1")).await;

    let ready = fixture.ready_ids(&track).await;
    assert!(!ready.contains(&a.id), "A still has an open blocker");
    assert!(ready.contains(&c.id));
}

#[tokio::test]
async fn cycle_introduction_is_rejected_without_side_effects() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 2).await;
    let b = fixture.create_car(&track, "B", 2).await;
    let c = fixture.create_car(&track, "C", 2).await;

    cars.add_dep(&b.id, &a.id).await.unwrap();
    cars.add_dep(&c.id, &b.id).await.unwrap();

    let err = cars.add_dep(&a.id, &c.id).await.unwrap_err();
    assert!(matches!(err, RailyardError::DependencyCycle { .. }));

    // Nothing was committed.
    let (blockers, _) = cars.list_deps(&a.id).await.unwrap();
    assert!(blockers.is_empty());
}

#[tokio::test]
async fn self_dependency_is_rejected() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 2).await;
    let err = cars.add_dep(&a.id, &a.id).await.unwrap_err();
    assert!(err.to_string().contains("itself"));
}

#[tokio::test]
async fn rejected_transition_changes_nothing() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 2).await;
    let before = cars.fetch(&a.id).await.unwrap();

    let err = cars.set_status(&a.id, CarStatus::Done).await.unwrap_err();
    assert!(matches!(err, RailyardError::Transition { .. }));

    let after = cars.fetch(&a.id).await.unwrap();
    assert_eq!(after.status, CarStatus::Open);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.assignee, before.assignee);
}

#[tokio::test]
async fn readiness_is_monotonic_once_blockers_resolve() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let a = fixture.create_car(&track, "A", 2).await;
    let b = fixture.create_car(&track, "B", 2).await;
    cars.add_dep(&a.id, &b.id).await.unwrap();

    fixture.drive_to_done(&b.id, &fixture.agent("e1")).await;
    assert!(fixture.ready_ids(&track).await.contains(&a.id));

    // Unrelated updates to the blocker never unset readiness.
    cars.update(
        &b.id,
        CarPatch {
            description: Some("retrospective notes".into()),
            ..CarPatch::default()
        },
    )
    .await
    .unwrap();
    assert!(fixture.ready_ids(&track).await.contains(&a.id));

    cars.set_status(&b.id, CarStatus::Merged).await.unwrap();
    assert!(fixture.ready_ids(&track).await.contains(&a.id));
}

#[tokio::test]
async fn create_validates_title_track_and_parent() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let err = cars
        .create(railyard::cars::CreateCar {
            title: "  ".into(),
            track: Some(track.clone()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("title"));

    let err = cars
        .create(railyard::cars::CreateCar {
            title: "orphan".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("track"));

    // Parent must be an epic; a task parent is rejected.
    let task = fixture.create_car(&track, "plain task", 2).await;
    let err = cars
        .create(railyard::cars::CreateCar {
            title: "child".into(),
            parent_id: Some(task.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("epic"));
}

#[tokio::test]
async fn children_inherit_track_from_their_epic() {
    let fixture = require_db!();
    let track = fixture.track("backend");
    let cars = fixture.cars();

    let epic = cars
        .create(railyard::cars::CreateCar {
            title: "payments epic".into(),
            track: Some(track.clone()),
            car_type: Some(railyard::models::CarType::Epic),
            ..Default::default()
        })
        .await
        .unwrap();

    let child = cars
        .create(railyard::cars::CreateCar {
            title: "wire transfers".into(),
            parent_id: Some(epic.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(child.track, track);
    assert_eq!(child.branch, format!("yard/{}/{}", track, child.id));

    let children = cars.children(&epic.id).await.unwrap();
    assert_eq!(children.len(), 1);

    let summary = cars.children_summary(&epic.id).await.unwrap();
    assert_eq!(summary.get("open"), Some(&1));
}
