//! Shared fixture for store-backed integration tests.
//!
//! Tests connect to the database named by `DATABASE_URL` and isolate
//! themselves with a unique suffix per run (tracks and agent ids carry
//! the suffix, so concurrent runs and leftovers never collide). Without
//! `DATABASE_URL` every test skips.

// Not every test binary uses every helper.
#![allow(dead_code)]

use railyard::cars::{CarPatch, CarService, CreateCar};
use railyard::messaging::MessageService;
use railyard::models::{Car, CarStatus};
use railyard::store::{DatabaseConfig, DatabaseManager};
use sqlx::PgPool;
use uuid::Uuid;

pub struct TestFixture {
    pub pool: PgPool,
    pub suffix: String,
}

impl TestFixture {
    /// Returns `None` (and the caller skips) when no database is
    /// configured.
    pub async fn connect() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let db = DatabaseManager::new(DatabaseConfig::with_url(url))
            .await
            .expect("failed to connect to test database");
        db.migrate().await.expect("failed to migrate test database");
        let suffix = Uuid::new_v4().to_string()[..8].to_string();
        Some(Self {
            pool: db.pool().clone(),
            suffix,
        })
    }

    pub fn track(&self, base: &str) -> String {
        format!("{base}-{}", self.suffix)
    }

    pub fn agent(&self, base: &str) -> String {
        format!("{base}-{}", self.suffix)
    }

    pub fn cars(&self) -> CarService {
        CarService::new(self.pool.clone(), "yard")
    }

    pub fn messages(&self) -> MessageService {
        MessageService::new(self.pool.clone())
    }

    pub async fn create_car(&self, track: &str, title: &str, priority: i32) -> Car {
        self.cars()
            .create(CreateCar {
                title: title.to_string(),
                track: Some(track.to_string()),
                priority: Some(priority),
                ..CreateCar::default()
            })
            .await
            .expect("create car")
    }

    /// Walk a car through the full happy path up to `done`, honoring the
    /// transition table.
    pub async fn drive_to_done(&self, car_id: &str, engine: &str) {
        let cars = self.cars();
        cars.set_status(car_id, CarStatus::Ready).await.expect("open -> ready");
        cars.update(
            car_id,
            CarPatch {
                status: Some(CarStatus::Claimed),
                assignee: Some(engine.to_string()),
                ..CarPatch::default()
            },
        )
        .await
        .expect("ready -> claimed");
        cars.set_status(car_id, CarStatus::InProgress)
            .await
            .expect("claimed -> in_progress");
        cars.set_status(car_id, CarStatus::Done)
            .await
            .expect("in_progress -> done");
    }

    pub async fn ready_ids(&self, track: &str) -> Vec<String> {
        self.cars()
            .ready(Some(track))
            .await
            .expect("ready query")
            .into_iter()
            .map(|c| c.id)
            .collect()
    }
}

/// Skip boilerplate: bind the fixture or return early.
#[macro_export]
macro_rules! require_db {
    () => {
        match common::TestFixture::connect().await {
            Some(fixture) => fixture,
            None => {
                eprintln!("skipping: DATABASE_URL not set");
                return;
            }
        }
    };
}
