//! Car service: CRUD, status transitions, dependencies, and the ready set.
//!
//! Everything the work queue knows about a car lives here. The `ready`
//! predicate is computed at query time: a car is ready when it is
//! unassigned, its status is open (or recovered to ready), and every
//! blocker has reached the resolved set {done, merged, cancelled}.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{RailyardError, Result};
use crate::ids;
use crate::models::{Car, CarDep, CarProgress, CarStatus, CarType};

pub mod graph;
pub mod transitions;

/// Shared WHERE fragment for the ready predicate, with `cars` aliased `c`.
/// The claim transaction embeds the same fragment so that `ready()` and
/// claiming can never disagree about eligibility.
pub const READY_CONDITION: &str = "c.status IN ('open','ready') \
     AND c.assignee = '' \
     AND NOT EXISTS (\
         SELECT 1 FROM car_deps d \
         JOIN cars b ON b.id = d.blocked_by \
         WHERE d.car_id = c.id \
           AND b.status NOT IN ('done','merged','cancelled')\
     )";

/// Fields accepted by [`CarService::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateCar {
    pub title: String,
    pub description: String,
    pub car_type: Option<CarType>,
    pub priority: Option<i32>,
    /// Inherited from the parent epic when empty.
    pub track: Option<String>,
    pub parent_id: Option<String>,
    pub base_branch: Option<String>,
    pub design_notes: String,
    pub acceptance: String,
}

/// Partial update applied by [`CarService::update`].
#[derive(Debug, Clone, Default)]
pub struct CarPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<CarStatus>,
    pub priority: Option<i32>,
    pub assignee: Option<String>,
    pub design_notes: Option<String>,
    pub acceptance: Option<String>,
}

impl CarPatch {
    pub fn status(status: CarStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Filter for [`CarService::list`]; every field is optional and they
/// compose conjunctively.
#[derive(Debug, Clone, Default)]
pub struct CarFilter {
    pub track: Option<String>,
    pub status: Option<CarStatus>,
    pub car_type: Option<CarType>,
    pub assignee: Option<String>,
    pub parent_id: Option<String>,
}

/// A car with its dependency edges and progress trail eager-loaded.
#[derive(Debug, Clone)]
pub struct CarDetail {
    pub car: Car,
    /// Edges where this car is blocked (outgoing `blocks` edges).
    pub blockers: Vec<CarDep>,
    /// Edges where this car blocks others.
    pub dependents: Vec<CarDep>,
    pub progress: Vec<CarProgress>,
}

#[derive(Clone)]
pub struct CarService {
    pool: PgPool,
    branch_prefix: String,
}

impl CarService {
    pub fn new(pool: PgPool, branch_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            branch_prefix: branch_prefix.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------------
    // Create / read
    // ------------------------------------------------------------------------

    pub async fn create(&self, req: CreateCar) -> Result<Car> {
        if req.title.trim().is_empty() {
            return Err(RailyardError::validation("car title must not be empty"));
        }

        let parent = match req.parent_id.as_deref() {
            Some(parent_id) => {
                let parent = self.fetch(parent_id).await?;
                if parent.car_type != CarType::Epic {
                    return Err(RailyardError::Validation(format!(
                        "parent {} has type {}, only epics can have children",
                        parent.id, parent.car_type
                    )));
                }
                Some(parent)
            }
            None => None,
        };

        let track = match req.track.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(track) => track.to_string(),
            None => match &parent {
                Some(parent) => parent.track.clone(),
                None => {
                    return Err(RailyardError::validation(
                        "track is required when no parent epic is given",
                    ))
                }
            },
        };

        let car_type = req.car_type.unwrap_or(CarType::Task);
        let priority = req.priority.unwrap_or(2);
        let base_branch = req
            .base_branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "main".to_string());

        // Two retries on id collision, then give up.
        let mut last_id = String::new();
        for _attempt in 0..3 {
            let id = ids::car_id();
            let branch = format!("{}/{}/{}", self.branch_prefix, track, id);
            let inserted = sqlx::query_as::<_, Car>(
                r#"
                INSERT INTO cars
                    (id, title, description, car_type, status, priority, track,
                     assignee, parent_id, branch, base_branch, design_notes, acceptance)
                VALUES ($1, $2, $3, $4, 'open', $5, $6, '', $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(&id)
            .bind(req.title.trim())
            .bind(&req.description)
            .bind(car_type.as_str())
            .bind(priority)
            .bind(&track)
            .bind(&req.parent_id)
            .bind(&branch)
            .bind(&base_branch)
            .bind(&req.design_notes)
            .bind(&req.acceptance)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(car) = inserted {
                info!(car = %car.id, track = %car.track, "created car");
                return Ok(car);
            }
            debug!(id = %id, "car id collision, retrying");
            last_id = id;
        }

        Err(RailyardError::Internal(format!(
            "car id generation collided three times (last: {last_id})"
        )))
    }

    /// Fetch the bare row.
    pub async fn fetch(&self, id: &str) -> Result<Car> {
        sqlx::query_as::<_, Car>("SELECT * FROM cars WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RailyardError::not_found("car", id))
    }

    /// Fetch a car with deps and progress eager-loaded.
    pub async fn get(&self, id: &str) -> Result<CarDetail> {
        let car = self.fetch(id).await?;
        let (blockers, dependents) = self.list_deps(id).await?;
        let progress = self.progress(id).await?;
        Ok(CarDetail {
            car,
            blockers,
            dependents,
            progress,
        })
    }

    pub async fn list(&self, filter: &CarFilter) -> Result<Vec<Car>> {
        let cars = sqlx::query_as::<_, Car>(
            r#"
            SELECT * FROM cars
            WHERE ($1::varchar IS NULL OR track = $1)
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::varchar IS NULL OR car_type = $3)
              AND ($4::varchar IS NULL OR assignee = $4)
              AND ($5::varchar IS NULL OR parent_id = $5)
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(filter.track.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.car_type.map(|t| t.as_str()))
        .bind(filter.assignee.as_deref())
        .bind(filter.parent_id.as_deref())
        .fetch_all(&self.pool)
        .await?;
        Ok(cars)
    }

    pub async fn children(&self, parent: &str) -> Result<Vec<Car>> {
        self.list(&CarFilter {
            parent_id: Some(parent.to_string()),
            ..CarFilter::default()
        })
        .await
    }

    /// Status histogram over a parent epic's children.
    pub async fn children_summary(&self, parent: &str) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM cars WHERE parent_id = $1 GROUP BY status",
        )
        .bind(parent)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    // ------------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------------

    /// Apply a partial update. A patch containing `status` is validated
    /// against the transition table; on rejection nothing changes.
    pub async fn update(&self, id: &str, patch: CarPatch) -> Result<Car> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Car>("SELECT * FROM cars WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RailyardError::not_found("car", id))?;

        let status = match patch.status {
            Some(to) => {
                transitions::validate(id, current.status, to)?;
                to
            }
            None => current.status,
        };

        let assignee = patch.assignee.unwrap_or_else(|| current.assignee.clone());
        if status.requires_assignee() && assignee.is_empty() {
            return Err(RailyardError::Validation(format!(
                "car {id} cannot be {status} without an assignee"
            )));
        }

        let now = Utc::now();
        let claimed_at = if status == CarStatus::Claimed && patch.status.is_some() {
            Some(now)
        } else {
            current.claimed_at
        };
        let completed_at = if matches!(status, CarStatus::Done | CarStatus::Merged)
            && patch.status.is_some()
        {
            Some(now)
        } else {
            current.completed_at
        };

        let updated = sqlx::query_as::<_, Car>(
            r#"
            UPDATE cars
            SET title = $2, description = $3, status = $4, priority = $5,
                assignee = $6, design_notes = $7, acceptance = $8,
                claimed_at = $9, completed_at = $10, updated_at = $11
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.title.as_deref().unwrap_or(&current.title))
        .bind(patch.description.as_deref().unwrap_or(&current.description))
        .bind(status.as_str())
        .bind(patch.priority.unwrap_or(current.priority))
        .bind(&assignee)
        .bind(patch.design_notes.as_deref().unwrap_or(&current.design_notes))
        .bind(patch.acceptance.as_deref().unwrap_or(&current.acceptance))
        .bind(claimed_at)
        .bind(completed_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(to) = patch.status {
            info!(car = %id, from = %current.status, to = %to, "car status changed");
        }
        Ok(updated)
    }

    /// Convenience wrapper for a status-only patch.
    pub async fn set_status(&self, id: &str, to: CarStatus) -> Result<Car> {
        self.update(id, CarPatch::status(to)).await
    }

    // ------------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------------

    /// Add a `blocks` edge: `car` cannot become ready until `blocked_by`
    /// resolves. Refuses self-edges, unknown cars, and cycles.
    pub async fn add_dep(&self, car: &str, blocked_by: &str) -> Result<()> {
        if car == blocked_by {
            return Err(RailyardError::Validation(format!(
                "car {car} cannot block itself"
            )));
        }
        self.fetch(car).await?;
        self.fetch(blocked_by).await?;

        let mut tx = self.pool.begin().await?;

        // Cycle check over edges between active cars only; a cancelled car
        // no longer participates in the graph.
        let edges: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT d.car_id, d.blocked_by FROM car_deps d
            JOIN cars a ON a.id = d.car_id AND a.status <> 'cancelled'
            JOIN cars b ON b.id = d.blocked_by AND b.status <> 'cancelled'
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        if graph::would_create_cycle(&edges, car, blocked_by) {
            return Err(RailyardError::DependencyCycle {
                car: car.to_string(),
                blocked_by: blocked_by.to_string(),
            });
        }

        sqlx::query(
            "INSERT INTO car_deps (car_id, blocked_by, kind) VALUES ($1, $2, 'blocks')
             ON CONFLICT (car_id, blocked_by) DO NOTHING",
        )
        .bind(car)
        .bind(blocked_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(car = %car, blocked_by = %blocked_by, "added dependency");
        Ok(())
    }

    pub async fn remove_dep(&self, car: &str, blocked_by: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM car_deps WHERE car_id = $1 AND blocked_by = $2")
            .bind(car)
            .bind(blocked_by)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RailyardError::not_found(
                "dependency",
                format!("{car} -> {blocked_by}"),
            ));
        }
        Ok(())
    }

    /// Edges in both directions: what blocks this car, and what it blocks.
    pub async fn list_deps(&self, car: &str) -> Result<(Vec<CarDep>, Vec<CarDep>)> {
        let blockers = sqlx::query_as::<_, CarDep>(
            "SELECT * FROM car_deps WHERE car_id = $1 ORDER BY created_at",
        )
        .bind(car)
        .fetch_all(&self.pool)
        .await?;
        let dependents = sqlx::query_as::<_, CarDep>(
            "SELECT * FROM car_deps WHERE blocked_by = $1 ORDER BY created_at",
        )
        .bind(car)
        .fetch_all(&self.pool)
        .await?;
        Ok((blockers, dependents))
    }

    // ------------------------------------------------------------------------
    // Ready set
    // ------------------------------------------------------------------------

    /// Every car currently eligible to be claimed, most urgent first.
    pub async fn ready(&self, track: Option<&str>) -> Result<Vec<Car>> {
        let sql = format!(
            "SELECT c.* FROM cars c \
             WHERE {READY_CONDITION} AND ($1::varchar IS NULL OR c.track = $1) \
             ORDER BY c.priority ASC, c.created_at ASC"
        );
        let cars = sqlx::query_as::<_, Car>(&sql)
            .bind(track)
            .fetch_all(&self.pool)
            .await?;
        Ok(cars)
    }

    // ------------------------------------------------------------------------
    // Progress trail
    // ------------------------------------------------------------------------

    pub async fn add_progress(
        &self,
        car_id: &str,
        engine_id: &str,
        session_id: &str,
        cycle: i32,
        note: &str,
        files_changed: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO car_progress (car_id, engine_id, session_id, cycle, note, files_changed)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(car_id)
        .bind(engine_id)
        .bind(session_id)
        .bind(cycle)
        .bind(note)
        .bind(files_changed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Progress notes, newest first.
    pub async fn progress(&self, car_id: &str) -> Result<Vec<CarProgress>> {
        let notes = sqlx::query_as::<_, CarProgress>(
            "SELECT * FROM car_progress WHERE car_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(car_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(notes)
    }

    /// Highest cycle recorded for a car, 0 when none.
    pub async fn last_cycle(&self, car_id: &str) -> Result<i32> {
        let (cycle,): (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(cycle), 0) FROM car_progress WHERE car_id = $1")
                .bind(car_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(cycle)
    }
}
