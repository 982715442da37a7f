//! Supervisor: health probe, stall recovery, merge adjudication, and
//! post-merge bookkeeping.
//!
//! Exactly one supervisor runs per system; registration refuses to start
//! while any non-dead supervisor row exists. Each tick, on a fixed
//! cadence: process stall escalations, detect stale engines and reassign
//! their cars, then adjudicate every car sitting in `done` (the "switch"
//! operation: test the branch, merge it into the base branch on success).

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::adapters::{GitOps, TestRunner};
use crate::cars::{CarFilter, CarPatch, CarService};
use crate::config::{default_test_command, RailyardConfig};
use crate::error::{RailyardError, Result};
use crate::messaging::{MessageService, SendMessage};
use crate::models::{Car, CarStatus, Engine, MessagePriority, BROADCAST};
use crate::{ids, SUPERVISOR_ID};

/// Characters of test output forwarded to the assignee on merge failure.
const TEST_OUTPUT_TAIL: usize = 4000;

pub struct Supervisor {
    id: String,
    config: RailyardConfig,
    pool: PgPool,
    cars: CarService,
    messages: MessageService,
    git: Arc<dyn GitOps>,
    tests: Arc<dyn TestRunner>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Register the singleton supervisor. Fails when a live supervisor row
    /// already exists.
    pub async fn register(
        config: RailyardConfig,
        pool: PgPool,
        git: Arc<dyn GitOps>,
        tests: Arc<dyn TestRunner>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM engines WHERE role = 'supervisor' AND status <> 'dead' AND id <> $1 LIMIT 1",
        )
        .bind(SUPERVISOR_ID)
        .fetch_optional(&pool)
        .await?;
        if let Some((id,)) = existing {
            return Err(RailyardError::SupervisorExists(id));
        }

        // Re-registering over our own dead (or stale) row is allowed; a
        // crashed supervisor must be restartable without manual cleanup.
        let live: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM engines WHERE id = $1 AND status <> 'dead'
               AND last_activity > $2 LIMIT 1",
        )
        .bind(SUPERVISOR_ID)
        .bind(Utc::now() - ChronoDuration::seconds(config.timing.stale_after_secs as i64))
        .fetch_optional(&pool)
        .await?;
        if let Some((id,)) = live {
            return Err(RailyardError::SupervisorExists(id));
        }

        sqlx::query(
            r#"
            INSERT INTO engines (id, track, role, status, current_car, session_id, started_at, last_activity)
            VALUES ($1, '', 'supervisor', 'idle', '', '', $2, $2)
            ON CONFLICT (id) DO UPDATE
            SET role = 'supervisor', status = 'idle', current_car = '',
                started_at = EXCLUDED.started_at, last_activity = EXCLUDED.last_activity
            "#,
        )
        .bind(SUPERVISOR_ID)
        .bind(Utc::now())
        .execute(&pool)
        .await?;

        let cars = CarService::new(pool.clone(), config.branch_prefix());
        let messages = MessageService::new(pool.clone());
        Ok(Self {
            id: SUPERVISOR_ID.to_string(),
            config,
            pool,
            cars,
            messages,
            git,
            tests,
            shutdown,
        })
    }

    /// Cadence loop; returns on shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!(supervisor = %self.id, "supervisor started");
        let cadence = self.config.timing.supervisor_cadence();
        let mut interval = tokio::time::interval(cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(supervisor = %self.id, "tick failed: {e}");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        sqlx::query("UPDATE engines SET status = 'dead', current_car = '' WHERE id = $1")
            .bind(&self.id)
            .execute(&self.pool)
            .await?;
        info!(supervisor = %self.id, "supervisor stopped");
        Ok(())
    }

    /// One pass of the state machine. Public so tests can drive it
    /// without the timer.
    pub async fn tick(&self) -> Result<()> {
        self.heartbeat().await?;
        self.process_inbox().await?;
        self.recover_stale_engines().await?;
        self.switch_done_cars().await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        sqlx::query("UPDATE engines SET last_activity = now() WHERE id = $1")
            .bind(&self.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stall escalations
    // ------------------------------------------------------------------------

    /// Handle stall messages from engines: adjudicate the engine dead and
    /// recover the blocked car into the ready set.
    async fn process_inbox(&self) -> Result<()> {
        for message in self.messages.inbox(&self.id).await? {
            if message.subject.starts_with("stall:") {
                let engine_id = message.from_agent.clone();
                warn!(engine = %engine_id, car = ?message.car_id, "stall escalation received");

                sqlx::query(
                    "UPDATE engines SET status = 'dead', current_car = '' WHERE id = $1",
                )
                .bind(&engine_id)
                .execute(&self.pool)
                .await?;

                if let Some(car_id) = &message.car_id {
                    match self.cars.fetch(car_id).await {
                        Ok(car) if car.status == CarStatus::Blocked => {
                            self.cars
                                .update(
                                    car_id,
                                    CarPatch {
                                        status: Some(CarStatus::Open),
                                        assignee: Some(String::new()),
                                        ..CarPatch::default()
                                    },
                                )
                                .await?;
                            info!(car = %car_id, "stalled car recovered to open");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(car = %car_id, "cannot recover stalled car: {e}"),
                    }
                }
            }
            self.messages.ack(&message.id, &self.id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stale engines
    // ------------------------------------------------------------------------

    /// Engines whose heartbeat went quiet are dead; any car they held goes
    /// back through blocked -> open so a fresh engine can claim it.
    async fn recover_stale_engines(&self) -> Result<()> {
        let cutoff =
            Utc::now() - ChronoDuration::seconds(self.config.timing.stale_after_secs as i64);
        let stale = sqlx::query_as::<_, Engine>(
            "SELECT * FROM engines
             WHERE status <> 'dead' AND last_activity < $1 AND id <> $2",
        )
        .bind(cutoff)
        .bind(&self.id)
        .fetch_all(&self.pool)
        .await?;

        for engine in stale {
            warn!(engine = %engine.id, last = %engine.last_activity, "stale engine detected");

            if !engine.current_car.is_empty() {
                if let Err(e) = self.reassign_car(&engine).await {
                    warn!(engine = %engine.id, car = %engine.current_car, "reassign failed: {e}");
                }
            }

            sqlx::query("UPDATE engines SET status = 'dead', current_car = '' WHERE id = $1")
                .bind(&engine.id)
                .execute(&self.pool)
                .await?;

            self.messages
                .send(SendMessage {
                    from_agent: self.id.clone(),
                    to_agent: BROADCAST.to_string(),
                    subject: format!("engine-dead: {}", engine.id),
                    body: format!(
                        "engine {} on track {} went stale (last activity {}); its work was reassigned",
                        engine.id, engine.track, engine.last_activity
                    ),
                    car_id: None,
                    thread_id: None,
                    priority: MessagePriority::High,
                })
                .await?;
        }
        Ok(())
    }

    async fn reassign_car(&self, engine: &Engine) -> Result<()> {
        let car = self.cars.fetch(&engine.current_car).await?;
        if car.status.resolves_blockers() {
            return Ok(());
        }
        if car.status != CarStatus::Blocked {
            self.cars.set_status(&car.id, CarStatus::Blocked).await?;
        }
        self.cars
            .update(
                &car.id,
                CarPatch {
                    status: Some(CarStatus::Open),
                    assignee: Some(String::new()),
                    ..CarPatch::default()
                },
            )
            .await?;
        self.cars
            .add_progress(
                &car.id,
                &self.id,
                "",
                0,
                &format!("reassigned from {}: heartbeat stale", engine.id),
                "",
            )
            .await?;
        info!(car = %car.id, engine = %engine.id, "car reassigned");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Switch (merge adjudication)
    // ------------------------------------------------------------------------

    async fn switch_done_cars(&self) -> Result<()> {
        let done = self
            .cars
            .list(&CarFilter {
                status: Some(CarStatus::Done),
                ..CarFilter::default()
            })
            .await?;

        for car in done {
            let result = self.switch(&car).await;
            // The working copy always comes back to the base branch, even
            // when the switch itself failed.
            if let Err(e) = self.git.checkout(&car.base_branch).await {
                warn!(car = %car.id, "cannot return working copy to {}: {e}", car.base_branch);
            }
            if let Err(e) = result {
                warn!(car = %car.id, "switch failed, will retry next tick: {e}");
            }
        }
        Ok(())
    }

    /// Test the car's branch and merge it on success.
    async fn switch(&self, car: &Car) -> Result<()> {
        info!(car = %car.id, branch = %car.branch, "switching");
        self.git.fetch(&car.branch).await?;
        self.git.checkout(&car.branch).await?;

        let report = match self.test_command_for(&car.track) {
            Some(command) => self.tests.run(&command).await?,
            None => crate::adapters::TestReport::passing(),
        };

        if report.passed {
            self.git.checkout(&car.base_branch).await?;
            self.git
                .merge_no_ff(&car.branch, &format!("Merge {} ({})", car.branch, car.title))
                .await?;
            let commit = self.git.head_commit().await?;
            self.cars.set_status(&car.id, CarStatus::Merged).await?;
            info!(car = %car.id, commit = %commit, "merged");

            self.unblock_dependents(&car.id).await?;
            self.enqueue_reindex(&car.track, &commit).await?;
        } else {
            self.cars.set_status(&car.id, CarStatus::MergeFailed).await?;
            let tail: String = report
                .output
                .chars()
                .rev()
                .take(TEST_OUTPUT_TAIL)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            warn!(car = %car.id, "tests failed, car marked merge-failed");
            if !car.assignee.is_empty() {
                self.messages
                    .send(SendMessage {
                        from_agent: self.id.clone(),
                        to_agent: car.assignee.clone(),
                        subject: format!("merge-failed: {}", car.id),
                        body: format!("tests failed on {}:\n{}", car.branch, tail),
                        car_id: Some(car.id.clone()),
                        thread_id: None,
                        priority: MessagePriority::High,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn test_command_for(&self, track: &str) -> Option<String> {
        let track_config = self.config.track(track)?;
        match &track_config.test_command {
            Some(command) => Some(command.clone()),
            None => default_test_command(&track_config.language).map(str::to_string),
        }
    }

    /// After a merge, any blocked dependent whose blockers are now all
    /// resolved re-enters the queue.
    async fn unblock_dependents(&self, merged_car: &str) -> Result<()> {
        let dependents: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT d.car_id FROM car_deps d
            JOIN cars c ON c.id = d.car_id
            WHERE d.blocked_by = $1
              AND c.status = 'blocked'
              AND NOT EXISTS (
                  SELECT 1 FROM car_deps d2
                  JOIN cars b ON b.id = d2.blocked_by
                  WHERE d2.car_id = d.car_id
                    AND b.status NOT IN ('done','merged','cancelled')
              )
            "#,
        )
        .bind(merged_car)
        .fetch_all(&self.pool)
        .await?;

        for (car_id,) in dependents {
            self.cars.set_status(&car_id, CarStatus::Open).await?;
            info!(car = %car_id, unblocked_by = %merged_car, "cross-track unblock");
        }
        Ok(())
    }

    async fn enqueue_reindex(&self, track: &str, commit: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO reindex_jobs (id, track, trigger_commit, status) VALUES ($1, $2, $3, 'pending')",
        )
        .bind(ids::reindex_id())
        .bind(track)
        .bind(commit)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
