//! Orchestrator: fleet lifecycle and status aggregation.
//!
//! Composes the multiplexer and the store: `start` lays out one pane per
//! agent process, `stop` drains and tears down, `scale` adjusts one
//! track, `status` aggregates the whole yard.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::adapters::Multiplexer;
use crate::cars::CarService;
use crate::config::RailyardConfig;
use crate::error::{RailyardError, Result};
use crate::messaging::{MessageService, SendMessage};
use crate::models::{Engine, MessagePriority, BROADCAST};
use crate::{ids, ORCHESTRATOR_ID};

pub mod assign;

use assign::TrackShare;

/// How often the stop-drain wait polls for working engines.
const DRAIN_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub session: String,
    pub assignment: Vec<(String, usize)>,
    pub engines: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleReport {
    pub track: String,
    pub live: usize,
    pub target: usize,
    pub spawned: Vec<String>,
    pub draining: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackStatus {
    pub track: String,
    pub open: i64,
    pub ready: i64,
    pub in_progress: i64,
    pub done: i64,
    pub blocked: i64,
    pub merge_failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub engines: Vec<Engine>,
    pub tracks: Vec<TrackStatus>,
    pub queue_depth: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

pub struct Orchestrator {
    config: RailyardConfig,
    config_path: PathBuf,
    pool: PgPool,
    mux: Arc<dyn Multiplexer>,
    cars: CarService,
    messages: MessageService,
}

impl Orchestrator {
    pub fn new(
        config: RailyardConfig,
        config_path: impl Into<PathBuf>,
        pool: PgPool,
        mux: Arc<dyn Multiplexer>,
    ) -> Self {
        let cars = CarService::new(pool.clone(), config.branch_prefix());
        let messages = MessageService::new(pool.clone());
        Self {
            config,
            config_path: config_path.into(),
            pool,
            mux,
            cars,
            messages,
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create the session and launch the supervisor plus `engines` engine
    /// processes with tracks assigned proportionally to their slots.
    pub async fn start(&self, engines: usize) -> Result<StartReport> {
        let session = self.config.session_name.clone();
        if self.mux.session_exists(&session).await? {
            return Err(RailyardError::SessionRunning);
        }

        self.sync_tracks().await?;
        self.mux.create_session(&session).await?;

        self.mux
            .new_pane(&session, &self.supervisor_command())
            .await?;

        let shares: Vec<TrackShare> = self
            .config
            .tracks
            .iter()
            .map(|t| TrackShare {
                name: t.name.clone(),
                slots: t.engine_slots.max(0) as u32,
            })
            .collect();
        let assignment = assign::assign_tracks(&shares, engines);

        let mut engine_ids = Vec::new();
        for (track, count) in &assignment {
            for _ in 0..*count {
                let id = ids::engine_id();
                self.preregister_engine(&id, track).await?;
                self.mux
                    .new_pane(&session, &self.engine_command(track, &id))
                    .await?;
                engine_ids.push(id);
            }
        }

        self.mux.tile_layout(&session).await?;
        info!(session = %session, engines = engine_ids.len(), "yard started");
        Ok(StartReport {
            session,
            assignment,
            engines: engine_ids,
        })
    }

    /// Broadcast drain, wait (bounded) for working engines to finish,
    /// signal whatever is left, and tear the session down.
    pub async fn stop(&self) -> Result<()> {
        let session = &self.config.session_name;
        if !self.mux.session_exists(session).await? {
            return Err(RailyardError::SessionNotRunning);
        }

        self.messages
            .send(SendMessage {
                from_agent: ORCHESTRATOR_ID.to_string(),
                to_agent: BROADCAST.to_string(),
                subject: "drain".to_string(),
                body: "yard is stopping".to_string(),
                car_id: None,
                thread_id: None,
                priority: MessagePriority::Urgent,
            })
            .await?;

        // Bounded wait for working engines; expiry moves on to teardown.
        let deadline = Instant::now() + self.config.timing.drain_timeout();
        loop {
            let (working,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM engines WHERE status = 'working'")
                    .fetch_one(&self.pool)
                    .await?;
            if working == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(working, "drain deadline expired, proceeding with teardown");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        for pane in self.mux.list_panes(session).await? {
            if let Err(e) = self.mux.send_signal(&pane, "INT").await {
                warn!(pane = %pane, "signal failed: {e}");
            }
        }
        self.mux.kill_session(session).await?;

        sqlx::query("UPDATE engines SET status = 'dead', current_car = '' WHERE status <> 'dead'")
            .execute(&self.pool)
            .await?;
        info!(session = %session, "yard stopped");
        Ok(())
    }

    /// Grow or shrink one track. Growth is capped by the track's
    /// `engine_slots`; shrink drains the newest engines first.
    pub async fn scale(&self, track: &str, target: usize) -> Result<ScaleReport> {
        let track_config = self
            .config
            .track(track)
            .ok_or_else(|| RailyardError::Validation(format!("unknown track: {track}")))?;

        let live = sqlx::query_as::<_, Engine>(
            "SELECT * FROM engines
             WHERE track = $1 AND role = 'engine' AND status <> 'dead'
             ORDER BY started_at ASC",
        )
        .bind(track)
        .fetch_all(&self.pool)
        .await?;

        let cap = track_config.engine_slots.max(0) as usize;
        let desired = target.min(cap);
        if desired < target {
            warn!(track = %track, target, cap, "scale target capped by engine_slots");
        }

        let mut report = ScaleReport {
            track: track.to_string(),
            live: live.len(),
            target: desired,
            spawned: Vec::new(),
            draining: Vec::new(),
        };

        if desired > live.len() {
            let session = &self.config.session_name;
            if !self.mux.session_exists(session).await? {
                return Err(RailyardError::SessionNotRunning);
            }
            for _ in live.len()..desired {
                let id = ids::engine_id();
                self.preregister_engine(&id, track).await?;
                self.mux
                    .new_pane(session, &self.engine_command(track, &id))
                    .await?;
                report.spawned.push(id);
            }
            self.mux.tile_layout(session).await?;
        } else if desired < live.len() {
            // Newest engines go first.
            for engine in live.iter().rev().take(live.len() - desired) {
                self.messages
                    .send(SendMessage {
                        from_agent: ORCHESTRATOR_ID.to_string(),
                        to_agent: engine.id.clone(),
                        subject: "drain".to_string(),
                        body: format!("track {track} scaled down"),
                        car_id: None,
                        thread_id: None,
                        priority: MessagePriority::High,
                    })
                    .await?;
                report.draining.push(engine.id.clone());
            }
        }

        info!(track = %track, live = report.live, target = desired, "scaled track");
        Ok(report)
    }

    /// Mark an engine dead and spawn a replacement on the same track.
    pub async fn restart(&self, engine_id: &str) -> Result<String> {
        let engine = sqlx::query_as::<_, Engine>("SELECT * FROM engines WHERE id = $1")
            .bind(engine_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RailyardError::not_found("engine", engine_id))?;

        sqlx::query("UPDATE engines SET status = 'dead', current_car = '' WHERE id = $1")
            .bind(engine_id)
            .execute(&self.pool)
            .await?;

        let session = &self.config.session_name;
        if !self.mux.session_exists(session).await? {
            return Err(RailyardError::SessionNotRunning);
        }
        let id = ids::engine_id();
        self.preregister_engine(&id, &engine.track).await?;
        self.mux
            .new_pane(session, &self.engine_command(&engine.track, &id))
            .await?;
        info!(old = %engine_id, new = %id, track = %engine.track, "engine restarted");
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub async fn status(&self) -> Result<StatusReport> {
        let engines = sqlx::query_as::<_, Engine>(
            "SELECT * FROM engines ORDER BY role DESC, track ASC, started_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let counts: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT track, status, COUNT(*) FROM cars GROUP BY track, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tracks: Vec<TrackStatus> = Vec::new();
        for track_config in &self.config.tracks {
            let mut status = TrackStatus {
                track: track_config.name.clone(),
                open: 0,
                ready: 0,
                in_progress: 0,
                done: 0,
                blocked: 0,
                merge_failed: 0,
            };
            for (track, state, count) in &counts {
                if track != &track_config.name {
                    continue;
                }
                match state.as_str() {
                    "open" => status.open += count,
                    "in_progress" | "claimed" => status.in_progress += count,
                    "done" => status.done += count,
                    "blocked" => status.blocked += count,
                    "merge-failed" => status.merge_failed += count,
                    _ => {}
                }
            }
            // `ready` is the derived predicate, not a row count.
            status.ready = self.cars.ready(Some(&track_config.name)).await?.len() as i64;
            tracks.push(status);
        }

        let queue_depth = self.messages.queue_depth().await?;
        let (input_tokens, output_tokens): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(input_tokens), 0)::bigint,
                    COALESCE(SUM(output_tokens), 0)::bigint
             FROM agent_logs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatusReport {
            engines,
            tracks,
            queue_depth,
            input_tokens,
            output_tokens,
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Mirror configured tracks into the store.
    pub async fn sync_tracks(&self) -> Result<()> {
        for track in &self.config.tracks {
            sqlx::query(
                r#"
                INSERT INTO tracks (name, language, conventions, system_prompt, file_patterns, engine_slots, active)
                VALUES ($1, $2, $3, $4, $5, $6, TRUE)
                ON CONFLICT (name) DO UPDATE
                SET language = EXCLUDED.language, conventions = EXCLUDED.conventions,
                    system_prompt = EXCLUDED.system_prompt, file_patterns = EXCLUDED.file_patterns,
                    engine_slots = EXCLUDED.engine_slots, active = TRUE
                "#,
            )
            .bind(&track.name)
            .bind(&track.language)
            .bind(Json(&track.conventions))
            .bind(&track.system_prompt)
            .bind(Json(&track.file_patterns))
            .bind(track.engine_slots)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn preregister_engine(&self, id: &str, track: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO engines (id, track, role, status) VALUES ($1, $2, 'engine', 'idle')
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(track)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn supervisor_command(&self) -> String {
        format!(
            "railyard --config {} supervisor",
            self.config_path.display()
        )
    }

    fn engine_command(&self, track: &str, id: &str) -> String {
        format!(
            "railyard --config {} engine --track {} --id {}",
            self.config_path.display(),
            track,
            id
        )
    }
}
