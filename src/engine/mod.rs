//! Engine runtime: claim → context render → spawn → monitor → outcome.
//!
//! An engine owns one slot on one track. Each loop iteration drains its
//! inbox, claims the most urgent ready car, and runs agent cycles against
//! it until the car completes, the agent stalls, or control traffic takes
//! the car away. A heartbeat task keeps `last_activity` fresh while the
//! subprocess runs; the supervisor treats a silent heartbeat as death.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::GitOps;
use crate::cars::{CarPatch, CarService};
use crate::config::{RailyardConfig, TrackConfig};
use crate::error::{ErrorKind, Result};
use crate::messaging::{MessageService, SendMessage};
use crate::models::{Car, CarStatus, EngineStatus, LogDirection, MessagePriority};
use crate::SUPERVISOR_ID;

pub mod claim;
pub mod context;
pub mod launcher;
pub mod logs;
pub mod stall;

use launcher::{AgentEvent, AgentHandle, AgentLauncher};
use logs::{AgentLogStore, LogEntry, TokenCounts};
use stall::{StallReason, StallTracker};

/// Lines of transcript tail kept for stall escalation.
const TRANSCRIPT_TAIL: usize = 50;

/// Attempts for a branch push before surfacing the failure.
const PUSH_ATTEMPTS: u32 = 3;

/// Control effect of one inbox message, classified by subject prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Abort,
    SwitchTrack(String),
    Pause,
    Resume,
    Guidance(String),
    Drain,
    Other,
}

/// Classify a message by its subject prefix. The switch-track target may
/// arrive in the body or after the prefix in the subject itself.
pub fn classify(subject: &str, body: &str) -> Control {
    let lowered = subject.trim().to_ascii_lowercase();
    if lowered.starts_with("abort") {
        Control::Abort
    } else if lowered.starts_with("switch-track") {
        let target = body.trim();
        let target = if target.is_empty() {
            subject.trim()[12..].trim_start_matches([':', ' ']).trim()
        } else {
            target
        };
        Control::SwitchTrack(target.to_string())
    } else if lowered.starts_with("pause") {
        Control::Pause
    } else if lowered.starts_with("resume") {
        Control::Resume
    } else if lowered.starts_with("guidance") {
        Control::Guidance(body.to_string())
    } else if lowered.starts_with("drain") {
        Control::Drain
    } else {
        Control::Other
    }
}

/// How one car's work ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkOutcome {
    Completed,
    Released,
    Stalled,
}

struct MonitorResult {
    stall: Option<StallReason>,
    transcript: Vec<String>,
}

pub struct EngineRuntime {
    id: String,
    track: TrackConfig,
    config: RailyardConfig,
    pool: PgPool,
    cars: CarService,
    messages: MessageService,
    logs: AgentLogStore,
    git: Arc<dyn GitOps>,
    launcher: Arc<dyn AgentLauncher>,
    shutdown: watch::Receiver<bool>,
    paused: bool,
    draining: bool,
    halted: bool,
    guidance: Vec<String>,
}

impl EngineRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        track: TrackConfig,
        config: RailyardConfig,
        pool: PgPool,
        git: Arc<dyn GitOps>,
        launcher: Arc<dyn AgentLauncher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let cars = CarService::new(pool.clone(), config.branch_prefix());
        let messages = MessageService::new(pool.clone());
        let logs = AgentLogStore::new(pool.clone());
        Self {
            id: id.into(),
            track,
            config,
            pool,
            cars,
            messages,
            logs,
            git,
            launcher,
            shutdown,
            paused: false,
            draining: false,
            halted: false,
            guidance: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main loop; returns when shut down, drained, or stall-halted.
    pub async fn run(mut self) -> Result<()> {
        self.register().await?;
        info!(engine = %self.id, track = %self.track.name, "engine started");

        loop {
            if *self.shutdown.borrow() || self.draining || self.halted {
                break;
            }
            if let Err(e) = self.step().await {
                match e.kind() {
                    ErrorKind::Concurrency => continue,
                    ErrorKind::Transient => {
                        warn!(engine = %self.id, "transient error, backing off: {e}");
                        self.idle_sleep().await;
                    }
                    _ => {
                        error!(engine = %self.id, "engine step failed: {e}");
                        self.idle_sleep().await;
                    }
                }
            }
        }

        self.mark_dead().await?;
        info!(engine = %self.id, "engine stopped");
        Ok(())
    }

    async fn step(&mut self) -> Result<()> {
        self.drain_inbox(None).await?;
        if self.draining || self.paused {
            if self.paused && !self.draining {
                self.idle_sleep().await;
            }
            return Ok(());
        }

        // A merge-failed car keeps its assignee; resuming it takes
        // precedence over claiming new work.
        if let Some(car) = self.assigned_merge_failed().await? {
            let car = self.cars.set_status(&car.id, CarStatus::InProgress).await?;
            self.work_car(car).await?;
            return Ok(());
        }

        match claim::claim_next(&self.pool, &self.track.name, &self.id).await? {
            Some(car) => {
                self.work_car(car).await?;
            }
            None => self.idle_sleep().await,
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------------

    /// Drain and acknowledge control traffic. Supervisor notifications that
    /// are not control messages stay unacknowledged: the next context
    /// render injects them and acknowledges them there. Returns true when
    /// the current car was released.
    async fn drain_inbox(&mut self, current: Option<&Car>) -> Result<bool> {
        let inbox = self.messages.inbox(&self.id).await?;
        let mut released = false;

        for message in inbox {
            let mut ack = true;
            match classify(&message.subject, &message.body) {
                Control::Abort => {
                    if let Some(car) = current {
                        if !released {
                            info!(engine = %self.id, car = %car.id, "abort: releasing car");
                            self.release_car(car, CarStatus::Blocked).await?;
                            released = true;
                        }
                    }
                }
                Control::SwitchTrack(target) => {
                    match self.config.track(&target) {
                        Some(track) => {
                            info!(engine = %self.id, from = %self.track.name, to = %target, "switching track");
                            if let Some(car) = current {
                                if !released {
                                    self.release_car(car, CarStatus::Blocked).await?;
                                    self.cars.set_status(&car.id, CarStatus::Open).await?;
                                    released = true;
                                }
                            }
                            self.track = track.clone();
                            sqlx::query("UPDATE engines SET track = $2, last_activity = now() WHERE id = $1")
                                .bind(&self.id)
                                .bind(&self.track.name)
                                .execute(&self.pool)
                                .await?;
                        }
                        None => {
                            warn!(engine = %self.id, track = %target, "switch-track to unknown track ignored");
                        }
                    }
                }
                Control::Pause => {
                    self.paused = true;
                    info!(engine = %self.id, "paused; current work continues, no new claims");
                }
                Control::Resume => {
                    self.paused = false;
                    info!(engine = %self.id, "resumed");
                }
                Control::Guidance(body) => {
                    self.guidance.push(body);
                }
                Control::Drain => {
                    self.draining = true;
                    info!(engine = %self.id, "draining; will exit after current work");
                }
                Control::Other => {
                    if message.from_agent == SUPERVISOR_ID {
                        ack = false;
                    } else {
                        debug!(engine = %self.id, subject = %message.subject, "ignoring message");
                    }
                }
            }
            if ack {
                self.messages.ack(&message.id, &self.id).await?;
            }
        }
        Ok(released)
    }

    /// Hand a held car back to the queue and go idle.
    async fn release_car(&self, car: &Car, to: CarStatus) -> Result<()> {
        self.cars
            .update(
                &car.id,
                CarPatch {
                    status: Some(to),
                    assignee: Some(String::new()),
                    ..CarPatch::default()
                },
            )
            .await?;
        self.set_engine(EngineStatus::Idle, "", "").await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Work loop
    // ------------------------------------------------------------------------

    async fn work_car(&mut self, mut car: Car) -> Result<WorkOutcome> {
        let mut cycle = self.cars.last_cycle(&car.id).await? + 1;

        loop {
            if cycle > self.config.stall.max_cycles as i32 {
                let reason = StallReason::CycleCeiling(self.config.stall.max_cycles);
                self.escalate_stall(&car, reason, "", &[]).await?;
                return Ok(WorkOutcome::Stalled);
            }

            if self.drain_inbox(Some(&car)).await? {
                return Ok(WorkOutcome::Released);
            }

            // First cycle moves the car out of claimed; later cycles find it
            // already in progress. Anything else means another actor took
            // the car away while we slept.
            let fresh = self.cars.fetch(&car.id).await?;
            car = match fresh.status {
                CarStatus::Claimed => self.cars.set_status(&car.id, CarStatus::InProgress).await?,
                CarStatus::InProgress => fresh,
                _ => {
                    info!(engine = %self.id, car = %car.id, status = %fresh.status, "car changed externally, releasing");
                    self.set_engine(EngineStatus::Idle, "", "").await?;
                    return Ok(WorkOutcome::Released);
                }
            };

            let session_id = Uuid::new_v4().to_string();
            self.set_engine(EngineStatus::Working, &car.id, &session_id).await?;

            let prompt = self.render_context(&car, cycle).await?;
            self.logs
                .append(LogEntry {
                    engine_id: &self.id,
                    session_id: &session_id,
                    car_id: &car.id,
                    direction: LogDirection::In,
                    content: &prompt,
                    tokens: TokenCounts::default(),
                    latency_ms: None,
                })
                .await?;

            info!(engine = %self.id, car = %car.id, cycle, "spawning agent");
            let handle = self.launcher.launch(&prompt).await?;
            let heartbeat = self.spawn_heartbeat();
            let monitored = self.monitor(handle, &car, &session_id).await;
            heartbeat.abort();
            let monitored = monitored?;

            if let Some(reason) = monitored.stall {
                self.escalate_stall(&car, reason, &session_id, &monitored.transcript)
                    .await?;
                return Ok(WorkOutcome::Stalled);
            }

            let fresh = self.cars.fetch(&car.id).await?;
            match fresh.status {
                CarStatus::Done => {
                    self.push_branch(&car).await?;
                    let files = self.files_changed(&car).await;
                    self.cars
                        .add_progress(&car.id, &self.id, &session_id, cycle, "cycle complete: car done", &files)
                        .await?;
                    self.set_engine(EngineStatus::Idle, "", "").await?;
                    info!(engine = %self.id, car = %car.id, "car completed");
                    return Ok(WorkOutcome::Completed);
                }
                CarStatus::InProgress | CarStatus::Claimed => {
                    // Context exhaustion or explicit mid-task exit: keep the
                    // claim and go around with a fresh session.
                    let files = self.files_changed(&car).await;
                    self.cars
                        .add_progress(
                            &car.id,
                            &self.id,
                            &session_id,
                            cycle,
                            "agent exited mid-task, continuing",
                            &files,
                        )
                        .await?;
                    cycle += 1;
                    if *self.shutdown.borrow() {
                        // Claim retained; the supervisor will reassign.
                        return Ok(WorkOutcome::Released);
                    }
                }
                other => {
                    info!(engine = %self.id, car = %car.id, status = %other, "car resolved externally");
                    self.set_engine(EngineStatus::Idle, "", "").await?;
                    return Ok(WorkOutcome::Released);
                }
            }
        }
    }

    async fn render_context(&mut self, car: &Car, cycle: i32) -> Result<String> {
        let progress = self.cars.progress(&car.id).await?;
        let inbox = self.messages.inbox(&self.id).await?;
        let supervisor_messages: Vec<_> = inbox
            .into_iter()
            .filter(|m| m.from_agent == SUPERVISOR_ID)
            .collect();
        let commits = match self.git.log(&car.branch, self.config.timing.branch_log_limit).await {
            Ok(commits) => commits,
            Err(e) => {
                debug!(branch = %car.branch, "no branch history yet: {e}");
                Vec::new()
            }
        };
        let guidance = std::mem::take(&mut self.guidance);

        let prompt = context::render(&context::ContextInput {
            owner: &self.config.owner,
            branch_prefix: &self.config.branch_prefix(),
            track: &self.track,
            car,
            progress: &progress,
            messages: &supervisor_messages,
            commits: &commits,
            guidance: &guidance,
            cycle,
        });

        for message in &supervisor_messages {
            self.messages.ack(&message.id, &self.id).await?;
        }
        Ok(prompt)
    }

    /// Pump the event stream until exit, stall, or shutdown.
    async fn monitor(
        &mut self,
        mut handle: AgentHandle,
        car: &Car,
        session_id: &str,
    ) -> Result<MonitorResult> {
        let started = Instant::now();
        let mut shutdown = self.shutdown.clone();
        let mut tracker = StallTracker::new(
            self.config.stall.stdout_timeout(),
            self.config.stall.max_repeated_errors,
        );
        let mut transcript: Vec<String> = Vec::new();

        loop {
            let deadline = tokio::time::Instant::from_std(tracker.silence_deadline());
            tokio::select! {
                event = handle.events.recv() => {
                    match event {
                        Some(AgentEvent::Stdout(line)) => {
                            tracker.note_output();
                            push_tail(&mut transcript, &line);
                            self.log_output(car, session_id, &line, started).await;
                        }
                        Some(AgentEvent::Stderr(line)) => {
                            push_tail(&mut transcript, &line);
                            self.log_output(car, session_id, &line, started).await;
                            if let Some(reason) = tracker.note_error(&line) {
                                handle.kill();
                                drain_until_exit(&mut handle).await;
                                return Ok(MonitorResult { stall: Some(reason), transcript });
                            }
                        }
                        Some(AgentEvent::Exited(code)) => {
                            debug!(engine = %self.id, car = %car.id, ?code, "agent exited");
                            return Ok(MonitorResult { stall: None, transcript });
                        }
                        None => {
                            return Ok(MonitorResult { stall: None, transcript });
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    handle.kill();
                    drain_until_exit(&mut handle).await;
                    let reason = StallReason::Silence(tracker.silence_window());
                    return Ok(MonitorResult { stall: Some(reason), transcript });
                }
                _ = shutdown.changed() => {
                    info!(engine = %self.id, car = %car.id, "shutdown: waiting out grace window");
                    let grace = self.config.timing.shutdown_grace();
                    let finished = tokio::time::timeout(grace, drain_until_exit(&mut handle)).await;
                    if finished.is_err() {
                        handle.kill();
                        drain_until_exit(&mut handle).await;
                    }
                    return Ok(MonitorResult { stall: None, transcript });
                }
            }
        }
    }

    async fn log_output(&self, car: &Car, session_id: &str, line: &str, started: Instant) {
        let entry = LogEntry {
            engine_id: &self.id,
            session_id,
            car_id: &car.id,
            direction: LogDirection::Out,
            content: line,
            tokens: logs::parse_token_counts(line),
            latency_ms: Some(started.elapsed().as_millis() as i64),
        };
        if let Err(e) = self.logs.append(entry).await {
            warn!(engine = %self.id, "failed to append agent log: {e}");
        }
    }

    async fn push_branch(&self, car: &Car) -> Result<()> {
        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=PUSH_ATTEMPTS {
            match self.git.push(&car.branch).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PUSH_ATTEMPTS => {
                    warn!(branch = %car.branch, attempt, "push failed, retrying: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("push loop always returns");
    }

    async fn files_changed(&self, car: &Car) -> String {
        match self.git.diff_name_only(&car.base_branch).await {
            Ok(files) => files.join(","),
            Err(_) => String::new(),
        }
    }

    async fn escalate_stall(
        &mut self,
        car: &Car,
        reason: StallReason,
        session_id: &str,
        transcript: &[String],
    ) -> Result<()> {
        warn!(engine = %self.id, car = %car.id, %reason, "stall detected, escalating");
        self.set_engine(EngineStatus::Stalled, "", "").await?;
        self.cars.set_status(&car.id, CarStatus::Blocked).await?;
        self.cars
            .add_progress(&car.id, &self.id, session_id, 0, &format!("stalled: {reason}"), "")
            .await?;
        self.messages
            .send(SendMessage {
                from_agent: self.id.clone(),
                to_agent: SUPERVISOR_ID.to_string(),
                subject: format!("stall: {}", car.id),
                body: format!(
                    "engine {} stalled on {}: {}\n\ntranscript tail:\n{}",
                    self.id,
                    car.id,
                    reason,
                    transcript.join("\n"),
                ),
                car_id: Some(car.id.clone()),
                thread_id: None,
                priority: MessagePriority::Urgent,
            })
            .await?;
        self.halted = true;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Engine row
    // ------------------------------------------------------------------------

    async fn register(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO engines (id, track, role, status, current_car, session_id, started_at, last_activity)
            VALUES ($1, $2, 'engine', 'idle', '', '', $3, $3)
            ON CONFLICT (id) DO UPDATE
            SET track = EXCLUDED.track, role = 'engine', status = 'idle',
                current_car = '', session_id = '', started_at = EXCLUDED.started_at,
                last_activity = EXCLUDED.last_activity
            "#,
        )
        .bind(&self.id)
        .bind(&self.track.name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_engine(&self, status: EngineStatus, current_car: &str, session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE engines SET status = $2, current_car = $3, session_id = $4, last_activity = now()
             WHERE id = $1",
        )
        .bind(&self.id)
        .bind(status.as_str())
        .bind(current_car)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self) -> Result<()> {
        self.set_engine(EngineStatus::Dead, "", "").await
    }

    async fn assigned_merge_failed(&self) -> Result<Option<Car>> {
        let car = sqlx::query_as::<_, Car>(
            "SELECT * FROM cars WHERE assignee = $1 AND status = 'merge-failed'
             ORDER BY updated_at ASC LIMIT 1",
        )
        .bind(&self.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(car)
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let id = self.id.clone();
        let every = self.config.timing.heartbeat();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let _ = sqlx::query("UPDATE engines SET last_activity = now() WHERE id = $1")
                    .bind(&id)
                    .execute(&pool)
                    .await;
            }
        })
    }

    async fn idle_sleep(&mut self) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.config.timing.idle_poll()) => {}
            _ = shutdown.changed() => {}
        }
    }
}

fn push_tail(transcript: &mut Vec<String>, line: &str) {
    if transcript.len() == TRANSCRIPT_TAIL {
        transcript.remove(0);
    }
    transcript.push(line.to_string());
}

async fn drain_until_exit(handle: &mut AgentHandle) {
    while let Some(event) = handle.events.recv().await {
        if matches!(event, AgentEvent::Exited(_)) {
            break;
        }
    }
}
