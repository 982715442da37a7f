//! Persisted entity types.
//!
//! Status enums round-trip to the store as text: `as_str()` on writes,
//! `TryFrom<String>` (via `#[sqlx(try_from = "String")]`) on reads. All
//! queries are runtime-checked `sqlx::query` / `query_as` because the
//! tables are created by migrations that may not exist at compile time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// The literal recipient meaning "every agent, until each acknowledges".
pub const BROADCAST: &str = "broadcast";

// ============================================================================
// Car
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarType {
    Task,
    Epic,
    Feature,
    Bug,
    Spike,
}

impl CarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Spike => "spike",
        }
    }
}

impl std::fmt::Display for CarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for CarType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "task" => Ok(Self::Task),
            "epic" => Ok(Self::Epic),
            "feature" => Ok(Self::Feature),
            "bug" => Ok(Self::Bug),
            "spike" => Ok(Self::Spike),
            _ => Err(format!("unknown car type: {s}")),
        }
    }
}

impl std::str::FromStr for CarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarStatus {
    Open,
    Ready,
    Claimed,
    InProgress,
    Done,
    Cancelled,
    Blocked,
    Merged,
    #[serde(rename = "merge-failed")]
    MergeFailed,
}

impl CarStatus {
    pub const ALL: [CarStatus; 9] = [
        Self::Open,
        Self::Ready,
        Self::Claimed,
        Self::InProgress,
        Self::Done,
        Self::Cancelled,
        Self::Blocked,
        Self::Merged,
        Self::MergeFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
            Self::Merged => "merged",
            Self::MergeFailed => "merge-failed",
        }
    }

    /// A blocker in this status no longer blocks its dependents.
    pub fn resolves_blockers(&self) -> bool {
        matches!(self, Self::Done | Self::Merged | Self::Cancelled)
    }

    /// Statuses that require a non-empty assignee.
    pub fn requires_assignee(&self) -> bool {
        matches!(self, Self::Claimed | Self::InProgress | Self::MergeFailed)
    }
}

impl std::fmt::Display for CarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for CarStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "open" => Ok(Self::Open),
            "ready" => Ok(Self::Ready),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            "blocked" => Ok(Self::Blocked),
            "merged" => Ok(Self::Merged),
            "merge-failed" => Ok(Self::MergeFailed),
            _ => Err(format!("unknown car status: {s}")),
        }
    }
}

impl std::str::FromStr for CarStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

/// One unit of work, executed by exactly one engine at a time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Car {
    pub id: String,
    pub title: String,
    pub description: String,
    #[sqlx(try_from = "String")]
    pub car_type: CarType,
    #[sqlx(try_from = "String")]
    pub status: CarStatus,
    pub priority: i32,
    pub track: String,
    /// Engine id, or empty when unassigned.
    pub assignee: String,
    pub parent_id: Option<String>,
    pub branch: String,
    pub base_branch: String,
    pub design_notes: String,
    pub acceptance: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Directed "blocks" edge: `car_id` cannot become ready until `blocked_by`
/// resolves (done, merged, or cancelled).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CarDep {
    pub car_id: String,
    pub blocked_by: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only note trail per car.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CarProgress {
    pub id: i64,
    pub car_id: String,
    pub engine_id: String,
    pub session_id: String,
    pub cycle: i32,
    pub note: String,
    pub files_changed: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Track
// ============================================================================

/// A named bucket of cars sharing a language, conventions, and engine
/// capacity. Engine capacity is configuration, not queue state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Track {
    pub name: String,
    pub language: String,
    pub conventions: Json<HashMap<String, String>>,
    pub system_prompt: String,
    pub file_patterns: Json<Vec<String>>,
    pub engine_slots: i32,
    pub active: bool,
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineRole {
    Engine,
    Supervisor,
    Dispatch,
}

impl EngineRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Supervisor => "supervisor",
            Self::Dispatch => "dispatch",
        }
    }
}

impl std::fmt::Display for EngineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for EngineRole {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "engine" => Ok(Self::Engine),
            "supervisor" => Ok(Self::Supervisor),
            "dispatch" => Ok(Self::Dispatch),
            _ => Err(format!("unknown engine role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Idle,
    Working,
    Stalled,
    Dead,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Stalled => "stalled",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for EngineStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "stalled" => Ok(Self::Stalled),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("unknown engine status: {s}")),
        }
    }
}

/// A long-lived process that claims and executes cars on one track.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Engine {
    pub id: String,
    pub track: String,
    #[sqlx(try_from = "String")]
    pub role: EngineRole,
    #[sqlx(try_from = "String")]
    pub status: EngineStatus,
    /// Car id, or empty when not holding work.
    pub current_car: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Sort rank: lower sorts first.
    pub fn rank(&self) -> i32 {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for MessagePriority {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown message priority: {s}")),
        }
    }
}

impl std::str::FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

/// Durable point-to-point or broadcast message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub subject: String,
    pub body: String,
    pub car_id: Option<String>,
    pub thread_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub priority: MessagePriority,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.to_agent == BROADCAST
    }
}

// ============================================================================
// AgentLog
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    In,
    Out,
}

impl LogDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl TryFrom<String> for LogDirection {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            _ => Err(format!("unknown log direction: {s}")),
        }
    }
}

/// Per-session capture of agent traffic.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentLog {
    pub id: i64,
    pub engine_id: String,
    pub session_id: String,
    pub car_id: String,
    #[sqlx(try_from = "String")]
    pub direction: LogDirection,
    pub content: String,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub token_count: Option<i32>,
    pub model: String,
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ReindexJob
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl ReindexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<String> for ReindexStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown reindex status: {s}")),
        }
    }
}

/// Post-merge reindex request. The core only enqueues; consumption is an
/// external indexer's job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReindexJob {
    pub id: String,
    pub track: String,
    pub trigger_commit: String,
    #[sqlx(try_from = "String")]
    pub status: ReindexStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
