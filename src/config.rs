//! YAML configuration loading and validation.
//!
//! Owner, repository, and at least one track are required; everything else
//! has defaults. Validation failures are fatal configuration errors and
//! surface at process startup, never later.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RailyardError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailyardConfig {
    pub owner: String,
    /// Path to the git working tree the fleet operates on.
    pub repository: String,
    /// Branch namespace; derived from `owner` when omitted.
    #[serde(default)]
    pub branch_prefix: Option<String>,
    /// Store connection URL; falls back to `DATABASE_URL`.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Tmux session name.
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Command line launched for each agent cycle; the rendered prompt is
    /// written to its stdin.
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
    pub tracks: Vec<TrackConfig>,
    #[serde(default)]
    pub stall: StallConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub conventions: HashMap<String, String>,
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default = "default_engine_slots")]
    pub engine_slots: i32,
    #[serde(default)]
    pub system_prompt: String,
    /// Test command run by the supervisor before merging; falls back to a
    /// per-language default when omitted.
    #[serde(default)]
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallConfig {
    /// No stdout/stderr for this long means the agent is wedged.
    #[serde(default = "default_stdout_timeout")]
    pub stdout_timeout_secs: u64,
    /// The same error line repeated more than this many times is a stall.
    #[serde(default = "default_max_repeated_errors")]
    pub max_repeated_errors: u32,
    /// Continue-cycle ceiling per car.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            stdout_timeout_secs: default_stdout_timeout(),
            max_repeated_errors: default_max_repeated_errors(),
            max_cycles: default_max_cycles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Engine sleep between claim attempts when the queue is empty.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_secs: u64,
    /// Engine heartbeat interval while a subprocess runs.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Supervisor tick cadence.
    #[serde(default = "default_supervisor_cadence")]
    pub supervisor_cadence_secs: u64,
    /// Heartbeat age beyond which an engine is considered stale.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Total deadline for the stop-drain wait.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Grace window for the current subprocess during engine shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// How many branch commits the context render includes.
    #[serde(default = "default_branch_log_limit")]
    pub branch_log_limit: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_poll_secs: default_idle_poll(),
            heartbeat_secs: default_heartbeat(),
            supervisor_cadence_secs: default_supervisor_cadence(),
            stale_after_secs: default_stale_after(),
            drain_timeout_secs: default_drain_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            branch_log_limit: default_branch_log_limit(),
        }
    }
}

fn default_session_name() -> String {
    "railyard".to_string()
}

fn default_agent_command() -> Vec<String> {
    vec!["claude".to_string(), "-p".to_string()]
}

fn default_engine_slots() -> i32 {
    1
}

fn default_stdout_timeout() -> u64 {
    300
}

fn default_max_repeated_errors() -> u32 {
    3
}

fn default_max_cycles() -> u32 {
    10
}

fn default_idle_poll() -> u64 {
    5
}

fn default_heartbeat() -> u64 {
    10
}

fn default_supervisor_cadence() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    120
}

fn default_drain_timeout() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    60
}

fn default_branch_log_limit() -> u32 {
    10
}

impl TimingConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn supervisor_cadence(&self) -> Duration {
        Duration::from_secs(self.supervisor_cadence_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl StallConfig {
    pub fn stdout_timeout(&self) -> Duration {
        Duration::from_secs(self.stdout_timeout_secs)
    }
}

impl RailyardConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RailyardError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| RailyardError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(RailyardError::Config("owner must not be empty".into()));
        }
        if self.repository.trim().is_empty() {
            return Err(RailyardError::Config("repository must not be empty".into()));
        }
        if self.tracks.is_empty() {
            return Err(RailyardError::Config(
                "at least one track must be configured".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for track in &self.tracks {
            if track.name.trim().is_empty() {
                return Err(RailyardError::Config("track name must not be empty".into()));
            }
            if !seen.insert(track.name.as_str()) {
                return Err(RailyardError::Config(format!(
                    "duplicate track name: {}",
                    track.name
                )));
            }
            if track.engine_slots < 1 {
                return Err(RailyardError::Config(format!(
                    "track {} must have at least one engine slot",
                    track.name
                )));
            }
        }
        if self.agent_command.is_empty() {
            return Err(RailyardError::Config("agent_command must not be empty".into()));
        }
        Ok(())
    }

    /// Branch namespace: explicit value, or the owner lowercased with
    /// non-alphanumerics collapsed to dashes.
    pub fn branch_prefix(&self) -> String {
        match &self.branch_prefix {
            Some(prefix) if !prefix.is_empty() => prefix.clone(),
            _ => derive_branch_prefix(&self.owner),
        }
    }

    pub fn track(&self, name: &str) -> Option<&TrackConfig> {
        self.tracks.iter().find(|t| t.name == name)
    }

    pub fn database_url(&self) -> String {
        self.database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .unwrap_or_else(|| "postgresql://localhost/railyard".to_string())
    }
}

fn derive_branch_prefix(owner: &str) -> String {
    let mut prefix = String::with_capacity(owner.len());
    let mut last_dash = true;
    for c in owner.chars() {
        if c.is_ascii_alphanumeric() {
            prefix.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            prefix.push('-');
            last_dash = true;
        }
    }
    while prefix.ends_with('-') {
        prefix.pop();
    }
    if prefix.is_empty() {
        "rail".to_string()
    } else {
        prefix
    }
}

/// Default test command per track language, used when a track does not
/// configure one.
pub fn default_test_command(language: &str) -> Option<&'static str> {
    match language.to_ascii_lowercase().as_str() {
        "rust" => Some("cargo test"),
        "go" => Some("go test ./..."),
        "python" => Some("pytest"),
        "typescript" | "javascript" | "node" => Some("npm test"),
        _ => None,
    }
}
