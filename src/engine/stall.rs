//! Stall detection thresholds.
//!
//! Three independent signals mark an agent as stalled: prolonged silence
//! on both streams, the same error line repeated past a limit, and the
//! per-car continue-cycle ceiling. All three are routed to the supervisor
//! as a message, never a crash.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallReason {
    /// No output on either stream for the configured window.
    Silence(Duration),
    /// The same error line seen `count` times.
    RepeatedError { line: String, count: u32 },
    /// Continue cycles exceeded the ceiling.
    CycleCeiling(u32),
}

impl std::fmt::Display for StallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Silence(window) => {
                write!(f, "no output for {}s", window.as_secs())
            }
            Self::RepeatedError { line, count } => {
                write!(f, "error repeated {count} times: {line}")
            }
            Self::CycleCeiling(cycles) => write!(f, "exceeded {cycles} continue cycles"),
        }
    }
}

/// Tracks output activity for one subprocess run.
pub struct StallTracker {
    silence_window: Duration,
    max_repeats: u32,
    last_output: Instant,
    error_counts: HashMap<String, u32>,
}

impl StallTracker {
    pub fn new(silence_window: Duration, max_repeats: u32) -> Self {
        Self {
            silence_window,
            max_repeats,
            last_output: Instant::now(),
            error_counts: HashMap::new(),
        }
    }

    /// Record a stdout line.
    pub fn note_output(&mut self) {
        self.last_output = Instant::now();
    }

    /// Record a stderr line; returns a stall when the identical line has
    /// now been seen more than the repeat threshold.
    pub fn note_error(&mut self, line: &str) -> Option<StallReason> {
        self.last_output = Instant::now();
        let key = line.trim();
        if key.is_empty() {
            return None;
        }
        let count = self.error_counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count > self.max_repeats {
            return Some(StallReason::RepeatedError {
                line: key.to_string(),
                count: *count,
            });
        }
        None
    }

    /// Deadline after which silence becomes a stall.
    pub fn silence_deadline(&self) -> Instant {
        self.last_output + self.silence_window
    }

    pub fn silence_window(&self) -> Duration {
        self.silence_window
    }
}
