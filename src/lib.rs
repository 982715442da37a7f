//! Railyard: a control plane for a fleet of LLM coding-agent subprocesses.
//!
//! Work items ("cars") form a dependency-ordered backlog per track. Engines
//! claim ready cars out of a shared Postgres store, render a context prompt,
//! run the configured agent command against it, and classify the outcome. A
//! singleton supervisor watches heartbeats, reassigns stalled work, and
//! adjudicates merges ("switch"). A durable message bus carries out-of-band
//! control signals between all agents.
//!
//! All coordination goes through the store; there is no in-memory
//! authoritative state. See `DESIGN.md` for the component map.

pub mod adapters;
pub mod cars;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod messaging;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod supervisor;

pub use error::{ErrorKind, RailyardError, Result};

/// Well-known agent id of the singleton supervisor.
pub const SUPERVISOR_ID: &str = "supervisor";

/// Well-known agent id used by the orchestrator when it sends messages.
pub const ORCHESTRATOR_ID: &str = "orchestrator";
