//! Terminal-multiplexer abstraction.
//!
//! The orchestrator runs the supervisor and every engine in its own pane
//! of one tmux session. A unit-testable in-memory replacement is part of
//! the contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{RailyardError, Result};

#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn session_exists(&self, session: &str) -> Result<bool>;
    async fn create_session(&self, session: &str) -> Result<()>;
    /// Create a pane in the session and return its id. The command starts
    /// running immediately via `send_keys`.
    async fn new_pane(&self, session: &str, command: &str) -> Result<String>;
    async fn send_keys(&self, pane: &str, keys: &str) -> Result<()>;
    /// Deliver a POSIX signal to the process group of a pane.
    async fn send_signal(&self, pane: &str, signal: &str) -> Result<()>;
    async fn kill_pane(&self, pane: &str) -> Result<()>;
    async fn kill_session(&self, session: &str) -> Result<()>;
    async fn list_panes(&self, session: &str) -> Result<Vec<String>>;
    async fn tile_layout(&self, session: &str) -> Result<()>;
}

/// Production adapter shelling out to `tmux`.
pub struct TmuxMultiplexer;

impl TmuxMultiplexer {
    async fn tmux(&self, args: &[&str]) -> Result<super::CommandOutput> {
        super::run_checked("tmux", args, None).await
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn session_exists(&self, session: &str) -> Result<bool> {
        let out = super::run_command("tmux", &["has-session", "-t", session], None).await?;
        Ok(out.success)
    }

    async fn create_session(&self, session: &str) -> Result<()> {
        self.tmux(&["new-session", "-d", "-s", session]).await?;
        Ok(())
    }

    async fn new_pane(&self, session: &str, command: &str) -> Result<String> {
        let out = self
            .tmux(&["split-window", "-d", "-t", session, "-P", "-F", "#{pane_id}"])
            .await?;
        let pane = out.stdout.trim().to_string();
        if pane.is_empty() {
            return Err(RailyardError::Internal(
                "tmux did not report a pane id".into(),
            ));
        }
        self.send_keys(&pane, command).await?;
        Ok(pane)
    }

    async fn send_keys(&self, pane: &str, keys: &str) -> Result<()> {
        self.tmux(&["send-keys", "-t", pane, keys, "Enter"]).await?;
        Ok(())
    }

    async fn send_signal(&self, pane: &str, signal: &str) -> Result<()> {
        let out = self
            .tmux(&["display-message", "-p", "-t", pane, "#{pane_pid}"])
            .await?;
        let pid = out.stdout.trim().to_string();
        if pid.is_empty() {
            return Err(RailyardError::Internal(format!("pane {pane} has no pid")));
        }
        super::run_checked("kill", &[&format!("-{signal}"), &pid], None).await?;
        Ok(())
    }

    async fn kill_pane(&self, pane: &str) -> Result<()> {
        self.tmux(&["kill-pane", "-t", pane]).await?;
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<()> {
        self.tmux(&["kill-session", "-t", session]).await?;
        Ok(())
    }

    async fn list_panes(&self, session: &str) -> Result<Vec<String>> {
        let out = self
            .tmux(&["list-panes", "-s", "-t", session, "-F", "#{pane_id}"])
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn tile_layout(&self, session: &str) -> Result<()> {
        self.tmux(&["select-layout", "-t", session, "tiled"]).await?;
        Ok(())
    }
}

#[derive(Default)]
struct FakeMuxState {
    sessions: Vec<String>,
    /// pane id -> (session, launch command)
    panes: HashMap<String, (String, String)>,
    keys: Vec<(String, String)>,
    signals: Vec<(String, String)>,
    next_pane: u32,
}

/// In-memory multiplexer for tests.
#[derive(Default)]
pub struct FakeMultiplexer {
    state: Mutex<FakeMuxState>,
}

impl FakeMultiplexer {
    pub fn pane_commands(&self, session: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut panes: Vec<_> = state
            .panes
            .iter()
            .filter(|(_, (s, _))| s == session)
            .collect();
        panes.sort_by_key(|(id, _)| id.to_string());
        panes.into_iter().map(|(_, (_, cmd))| cmd.clone()).collect()
    }

    pub fn signals(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .any(|s| s == session)
    }
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn session_exists(&self, session: &str) -> Result<bool> {
        Ok(self.has_session(session))
    }

    async fn create_session(&self, session: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.iter().any(|s| s == session) {
            return Err(RailyardError::SessionRunning);
        }
        state.sessions.push(session.to_string());
        Ok(())
    }

    async fn new_pane(&self, session: &str, command: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.iter().any(|s| s == session) {
            return Err(RailyardError::SessionNotRunning);
        }
        state.next_pane += 1;
        let pane = format!("%{}", state.next_pane);
        state
            .panes
            .insert(pane.clone(), (session.to_string(), command.to_string()));
        Ok(pane)
    }

    async fn send_keys(&self, pane: &str, keys: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .keys
            .push((pane.to_string(), keys.to_string()));
        Ok(())
    }

    async fn send_signal(&self, pane: &str, signal: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .signals
            .push((pane.to_string(), signal.to_string()));
        Ok(())
    }

    async fn kill_pane(&self, pane: &str) -> Result<()> {
        self.state.lock().unwrap().panes.remove(pane);
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sessions.retain(|s| s != session);
        state.panes.retain(|_, (s, _)| s != session);
        Ok(())
    }

    async fn list_panes(&self, session: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut panes: Vec<String> = state
            .panes
            .iter()
            .filter(|(_, (s, _))| s == session)
            .map(|(id, _)| id.clone())
            .collect();
        panes.sort();
        Ok(panes)
    }

    async fn tile_layout(&self, _session: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_session_lifecycle() {
        let mux = FakeMultiplexer::default();
        assert!(!mux.session_exists("yard").await.unwrap());
        mux.create_session("yard").await.unwrap();
        assert!(mux.session_exists("yard").await.unwrap());

        let pane = mux.new_pane("yard", "railyard supervisor").await.unwrap();
        assert_eq!(mux.list_panes("yard").await.unwrap(), vec![pane.clone()]);

        mux.kill_session("yard").await.unwrap();
        assert!(!mux.session_exists("yard").await.unwrap());
        assert!(mux.list_panes("yard").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fake_rejects_duplicate_sessions() {
        let mux = FakeMultiplexer::default();
        mux.create_session("yard").await.unwrap();
        let err = mux.create_session("yard").await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn fake_pane_requires_session() {
        let mux = FakeMultiplexer::default();
        assert!(mux.new_pane("missing", "true").await.is_err());
    }
}
