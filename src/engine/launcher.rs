//! LLM agent subprocess launcher.
//!
//! The agent is just a command: it receives the rendered prompt on stdin,
//! writes to its standard streams, and terminates. Exit codes carry no
//! success semantics; completion is signaled through the store by the
//! agent itself (the `railcar` helper). The launcher streams both pipes
//! as line events so the engine can log, watch for stalls, and kill.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::{RailyardError, Result};

/// One logical chunk of agent output, or process exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Stdout(String),
    Stderr(String),
    /// Terminal event; `None` when killed by signal.
    Exited(Option<i32>),
}

/// Live handle on a spawned agent.
pub struct AgentHandle {
    pub events: mpsc::Receiver<AgentEvent>,
    kill: watch::Sender<bool>,
}

impl AgentHandle {
    pub fn new(events: mpsc::Receiver<AgentEvent>, kill: watch::Sender<bool>) -> Self {
        Self { events, kill }
    }

    /// Request termination. The `Exited` event still arrives through the
    /// event stream once the process is gone.
    pub fn kill(&self) {
        let _ = self.kill.send(true);
    }
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, prompt: &str) -> Result<AgentHandle>;
}

/// Production launcher running the configured agent command.
pub struct CommandLauncher {
    command: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(command: Vec<String>, workdir: Option<PathBuf>) -> Self {
        Self { command, workdir }
    }
}

#[async_trait]
impl AgentLauncher for CommandLauncher {
    async fn launch(&self, prompt: &str) -> Result<AgentHandle> {
        let program = self
            .command
            .first()
            .ok_or_else(|| RailyardError::Config("agent command is empty".into()))?;

        let mut command = Command::new(program);
        command
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| RailyardError::Command {
            command: self.command.join(" "),
            detail: e.to_string(),
        })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            RailyardError::Internal("agent subprocess has no stdin pipe".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RailyardError::Internal("agent subprocess has no stdout pipe".into())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RailyardError::Internal("agent subprocess has no stderr pipe".into())
        })?;

        let (tx, rx) = mpsc::channel::<AgentEvent>(256);
        let (kill_tx, mut kill_rx) = watch::channel(false);

        // Feed the prompt and close the pipe so the agent sees EOF.
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                debug!("failed to write prompt to agent stdin: {e}");
            }
            drop(stdin);
        });

        let out_tx = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if out_tx.send(AgentEvent::Stdout(line)).await.is_err() {
                    break;
                }
            }
        });

        let err_tx = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if err_tx.send(AgentEvent::Stderr(line)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.changed() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // Let both pipes drain before reporting exit, so the event
            // stream never drops a trailing line.
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let code = status.ok().and_then(|s| s.code());
            let _ = tx.send(AgentEvent::Exited(code)).await;
        });

        Ok(AgentHandle::new(rx, kill_tx))
    }
}

/// Scripted launcher for tests: replays a fixed event sequence per launch.
pub struct ScriptedLauncher {
    scripts: std::sync::Mutex<Vec<Vec<AgentEvent>>>,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

impl ScriptedLauncher {
    /// `scripts` are consumed front-first, one per `launch` call.
    pub fn new(scripts: Vec<Vec<AgentEvent>>) -> Self {
        Self {
            scripts: std::sync::Mutex::new(scripts),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, prompt: &str) -> Result<AgentHandle> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![AgentEvent::Exited(Some(0))]
            } else {
                scripts.remove(0)
            }
        };
        let (tx, rx) = mpsc::channel(256);
        let (kill_tx, _kill_rx) = watch::channel(false);
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(AgentHandle::new(rx, kill_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn collect(mut handle: AgentHandle) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            let done = matches!(event, AgentEvent::Exited(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn command_launcher_streams_stdout_and_exit() {
        let launcher = CommandLauncher::new(vec!["cat".into()], None);
        let handle = launcher.launch("hello agent\n").await.unwrap();
        let events = collect(handle).await;
        assert!(events.contains(&AgentEvent::Stdout("hello agent".into())));
        assert_eq!(events.last(), Some(&AgentEvent::Exited(Some(0))));
    }

    #[tokio::test]
    async fn command_launcher_reports_exit_code() {
        let launcher = CommandLauncher::new(vec!["sh".into(), "-c".into(), "exit 7".into()], None);
        let handle = launcher.launch("").await.unwrap();
        let events = collect(handle).await;
        assert_eq!(events.last(), Some(&AgentEvent::Exited(Some(7))));
    }

    #[tokio::test]
    async fn kill_terminates_a_hung_agent() {
        let launcher =
            CommandLauncher::new(vec!["sh".into(), "-c".into(), "sleep 30".into()], None);
        let handle = launcher.launch("").await.unwrap();
        handle.kill();
        let events = tokio::time::timeout(Duration::from_secs(5), collect(handle))
            .await
            .expect("killed agent must exit promptly");
        assert!(matches!(events.last(), Some(AgentEvent::Exited(_))));
    }

    #[tokio::test]
    async fn scripted_launcher_replays_and_records_prompt() {
        let launcher = ScriptedLauncher::new(vec![vec![
            AgentEvent::Stdout("working".into()),
            AgentEvent::Exited(Some(0)),
        ]]);
        let handle = launcher.launch("prompt text").await.unwrap();
        let events = collect(handle).await;
        assert_eq!(events.len(), 2);
        assert_eq!(launcher.prompts.lock().unwrap().as_slice(), ["prompt text"]);
    }
}
