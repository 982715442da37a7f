//! External collaborators behind narrow, swappable interfaces.
//!
//! The core never shells out directly: git, the test runner, and the tmux
//! multiplexer are `async_trait` seams with a production adapter that runs
//! the real command and an in-memory fake for tests.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{RailyardError, Result};

pub mod git;
pub mod multiplexer;
pub mod testrunner;

pub use git::{FakeGit, GitCli, GitOps};
pub use multiplexer::{FakeMultiplexer, Multiplexer, TmuxMultiplexer};
pub use testrunner::{FakeTestRunner, ShellTestRunner, TestReport, TestRunner};

/// Captured output of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Run a command to completion, capturing both streams.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output().await.map_err(|e| RailyardError::Command {
        command: format!("{program} {}", args.join(" ")),
        detail: e.to_string(),
    })?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and fail unless it exits zero.
pub(crate) async fn run_checked(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<CommandOutput> {
    let output = run_command(program, args, cwd).await?;
    if !output.success {
        return Err(RailyardError::Command {
            command: format!("{program} {}", args.join(" ")),
            detail: output.combined(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_prefers_nonempty_streams() {
        let out = CommandOutput {
            success: true,
            stdout: "ok".into(),
            stderr: String::new(),
        };
        assert_eq!(out.combined(), "ok");

        let err = CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "boom".into(),
        };
        assert_eq!(err.combined(), "boom");

        let both = CommandOutput {
            success: false,
            stdout: "partial".into(),
            stderr: "boom".into(),
        };
        assert_eq!(both.combined(), "partial\nboom");
    }
}
