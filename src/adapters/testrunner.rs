//! Test-runner abstraction for the supervisor's switch operation.
//!
//! A failing test command is an ordinary report, not an error; errors are
//! reserved for being unable to run the command at all.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct TestReport {
    pub passed: bool,
    pub output: String,
}

impl TestReport {
    pub fn passing() -> Self {
        Self {
            passed: true,
            output: String::new(),
        }
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run `command` from the working tree and report the result.
    async fn run(&self, command: &str) -> Result<TestReport>;
}

/// Production adapter: `sh -c <command>` in the repository directory.
pub struct ShellTestRunner {
    workdir: PathBuf,
}

impl ShellTestRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run(&self, command: &str) -> Result<TestReport> {
        let out = super::run_command("sh", &["-c", command], Some(&self.workdir)).await?;
        Ok(TestReport {
            passed: out.success,
            output: out.combined(),
        })
    }
}

/// Canned-result runner for tests.
pub struct FakeTestRunner {
    pub passed: bool,
    pub output: String,
    pub commands: Mutex<Vec<String>>,
}

impl FakeTestRunner {
    pub fn passing() -> Self {
        Self {
            passed: true,
            output: "all tests passed".into(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn ran(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestRunner for FakeTestRunner {
    async fn run(&self, command: &str) -> Result<TestReport> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(TestReport {
            passed: self.passed,
            output: self.output.clone(),
        })
    }
}
