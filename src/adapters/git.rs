//! Git operations used by engines (push, files-changed snapshot, branch
//! log) and the supervisor (fetch, checkout, merge).

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait GitOps: Send + Sync {
    async fn fetch(&self, branch: &str) -> Result<()>;
    async fn checkout(&self, branch: &str) -> Result<()>;
    async fn push(&self, branch: &str) -> Result<()>;
    /// Merge `branch` into the current branch, always creating a merge
    /// commit.
    async fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()>;
    /// Commit id the working tree currently points at.
    async fn head_commit(&self) -> Result<String>;
    /// Last `limit` one-line commit subjects on `branch`.
    async fn log(&self, branch: &str, limit: u32) -> Result<Vec<String>>;
    /// Paths changed on the current branch relative to `base`.
    async fn diff_name_only(&self, base: &str) -> Result<Vec<String>>;
}

/// Production adapter shelling out to `git -C <repo>`.
pub struct GitCli {
    repo: PathBuf,
}

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    async fn git(&self, args: &[&str]) -> Result<super::CommandOutput> {
        super::run_checked("git", args, Some(&self.repo)).await
    }
}

#[async_trait]
impl GitOps for GitCli {
    async fn fetch(&self, branch: &str) -> Result<()> {
        self.git(&["fetch", "origin", branch]).await?;
        Ok(())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", branch]).await?;
        Ok(())
    }

    async fn push(&self, branch: &str) -> Result<()> {
        self.git(&["push", "origin", branch]).await?;
        Ok(())
    }

    async fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.git(&["merge", "--no-ff", branch, "-m", message]).await?;
        Ok(())
    }

    async fn head_commit(&self) -> Result<String> {
        let out = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn log(&self, branch: &str, limit: u32) -> Result<Vec<String>> {
        let count = limit.to_string();
        let out = self.git(&["log", "--oneline", "-n", &count, branch]).await?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    async fn diff_name_only(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}...HEAD");
        let out = self.git(&["diff", "--name-only", &range]).await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// In-memory recorder for tests. Records every call and serves canned
/// responses.
#[derive(Default)]
pub struct FakeGit {
    pub calls: Mutex<Vec<String>>,
    pub fail_push: bool,
    pub log_lines: Vec<String>,
    pub changed_files: Vec<String>,
    pub head: String,
}

impl FakeGit {
    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GitOps for FakeGit {
    async fn fetch(&self, branch: &str) -> Result<()> {
        self.record(format!("fetch {branch}"));
        Ok(())
    }

    async fn checkout(&self, branch: &str) -> Result<()> {
        self.record(format!("checkout {branch}"));
        Ok(())
    }

    async fn push(&self, branch: &str) -> Result<()> {
        self.record(format!("push {branch}"));
        if self.fail_push {
            return Err(crate::error::RailyardError::Command {
                command: format!("git push origin {branch}"),
                detail: "remote rejected".into(),
            });
        }
        Ok(())
    }

    async fn merge_no_ff(&self, branch: &str, _message: &str) -> Result<()> {
        self.record(format!("merge {branch}"));
        Ok(())
    }

    async fn head_commit(&self) -> Result<String> {
        self.record("head".into());
        Ok(if self.head.is_empty() {
            "0000000000000000000000000000000000000000".to_string()
        } else {
            self.head.clone()
        })
    }

    async fn log(&self, branch: &str, limit: u32) -> Result<Vec<String>> {
        self.record(format!("log {branch} {limit}"));
        Ok(self.log_lines.clone())
    }

    async fn diff_name_only(&self, base: &str) -> Result<Vec<String>> {
        self.record(format!("diff {base}"));
        Ok(self.changed_files.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_records_calls_in_order() {
        let git = FakeGit::default();
        git.fetch("yard/backend/car-00001").await.unwrap();
        git.checkout("main").await.unwrap();
        assert_eq!(
            git.recorded(),
            vec!["fetch yard/backend/car-00001", "checkout main"]
        );
    }

    #[tokio::test]
    async fn fake_push_failure_is_a_command_error() {
        let git = FakeGit {
            fail_push: true,
            ..FakeGit::default()
        };
        let err = git.push("b").await.unwrap_err();
        assert!(err.to_string().contains("remote rejected"));
    }
}
