//! [`VersionControl`] backed by the `git` binary.
//!
//! Commands are built as argument vectors (never through a shell) so urls
//! and commits taken from the manifest cannot inject anything.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::traits::{GitError, VersionControl};

#[derive(Debug, Clone)]
pub struct GitCli {
    program: OsString,
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: OsString::from("git"),
            timeout,
        }
    }

    /// Uses a different git executable.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, repo: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
        let command = args.join(" ");
        let mut cmd = Command::new(&self.program);
        if let Some(repo) = repo {
            cmd.arg("-C").arg(repo);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .kill_on_drop(true);

        debug!(command = %command, "Running git");

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| GitError::Timeout {
                command: command.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|source| GitError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GitError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), GitError> {
        let dest = dest.to_string_lossy().into_owned();
        self.run(None, &["clone", "--quiet", "--", url, dest.as_str()])
            .await
            .map(|_| ())
    }

    async fn commit_time(&self, repo: &Path, commit: &str) -> Result<DateTime<Utc>, GitError> {
        let rev = format!("{}^{{commit}}", commit);
        let out = self
            .run(Some(repo), &["show", "-s", "--format=%ct", rev.as_str()])
            .await?;
        parse_epoch(&out).ok_or_else(|| GitError::UnexpectedOutput {
            command: format!("show -s --format=%ct {}", rev),
            output: out,
        })
    }

    async fn add_remote(&self, repo: &Path, remote: &str, url: &str) -> Result<(), GitError> {
        self.run(Some(repo), &["remote", "add", remote, url])
            .await
            .map(|_| ())
    }

    async fn fetch(&self, repo: &Path, remote: &str) -> Result<(), GitError> {
        self.run(Some(repo), &["fetch", "--quiet", remote])
            .await
            .map(|_| ())
    }

    async fn default_branch(&self, repo: &Path, remote: &str) -> Result<String, GitError> {
        let out = self
            .run(Some(repo), &["ls-remote", "--symref", remote, "HEAD"])
            .await?;
        parse_symref_head(&out).ok_or_else(|| GitError::UnexpectedOutput {
            command: format!("ls-remote --symref {} HEAD", remote),
            output: out,
        })
    }

    async fn track_branch(
        &self,
        repo: &Path,
        branch: &str,
        remote: &str,
        upstream_branch: &str,
    ) -> Result<(), GitError> {
        let start = format!("{}/{}", remote, upstream_branch);
        self.run(Some(repo), &["branch", "--force", "--track", branch, start.as_str()])
            .await
            .map(|_| ())
    }

    async fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String, GitError> {
        let out = self.run(Some(repo), &["merge-base", a, b]).await?;
        match out.lines().next() {
            Some(line) if !line.is_empty() && line.chars().all(|c| c.is_ascii_hexdigit()) => {
                Ok(line.to_string())
            }
            _ => Err(GitError::UnexpectedOutput {
                command: format!("merge-base {} {}", a, b),
                output: out,
            }),
        }
    }
}

fn parse_epoch(out: &str) -> Option<DateTime<Utc>> {
    let secs = out.lines().next()?.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Extracts the branch from the `ref: refs/heads/<name>\tHEAD` line of
/// `git ls-remote --symref <remote> HEAD`.
fn parse_symref_head(out: &str) -> Option<String> {
    out.lines()
        .filter_map(|line| line.strip_prefix("ref:"))
        .filter_map(|rest| {
            let (target, name) = rest.trim().split_once('\t')?;
            (name.trim() == "HEAD").then_some(target)
        })
        .filter_map(|target| target.trim().strip_prefix("refs/heads/"))
        .find(|branch| !branch.is_empty())
        .map(str::to_string)
}
