use crate::model::{CommitQuery, DependencyFindings};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while reading a manifest or a flattened dependency list.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Syntax error at {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Undefined variable `{name}` referenced at {line}:{column}")]
    UndefinedVariable {
        name: String,
        line: usize,
        column: usize,
    },

    #[error("Type error at {line}:{column}: {message}")]
    TypeMismatch {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Invalid dependency `{entry}`: {reason}")]
    InvalidDependency { entry: String, reason: String },

    /// Pinned to a tag or branch name rather than a commit.
    #[error("Dependency `{entry}` is pinned to `{pin}`, not a commit")]
    UnsupportedPin { entry: String, pin: String },

    #[error("Invalid manifest structure: {0}")]
    InvalidStructure(String),

    #[error("Invalid upstream mapping: {0}")]
    InvalidMapping(String),
}

/// Errors from a single version-control operation.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Failed to spawn `git {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`git {command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Unexpected output from `git {command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
}

/// Errors talking to the vulnerability database. All of them abort the scan.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Vulnerability query timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Vulnerability database returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Response has {got} results for {expected} queries")]
    Misaligned { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write report to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level scan failure.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

// ============================================================================
// Seams
// ============================================================================

/// Version-control operations needed to find an upstream ancestor.
///
/// Every method operates on an already-cloned working copy at `repo`,
/// except [`VersionControl::clone_repo`] which creates it.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), GitError>;

    /// Committer timestamp of `commit`.
    async fn commit_time(&self, repo: &Path, commit: &str) -> Result<DateTime<Utc>, GitError>;

    async fn add_remote(&self, repo: &Path, remote: &str, url: &str) -> Result<(), GitError>;

    async fn fetch(&self, repo: &Path, remote: &str) -> Result<(), GitError>;

    /// Name of the branch `remote`'s HEAD points at.
    async fn default_branch(&self, repo: &Path, remote: &str) -> Result<String, GitError>;

    /// Creates local `branch` tracking `remote/upstream_branch`.
    async fn track_branch(
        &self,
        repo: &Path,
        branch: &str,
        remote: &str,
        upstream_branch: &str,
    ) -> Result<(), GitError>;

    async fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String, GitError>;
}

/// A commit-indexed vulnerability database.
#[async_trait]
pub trait VulnerabilitySource: Send + Sync {
    /// Returns the non-empty results, each attributed to the query that
    /// produced it.
    async fn query(&self, queries: &[CommitQuery]) -> Result<Vec<DependencyFindings>, QueryError>;
}
