//! Ancestor resolution - maps a pinned mirror commit to the latest commit it
//! shares with the canonical upstream repository.
//!
//! Each dependency is handled in its own [`ScratchDir`]; a failure in one
//! step ends that dependency's resolution with an
//! [`UnresolvedReason`](crate::model::UnresolvedReason) and never touches
//! other dependencies.

pub mod git;
pub mod scratch;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::ScanConfig;
use crate::model::{DependencyDeclaration, ResolutionResult, UnresolvedReason, UpstreamMapping};
use crate::traits::VersionControl;

pub use git::GitCli;
pub use scratch::ScratchDir;

/// Name of the remote added for the upstream repository.
pub const UPSTREAM_REMOTE: &str = "upstream";

/// Local branch tracking the upstream default branch.
pub const UPSTREAM_BRANCH: &str = "upstream-head";

pub struct AncestorResolver<V>
where
    V: VersionControl,
{
    vcs: Arc<V>,
    mapping: UpstreamMapping,
    scratch_root: PathBuf,
    keep_scratch: bool,
    stale_after: Duration,
    /// Reference point for staleness, fixed once per run
    scan_time: DateTime<Utc>,
}

impl<V> AncestorResolver<V>
where
    V: VersionControl,
{
    pub fn new(vcs: Arc<V>, mapping: UpstreamMapping, config: &ScanConfig) -> Self {
        Self {
            vcs,
            mapping,
            scratch_root: config.scratch_root.clone(),
            keep_scratch: config.keep_scratch,
            stale_after: config.stale_after,
            scan_time: Utc::now(),
        }
    }

    pub fn with_scan_time(mut self, scan_time: DateTime<Utc>) -> Self {
        self.scan_time = scan_time;
        self
    }

    pub fn mapping(&self) -> &UpstreamMapping {
        &self.mapping
    }

    fn is_stale(&self, commit_time: DateTime<Utc>) -> bool {
        match self.scan_time.signed_duration_since(commit_time).to_std() {
            Ok(age) => age >= self.stale_after,
            // Commit dated in the future
            Err(_) => false,
        }
    }

    /// Runs the full resolution for one dependency.
    #[instrument(skip(self, dep), fields(dependency = %dep.name))]
    pub async fn resolve(&self, dep: &DependencyDeclaration) -> ResolutionResult {
        let upstream_url = match self.mapping.get(&dep.name) {
            Some(url) => url.to_string(),
            None => {
                warn!("No upstream mapping");
                return ResolutionResult::unresolved(UnresolvedReason::NoUpstreamMapping, false);
            }
        };

        let scratch = match ScratchDir::create(&self.scratch_root, &dep.name, self.keep_scratch) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "Failed to create scratch directory");
                return ResolutionResult::unresolved(UnresolvedReason::CloneFailed, false);
            }
        };
        let repo = scratch.checkout();

        if let Err(e) = self.vcs.clone_repo(&dep.mirror_url, &repo).await {
            warn!(error = %e, url = %dep.mirror_url, "Clone failed");
            return ResolutionResult::unresolved(UnresolvedReason::CloneFailed, false);
        }

        let is_stale = match self.vcs.commit_time(&repo, &dep.pinned_commit).await {
            Ok(time) => {
                let stale = self.is_stale(time);
                if stale {
                    info!(commit_time = %time, "Pinned commit is stale");
                }
                stale
            }
            Err(e) => {
                warn!(error = %e, "Could not read pinned commit time");
                false
            }
        };

        if let Err(e) = self
            .vcs
            .add_remote(&repo, UPSTREAM_REMOTE, &upstream_url)
            .await
        {
            warn!(error = %e, "Adding upstream remote failed");
            return ResolutionResult::unresolved(UnresolvedReason::FetchFailed, is_stale);
        }
        if let Err(e) = self.vcs.fetch(&repo, UPSTREAM_REMOTE).await {
            warn!(error = %e, url = %upstream_url, "Upstream fetch failed");
            return ResolutionResult::unresolved(UnresolvedReason::FetchFailed, is_stale);
        }

        let branch = match self.vcs.default_branch(&repo, UPSTREAM_REMOTE).await {
            Ok(branch) => branch,
            Err(e) => {
                warn!(error = %e, "Could not determine upstream default branch");
                return ResolutionResult::unresolved(UnresolvedReason::FetchFailed, is_stale);
            }
        };
        if let Err(e) = self
            .vcs
            .track_branch(&repo, UPSTREAM_BRANCH, UPSTREAM_REMOTE, &branch)
            .await
        {
            warn!(error = %e, branch = %branch, "Could not track upstream branch");
            return ResolutionResult::unresolved(UnresolvedReason::FetchFailed, is_stale);
        }

        match self
            .vcs
            .merge_base(&repo, UPSTREAM_BRANCH, &dep.pinned_commit)
            .await
        {
            Ok(ancestor) => {
                info!(ancestor = %ancestor, "Resolved upstream ancestor");
                ResolutionResult::resolved(ancestor, is_stale)
            }
            Err(e) => {
                warn!(error = %e, "Merge-base failed");
                ResolutionResult::unresolved(UnresolvedReason::MergeBaseFailed, is_stale)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::traits::GitError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    /// Scripted behavior for one mirror url.
    #[derive(Debug, Clone)]
    pub(crate) struct MockRepo {
        pub clone_ok: bool,
        pub commit_age_days: Option<i64>,
        pub fetch_ok: bool,
        pub branch: Option<String>,
        pub merge_base: Option<String>,
    }

    impl MockRepo {
        pub(crate) fn resolving(ancestor: &str) -> Self {
            Self {
                clone_ok: true,
                commit_age_days: Some(10),
                fetch_ok: true,
                branch: Some("main".to_string()),
                merge_base: Some(ancestor.to_string()),
            }
        }
    }

    /// In-memory [`VersionControl`] keyed by mirror url. Checkouts are
    /// remembered by path so later calls find the repo they belong to.
    #[derive(Default)]
    pub(crate) struct MockVcs {
        pub repos: HashMap<String, MockRepo>,
        pub now: Option<DateTime<Utc>>,
        checkouts: Mutex<HashMap<PathBuf, String>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockVcs {
        pub(crate) fn new(now: DateTime<Utc>) -> Self {
            Self {
                now: Some(now),
                ..Default::default()
            }
        }

        pub(crate) fn with_repo(mut self, url: &str, repo: MockRepo) -> Self {
            self.repos.insert(url.to_string(), repo);
            self
        }

        fn repo_at(&self, path: &Path) -> Result<MockRepo, GitError> {
            let checkouts = self.checkouts.lock().unwrap();
            let url = checkouts.get(path).ok_or_else(|| GitError::Failed {
                command: "mock".into(),
                status: "1".into(),
                stderr: "not a repository".into(),
            })?;
            Ok(self.repos[url].clone())
        }

        fn fail(command: &str) -> GitError {
            GitError::Failed {
                command: command.to_string(),
                status: "exit status: 128".into(),
                stderr: "fatal".into(),
            }
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl VersionControl for MockVcs {
        async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), GitError> {
            self.log(format!("clone {}", url));
            match self.repos.get(url) {
                Some(repo) if repo.clone_ok => {
                    self.checkouts
                        .lock()
                        .unwrap()
                        .insert(dest.to_path_buf(), url.to_string());
                    Ok(())
                }
                _ => Err(Self::fail("clone")),
            }
        }

        async fn commit_time(&self, repo: &Path, _commit: &str) -> Result<DateTime<Utc>, GitError> {
            let repo = self.repo_at(repo)?;
            let now = self.now.unwrap_or_else(Utc::now);
            repo.commit_age_days
                .map(|days| now - chrono::Duration::days(days))
                .ok_or_else(|| Self::fail("show"))
        }

        async fn add_remote(&self, repo: &Path, _remote: &str, url: &str) -> Result<(), GitError> {
            self.log(format!("remote add {}", url));
            self.repo_at(repo).map(|_| ())
        }

        async fn fetch(&self, repo: &Path, _remote: &str) -> Result<(), GitError> {
            if self.repo_at(repo)?.fetch_ok {
                Ok(())
            } else {
                Err(Self::fail("fetch"))
            }
        }

        async fn default_branch(&self, repo: &Path, _remote: &str) -> Result<String, GitError> {
            self.repo_at(repo)?.branch.ok_or_else(|| Self::fail("ls-remote"))
        }

        async fn track_branch(
            &self,
            repo: &Path,
            _branch: &str,
            _remote: &str,
            _upstream_branch: &str,
        ) -> Result<(), GitError> {
            self.repo_at(repo).map(|_| ())
        }

        async fn merge_base(&self, repo: &Path, _a: &str, _b: &str) -> Result<String, GitError> {
            self.repo_at(repo)?
                .merge_base
                .ok_or_else(|| Self::fail("merge-base"))
        }
    }

    fn dep(spec: &str) -> DependencyDeclaration {
        DependencyDeclaration::parse(spec).unwrap()
    }

    fn resolver(vcs: MockVcs, mapping: UpstreamMapping, root: &Path) -> AncestorResolver<MockVcs> {
        let now = vcs.now.unwrap();
        let config = ScanConfig::default().with_scratch_root(root);
        AncestorResolver::new(Arc::new(vcs), mapping, &config).with_scan_time(now)
    }

    #[tokio::test]
    async fn test_resolves_ancestor() {
        let root = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://mirror/libfoo.git", MockRepo::resolving("bbbb222"));
        let mapping: UpstreamMapping = [("libfoo", "https://upstream/libfoo.git")]
            .into_iter()
            .collect();
        let resolver = resolver(vcs, mapping, root.path());

        let result = resolver.resolve(&dep("https://mirror/libfoo.git@aaaa111")).await;

        assert_eq!(result, ResolutionResult::resolved("bbbb222", false));
        let calls = resolver.vcs.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "clone https://mirror/libfoo.git".to_string(),
                "remote add https://upstream/libfoo.git".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_mapping_skips_clone() {
        let root = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://mirror/libfoo.git", MockRepo::resolving("bbbb222"));
        let resolver = resolver(vcs, UpstreamMapping::new(), root.path());

        let result = resolver.resolve(&dep("https://mirror/libfoo.git@aaaa111")).await;

        assert_eq!(
            result,
            ResolutionResult::unresolved(UnresolvedReason::NoUpstreamMapping, false)
        );
        assert!(resolver.vcs.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let root = tempfile::tempdir().unwrap();
        let mut no_clone = MockRepo::resolving("x");
        no_clone.clone_ok = false;
        let mut no_fetch = MockRepo::resolving("x");
        no_fetch.fetch_ok = false;
        let mut no_branch = MockRepo::resolving("x");
        no_branch.branch = None;
        let mut no_base = MockRepo::resolving("x");
        no_base.merge_base = None;

        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://m/a", no_clone)
            .with_repo("https://m/b", no_fetch)
            .with_repo("https://m/c", no_branch)
            .with_repo("https://m/d", no_base);
        let mapping: UpstreamMapping = ["a", "b", "c", "d"]
            .into_iter()
            .map(|n| (n, format!("https://up/{}", n)))
            .collect();
        let resolver = resolver(vcs, mapping, root.path());

        let reasons = [
            ("https://m/a@01", UnresolvedReason::CloneFailed),
            ("https://m/b@01", UnresolvedReason::FetchFailed),
            ("https://m/c@01", UnresolvedReason::FetchFailed),
            ("https://m/d@01", UnresolvedReason::MergeBaseFailed),
        ];
        for (spec, reason) in reasons {
            let result = resolver.resolve(&dep(spec)).await;
            assert_eq!(result.resolution, crate::model::Resolution::Unresolved { reason });
        }
    }

    #[tokio::test]
    async fn test_stale_even_when_merge_base_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut repo = MockRepo::resolving("x");
        repo.commit_age_days = Some(400);
        repo.merge_base = None;
        let vcs = MockVcs::new(Utc::now()).with_repo("https://m/old.git", repo);
        let mapping: UpstreamMapping = [("old", "https://up/old.git")].into_iter().collect();
        let resolver = resolver(vcs, mapping, root.path());

        let result = resolver.resolve(&dep("https://m/old.git@abc")).await;

        assert!(result.is_stale);
        assert_eq!(
            result.resolution,
            crate::model::Resolution::Unresolved {
                reason: UnresolvedReason::MergeBaseFailed
            }
        );
    }

    #[tokio::test]
    async fn test_unreadable_commit_time_is_not_stale() {
        let root = tempfile::tempdir().unwrap();
        let mut repo = MockRepo::resolving("cafe");
        repo.commit_age_days = None;
        let vcs = MockVcs::new(Utc::now()).with_repo("https://m/x.git", repo);
        let mapping: UpstreamMapping = [("x", "https://up/x.git")].into_iter().collect();
        let resolver = resolver(vcs, mapping, root.path());

        let result = resolver.resolve(&dep("https://m/x.git@abc")).await;

        assert_eq!(result, ResolutionResult::resolved("cafe", false));
    }

    #[tokio::test]
    async fn test_scratch_is_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new(Utc::now()).with_repo("https://m/x.git", MockRepo::resolving("cafe"));
        let mapping: UpstreamMapping = [("x", "https://up/x.git")].into_iter().collect();
        let resolver = resolver(vcs, mapping, root.path());

        resolver.resolve(&dep("https://m/x.git@abc")).await;

        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    async fn resolve_with_git(script: &str, spec: &str) -> ResolutionResult {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let git = GitCli::new(Duration::from_millis(300))
            .with_program(git::tests::fake_git(bin.path(), script));
        let dep = dep(spec);
        let mapping: UpstreamMapping = [(dep.name.as_str(), "https://up/slow.git")]
            .into_iter()
            .collect();
        let config = ScanConfig::default().with_scratch_root(root.path());
        AncestorResolver::new(Arc::new(git), mapping, &config)
            .resolve(&dep)
            .await
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clone_timeout_is_clone_failure() {
        let result = resolve_with_git("exec sleep 5", "https://m/slow.git@abc").await;
        assert_eq!(
            result.resolution,
            crate::model::Resolution::Unresolved {
                reason: UnresolvedReason::CloneFailed
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_timeout_is_fetch_failure() {
        // clone:  git clone --quiet -- <url> <dest>
        // others: git -C <repo> <subcommand> ...
        let script = r#"case "$1" in
  clone) mkdir -p "$5" ;;
  -C) case "$3" in
        show) echo 1700000000 ;;
        fetch) exec sleep 5 ;;
      esac ;;
esac"#;
        let result = resolve_with_git(script, "https://m/slow.git@abc").await;
        assert_eq!(
            result.resolution,
            crate::model::Resolution::Unresolved {
                reason: UnresolvedReason::FetchFailed
            }
        );
        // 2023 commit time read before the fetch hung
        assert!(result.is_stale);
    }
}
