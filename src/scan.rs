//! Scan pipeline: resolve -> query -> report.
//!
//! The batch query is the synchronization point of the run. It is issued
//! only after every dependency has finished resolving (or been skipped), and
//! it covers exactly the resolved set.

use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::executor::ResolverExecutor;
use crate::model::{DependencyDeclaration, ResolutionBatch};
use crate::report::{build_report, Report};
use crate::traits::{ScanError, VersionControl, VulnerabilitySource};

/// Statistics about a scan run.
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    /// Total time spent on the run (milliseconds)
    pub total_duration_ms: u64,

    /// Time spent resolving ancestors (milliseconds)
    pub resolution_duration_ms: u64,

    /// Time spent on the vulnerability query (milliseconds)
    pub query_duration_ms: u64,

    /// Number of dependencies submitted to the resolver
    pub dependencies: usize,

    /// Number of commits sent to the vulnerability database
    pub queried_commits: usize,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub report: Report,
    pub batch: ResolutionBatch,
    pub stats: ScanStats,
}

pub struct ScanPipeline<V, S>
where
    V: VersionControl + 'static,
    S: VulnerabilitySource,
{
    executor: ResolverExecutor<V>,
    source: S,
    /// Artifact uri used in result locations
    manifest_uri: String,
}

impl<V, S> ScanPipeline<V, S>
where
    V: VersionControl + 'static,
    S: VulnerabilitySource,
{
    pub fn new(executor: ResolverExecutor<V>, source: S) -> Self {
        Self {
            executor,
            source,
            manifest_uri: "DEPS".to_string(),
        }
    }

    pub fn with_manifest_uri(mut self, uri: impl Into<String>) -> Self {
        self.manifest_uri = uri.into();
        self
    }

    /// Runs the full scan.
    ///
    /// # Errors
    ///
    /// Per-dependency resolution problems never fail the run. Only a failed
    /// vulnerability query does ([`ScanError::Query`]).
    #[instrument(skip(self, deps), fields(dependencies = deps.len()))]
    pub async fn execute(&self, deps: &[DependencyDeclaration]) -> Result<ScanOutcome, ScanError> {
        let start = Instant::now();
        let mut stats = ScanStats {
            dependencies: deps.len(),
            ..Default::default()
        };

        // ====================================================================
        // Stage 1: Ancestor resolution
        // ====================================================================

        info!("Starting ancestor resolution");
        let resolution_start = Instant::now();
        let batch = self.executor.resolve_all(deps).await;
        stats.resolution_duration_ms = resolution_start.elapsed().as_millis() as u64;

        if !batch.failed.is_empty() {
            for failed in &batch.failed {
                warn!(dependency = %failed.name, reason = %failed.reason, "Unresolved dependency");
            }
        }
        if !batch.stale.is_empty() {
            warn!(dependencies = ?batch.stale, "Stale dependencies (pinned commit older than a year)");
        }

        // ====================================================================
        // Stage 2: Batch vulnerability query
        // ====================================================================

        let queries = batch.queries();
        stats.queried_commits = queries.len();

        info!(commits = queries.len(), "Querying vulnerability database");
        let query_start = Instant::now();
        let findings = self.source.query(&queries).await?;
        stats.query_duration_ms = query_start.elapsed().as_millis() as u64;

        // ====================================================================
        // Stage 3: Report
        // ====================================================================

        let report = build_report(&findings, &batch, &self.manifest_uri);
        stats.total_duration_ms = start.elapsed().as_millis() as u64;

        if report.rules().is_empty() {
            info!("No known vulnerabilities found");
        } else {
            info!(
                rules = report.rules().len(),
                results = report.results().len(),
                "Vulnerabilities found"
            );
        }

        Ok(ScanOutcome {
            report,
            batch,
            stats,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::manifest::{parse_manifest, DefaultVars};
    use crate::model::{CommitQuery, DependencyFindings, VulnerabilityFinding};
    use crate::osv::OsvClient;
    use crate::resolve::tests::{MockRepo, MockVcs};
    use crate::resolve::AncestorResolver;
    use crate::traits::QueryError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records the queries it receives and answers from a fixed table.
    #[derive(Default)]
    struct MockSource {
        hits: Vec<(String, Vec<&'static str>)>,
        fail: bool,
        seen: Mutex<Vec<CommitQuery>>,
    }

    #[async_trait]
    impl VulnerabilitySource for MockSource {
        async fn query(
            &self,
            queries: &[CommitQuery],
        ) -> Result<Vec<DependencyFindings>, QueryError> {
            self.seen.lock().unwrap().extend(queries.iter().cloned());
            if self.fail {
                return Err(QueryError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(queries
                .iter()
                .filter_map(|q| {
                    let (_, ids) = self.hits.iter().find(|(c, _)| *c == q.commit)?;
                    Some(DependencyFindings {
                        dependency: q.dependency.clone(),
                        commit: q.commit.clone(),
                        findings: ids
                            .iter()
                            .map(|id| VulnerabilityFinding {
                                id: id.to_string(),
                                modified: Some("2024-01-01".into()),
                                summary: None,
                                details: None,
                            })
                            .collect(),
                    })
                })
                .collect())
        }
    }

    fn executor(
        vcs: MockVcs,
        manifest_src: &str,
        root: &std::path::Path,
    ) -> (ResolverExecutor<MockVcs>, Vec<DependencyDeclaration>) {
        let manifest = parse_manifest(manifest_src, &DefaultVars::new("x64", "linux")).unwrap();
        let config = ScanConfig::default().with_scratch_root(root);
        let resolver = AncestorResolver::new(Arc::new(vcs), manifest.upstream, &config);
        (ResolverExecutor::new(resolver, 4), manifest.dependencies)
    }

    const LIBFOO_DEPS: &str = r#"
vars = {
  'upstream_urls': {'libfoo': 'https://upstream/libfoo.git'},
}
deps = {'src/third_party/libfoo': 'https://mirror/libfoo.git@aaaa111'}
"#;

    #[tokio::test]
    async fn test_end_to_end_single_finding() {
        let root = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://mirror/libfoo.git", MockRepo::resolving("bbbb222"));
        let (executor, deps) = executor(vcs, LIBFOO_DEPS, root.path());
        let source = MockSource {
            hits: vec![("bbbb222".to_string(), vec!["OSV-1"])],
            ..Default::default()
        };

        let pipeline = ScanPipeline::new(executor, source);
        let outcome = pipeline.execute(&deps).await.unwrap();

        let rules = outcome.report.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "OSV-1");
        let results = outcome.report.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, "OSV-1");
        assert_eq!(results[0].locations[0].logical_locations[0].name, "libfoo");
        assert!(results[0].message.text.contains("libfoo"));
        assert_eq!(outcome.stats.queried_commits, 1);
        assert_eq!(
            pipeline.source.seen.lock().unwrap().clone(),
            vec![CommitQuery {
                dependency: "libfoo".into(),
                commit: "bbbb222".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_dependency_not_queried() {
        let root = tempfile::tempdir().unwrap();
        let mut broken = MockRepo::resolving("x");
        broken.clone_ok = false;
        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://mirror/first.git", broken)
            .with_repo("https://mirror/second.git", MockRepo::resolving("cccc333"));
        let (executor, deps) = executor(
            vcs,
            r#"
vars = {'upstream_urls': {'first': 'https://up/first', 'second': 'https://up/second'}}
deps = {
  'a': 'https://mirror/first.git@0001',
  'b': 'https://mirror/second.git@0002',
}
"#,
            root.path(),
        );

        let pipeline = ScanPipeline::new(executor, MockSource::default());
        let outcome = pipeline.execute(&deps).await.unwrap();

        assert_eq!(outcome.batch.failed_names(), vec!["first".to_string()]);
        let seen = pipeline.source.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].commit, "cccc333");
        assert_eq!(
            outcome.report.runs[0].properties.failed_dependencies,
            vec!["first".to_string()]
        );
    }

    #[tokio::test]
    async fn test_no_findings_is_success() {
        let root = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://mirror/libfoo.git", MockRepo::resolving("bbbb222"));
        let (executor, deps) = executor(vcs, LIBFOO_DEPS, root.path());

        let outcome = ScanPipeline::new(executor, MockSource::default())
            .execute(&deps)
            .await
            .unwrap();

        assert!(outcome.report.rules().is_empty());
        assert!(outcome.report.results().is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_fails_the_scan() {
        let root = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://mirror/libfoo.git", MockRepo::resolving("bbbb222"));
        let (executor, deps) = executor(vcs, LIBFOO_DEPS, root.path());
        let source = MockSource {
            fail: true,
            ..Default::default()
        };

        let err = ScanPipeline::new(executor, source)
            .execute(&deps)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Query(QueryError::Status { status: 500, .. })));
    }

    #[tokio::test]
    async fn test_end_to_end_against_http_mock() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/querybatch")
            .with_status(200)
            .with_body(r#"{"results": [{"vulns": [{"id": "OSV-1", "modified": "2024-01-01"}]}]}"#)
            .create_async()
            .await;

        let root = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new(Utc::now())
            .with_repo("https://mirror/libfoo.git", MockRepo::resolving("bbbb222"));
        let (executor, deps) = executor(vcs, LIBFOO_DEPS, root.path());
        let client = OsvClient::new(server.url(), Duration::from_secs(5)).unwrap();

        let outcome = ScanPipeline::new(executor, client)
            .with_manifest_uri("engine/DEPS")
            .execute(&deps)
            .await
            .unwrap();

        assert_eq!(outcome.report.rules().len(), 1);
        let location = &outcome.report.results()[0].locations[0];
        assert_eq!(location.physical_location.artifact_location.uri, "engine/DEPS");
        assert_eq!(location.logical_locations[0].name, "libfoo");
    }
}
