use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::traits::ManifestError;

/// One pinned dependency taken from the manifest or a flattened list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    pub name: String,
    pub mirror_url: String,
    pub pinned_commit: String, // lower-case hex
}

impl DependencyDeclaration {
    pub fn new(
        mirror_url: impl Into<String>,
        pinned_commit: impl Into<String>,
    ) -> Result<Self, ManifestError> {
        let mirror_url = mirror_url.into();
        let pinned_commit = pinned_commit.into();
        let spec = format!("{}@{}", mirror_url, pinned_commit);

        if mirror_url.is_empty() {
            return Err(ManifestError::InvalidDependency {
                entry: spec,
                reason: "empty repository url".to_string(),
            });
        }
        if pinned_commit.is_empty() {
            return Err(ManifestError::InvalidDependency {
                entry: spec,
                reason: "empty commit".to_string(),
            });
        }
        if !pinned_commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ManifestError::UnsupportedPin {
                entry: spec,
                pin: pinned_commit,
            });
        }

        let name = dependency_name(&mirror_url);
        if name.is_empty() {
            return Err(ManifestError::InvalidDependency {
                entry: spec,
                reason: "cannot derive a name from the repository url".to_string(),
            });
        }

        Ok(Self {
            name,
            mirror_url,
            pinned_commit: pinned_commit.to_ascii_lowercase(),
        })
    }

    /// Parses the `url@commit` form, splitting at the last `@` so that
    /// `git@host:...` style urls survive.
    pub fn parse(spec: &str) -> Result<Self, ManifestError> {
        let spec = spec.trim();
        let (url, commit) = spec
            .rsplit_once('@')
            .ok_or_else(|| ManifestError::InvalidDependency {
                entry: spec.to_string(),
                reason: "expected `url@commit`".to_string(),
            })?;
        Self::new(url, commit)
    }
}

impl fmt::Display for DependencyDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.mirror_url, self.pinned_commit)
    }
}

/// Last path segment of a repository url, without its extension.
pub fn dependency_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let segment = trimmed
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    match segment.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => segment.to_string(),
    }
}

/// Names shared by dependencies with different mirror urls. Such
/// dependencies share one upstream mapping entry and one report location.
pub fn name_collisions(deps: &[DependencyDeclaration]) -> Vec<String> {
    let mut urls: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for dep in deps {
        urls.entry(&dep.name).or_default().insert(&dep.mirror_url);
    }
    urls.into_iter()
        .filter(|(_, mirrors)| mirrors.len() > 1)
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Dependency name -> canonical upstream repository url.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpstreamMapping {
    urls: BTreeMap<String, String>,
}

impl UpstreamMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, url: impl Into<String>) {
        self.urls.insert(name.into(), url.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.urls.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Entries of `other` take precedence.
    pub fn merge(&mut self, other: UpstreamMapping) {
        self.urls.extend(other.urls);
    }

    /// Loads the standalone JSON form: `{"name": "url", ...}`.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UpstreamMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            urls: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Why a dependency could not be resolved to an upstream ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnresolvedReason {
    NoUpstreamMapping,
    CloneFailed,
    FetchFailed,
    MergeBaseFailed,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoUpstreamMapping => "no upstream mapping",
            Self::CloneFailed => "clone failed",
            Self::FetchFailed => "upstream fetch failed",
            Self::MergeBaseFailed => "merge-base failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Resolved { ancestor_commit: String },
    Unresolved { reason: UnresolvedReason },
}

/// Outcome of ancestor resolution for a single dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub resolution: Resolution,
    pub is_stale: bool,
}

impl ResolutionResult {
    pub fn resolved(ancestor_commit: impl Into<String>, is_stale: bool) -> Self {
        Self {
            resolution: Resolution::Resolved {
                ancestor_commit: ancestor_commit.into(),
            },
            is_stale,
        }
    }

    pub fn unresolved(reason: UnresolvedReason, is_stale: bool) -> Self {
        Self {
            resolution: Resolution::Unresolved { reason },
            is_stale,
        }
    }

    pub fn ancestor_commit(&self) -> Option<&str> {
        match &self.resolution {
            Resolution::Resolved { ancestor_commit } => Some(ancestor_commit),
            Resolution::Unresolved { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub name: String,
    pub ancestor_commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDependency {
    pub name: String,
    pub reason: UnresolvedReason,
}

/// Aggregated output of the resolver stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionBatch {
    pub resolved: Vec<ResolvedDependency>,
    pub failed: Vec<FailedDependency>,
    pub stale: Vec<String>,
    /// Dependencies abandoned because the run was cancelled.
    pub skipped: Vec<String>,
}

impl ResolutionBatch {
    pub fn record(&mut self, name: &str, result: ResolutionResult) {
        if result.is_stale && !self.stale.iter().any(|n| n == name) {
            self.stale.push(name.to_string());
        }
        match result.resolution {
            Resolution::Resolved { ancestor_commit } => {
                self.resolved.push(ResolvedDependency {
                    name: name.to_string(),
                    ancestor_commit,
                });
            }
            Resolution::Unresolved { reason } => {
                if !self.failed.iter().any(|f| f.name == name) {
                    self.failed.push(FailedDependency {
                        name: name.to_string(),
                        reason,
                    });
                }
            }
        }
    }

    pub fn record_skipped(&mut self, name: &str) {
        if !self.skipped.iter().any(|n| n == name) {
            self.skipped.push(name.to_string());
        }
    }

    /// Sorts every list by dependency name.
    pub fn finish(mut self) -> Self {
        self.resolved.sort_by(|a, b| a.name.cmp(&b.name));
        self.failed.sort_by(|a, b| a.name.cmp(&b.name));
        self.stale.sort();
        self.skipped.sort();
        self
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.name.clone()).collect()
    }

    /// One tagged query per resolved dependency, in name order.
    pub fn queries(&self) -> Vec<CommitQuery> {
        self.resolved
            .iter()
            .map(|r| CommitQuery {
                dependency: r.name.clone(),
                commit: r.ancestor_commit.clone(),
            })
            .collect()
    }
}

/// A commit query carrying the dependency that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitQuery {
    pub dependency: String,
    pub commit: String,
}

/// One vulnerability record returned for a queried commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityFinding {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

/// Non-empty findings attributed back to their dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFindings {
    pub dependency: String,
    pub commit: String,
    pub findings: Vec<VulnerabilityFinding>,
}
