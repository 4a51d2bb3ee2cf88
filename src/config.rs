//! Runtime configuration for a scan.
//!
//! Values come from built-in defaults, then `DEPS_SCAN_*` environment
//! variables (a `.env` file is honored by the binary), then CLI flags applied
//! through the `with_*` builders.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_OSV_URL: &str = "https://api.osv.dev";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
pub const STALE_AFTER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Base url of the OSV API (without `/v1/...`)
    pub osv_url: String,

    /// Number of dependencies resolved at the same time
    pub concurrency: usize,

    /// Timeout applied to each git operation
    pub git_timeout: Duration,

    /// Timeout for each batch query request
    pub query_timeout: Duration,

    /// Pinned commits at least this old are reported as stale
    pub stale_after: Duration,

    /// Parent directory for per-dependency clones
    pub scratch_root: PathBuf,

    /// Keep clones around after the run (debugging)
    pub keep_scratch: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            osv_url: DEFAULT_OSV_URL.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            git_timeout: DEFAULT_GIT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            stale_after: STALE_AFTER,
            scratch_root: std::env::temp_dir().join("deps-scanner"),
            keep_scratch: false,
        }
    }
}

impl ScanConfig {
    /// Defaults overridden by `DEPS_SCAN_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("DEPS_SCAN_OSV_URL") {
            config.osv_url = url;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "DEPS_SCAN_CONCURRENCY") {
            config.concurrency = n.max(1);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "DEPS_SCAN_GIT_TIMEOUT_SECS") {
            config.git_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "DEPS_SCAN_QUERY_TIMEOUT_SECS") {
            config.query_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("DEPS_SCAN_SCRATCH_DIR") {
            config.scratch_root = PathBuf::from(dir);
        }
        if let Some(keep) = parse_var::<bool>(&lookup, "DEPS_SCAN_KEEP_SCRATCH") {
            config.keep_scratch = keep;
        }

        config
    }

    pub fn with_osv_url(mut self, url: impl Into<String>) -> Self {
        self.osv_url = url.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn with_keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}
