use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use deps_scanner::config::ScanConfig;
use deps_scanner::executor::{CancelSignal, ResolverExecutor};
use deps_scanner::manifest::{self, DefaultVars};
use deps_scanner::model::UpstreamMapping;
use deps_scanner::osv::OsvClient;
use deps_scanner::resolve::{AncestorResolver, GitCli};
use deps_scanner::scan::{ScanOutcome, ScanPipeline};

#[derive(Parser)]
#[command(name = "deps-scanner", version, about = "Scan pinned DEPS dependencies against OSV")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Flatten a DEPS manifest into sorted `url@commit` lines
    Parse {
        /// Manifest to read
        #[arg(short, long, default_value = "DEPS")]
        deps: PathBuf,

        /// Flattened list to write
        #[arg(short, long, default_value = "deps_flatten.txt")]
        output: PathBuf,
    },
    /// Resolve upstream ancestors and write a SARIF report
    Scan(ScanArgs),
}

#[derive(Args)]
struct ScanArgs {
    /// Flattened dependency list
    #[arg(short = 'd', long, default_value = "deps_flatten.txt")]
    flat_deps: PathBuf,

    /// SARIF report to write
    #[arg(short, long, default_value = "osvReport.sarif")]
    output: PathBuf,

    /// Manifest holding the upstream url mapping
    #[arg(short, long, default_value = "DEPS")]
    manifest: PathBuf,

    /// JSON file `{"name": "url"}` overriding manifest upstream urls
    #[arg(long)]
    upstream_map: Option<PathBuf>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    git_timeout_secs: Option<u64>,

    #[arg(long)]
    query_timeout_secs: Option<u64>,

    #[arg(long)]
    osv_url: Option<String>,

    /// Parent directory for temporary clones
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Leave clones on disk after the run
    #[arg(long)]
    keep_scratch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Command::Parse { deps, output } => run_parse(&deps, &output),
        Command::Scan(args) => run_scan(args).await,
    }
}

fn run_parse(deps: &Path, output: &Path) -> Result<()> {
    manifest::flatten_to(deps, output, &DefaultVars::for_host()).with_context(|| {
        format!(
            "failed to flatten {} into {}",
            deps.display(),
            output.display()
        )
    })?;
    Ok(())
}

fn load_mapping(args: &ScanArgs) -> Result<UpstreamMapping> {
    let mut mapping = if args.manifest.exists() {
        manifest::parse_manifest_file(&args.manifest, &DefaultVars::for_host())
            .with_context(|| format!("failed to parse manifest {}", args.manifest.display()))?
            .upstream
    } else {
        warn!(manifest = %args.manifest.display(), "Manifest not found, no embedded upstream urls");
        UpstreamMapping::new()
    };

    if let Some(path) = &args.upstream_map {
        let sidecar = manifest::read_upstream_json(path)
            .with_context(|| format!("failed to read upstream map {}", path.display()))?;
        mapping.merge(sidecar);
    }
    Ok(mapping)
}

fn scan_config(args: &ScanArgs) -> ScanConfig {
    let mut config = ScanConfig::from_env();
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if let Some(secs) = args.git_timeout_secs {
        config = config.with_git_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.query_timeout_secs {
        config = config.with_query_timeout(Duration::from_secs(secs));
    }
    if let Some(url) = &args.osv_url {
        config = config.with_osv_url(url.clone());
    }
    if let Some(dir) = &args.scratch_dir {
        config = config.with_scratch_root(dir.clone());
    }
    if args.keep_scratch {
        config = config.with_keep_scratch(true);
    }
    config
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let deps = manifest::read_flat_list(&args.flat_deps)
        .with_context(|| format!("failed to read {}", args.flat_deps.display()))?;
    let mapping = load_mapping(&args)?;
    let config = scan_config(&args);

    info!(
        dependencies = deps.len(),
        upstream_urls = mapping.len(),
        concurrency = config.concurrency,
        "Starting scan"
    );

    std::fs::create_dir_all(&config.scratch_root).with_context(|| {
        format!("failed to create scratch dir {}", config.scratch_root.display())
    })?;

    let cancel = CancelSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing with a partial report");
                cancel.cancel();
            }
        });
    }

    let resolver = AncestorResolver::new(Arc::new(GitCli::new(config.git_timeout)), mapping, &config);
    let executor = ResolverExecutor::new(resolver, config.concurrency).with_cancel(cancel);
    let client = OsvClient::new(config.osv_url.clone(), config.query_timeout)
        .context("failed to build OSV client")?;

    let manifest_uri = args.manifest.display().to_string();
    let outcome = ScanPipeline::new(executor, client)
        .with_manifest_uri(manifest_uri)
        .execute(&deps)
        .await
        .context("scan failed")?;

    outcome
        .report
        .write_to(&args.output)
        .with_context(|| format!("failed to write report {}", args.output.display()))?;

    print!("{}", summary(&outcome, &args.output));
    info!(duration_ms = outcome.stats.total_duration_ms, "Scan complete");

    Ok(())
}

/// Run summary printed after the report is written. Unresolved and stale
/// lines are always present so an empty list reads as "none".
fn summary(outcome: &ScanOutcome, output: &Path) -> String {
    let batch = &outcome.batch;
    let mut out = format!("Report written to {}\n", output.display());
    out.push_str(&format!(
        "  {} dependencies, {} resolved, {} vulnerabilities ({} findings)\n",
        outcome.stats.dependencies,
        batch.resolved.len(),
        outcome.report.rules().len(),
        outcome.report.results().len()
    ));
    if batch.failed.is_empty() {
        out.push_str("  Unresolved: none\n");
    } else {
        out.push_str("  Unresolved:\n");
        for failed in &batch.failed {
            out.push_str(&format!("    {} ({})\n", failed.name, failed.reason));
        }
    }
    out.push_str(&format!(
        "  Stale (pinned over a year ago): {}\n",
        list_or_none(&batch.stale)
    ));
    if !batch.skipped.is_empty() {
        out.push_str(&format!("  Skipped (interrupted): {}\n", batch.skipped.join(", ")));
    }
    out
}

fn list_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deps_scanner::{build_report, ResolutionBatch, ResolutionResult, ScanStats, UnresolvedReason};

    fn outcome(batch: ResolutionBatch) -> ScanOutcome {
        ScanOutcome {
            report: build_report(&[], &batch, "DEPS"),
            batch,
            stats: ScanStats::default(),
        }
    }

    #[test]
    fn test_summary_lists_none_when_clean() {
        let text = summary(&outcome(ResolutionBatch::default()), Path::new("out.sarif"));
        assert!(text.contains("  Unresolved: none\n"));
        assert!(text.contains("  Stale (pinned over a year ago): none\n"));
        assert!(!text.contains("Skipped"));
    }

    #[test]
    fn test_summary_lists_problems() {
        let mut batch = ResolutionBatch::default();
        batch.record(
            "zlib",
            ResolutionResult::unresolved(UnresolvedReason::FetchFailed, true),
        );
        let text = summary(&outcome(batch), Path::new("out.sarif"));
        assert!(text.contains("  Unresolved:\n    zlib ("));
        assert!(text.contains("  Stale (pinned over a year ago): zlib\n"));
    }
}
