pub mod config;
pub mod executor;
pub mod manifest;
pub mod model;
pub mod osv;
pub mod report;
pub mod resolve;
pub mod scan;
pub mod traits;

// Re-export common types for convenience
pub use config::ScanConfig;
pub use executor::{CancelSignal, ResolverExecutor};
pub use manifest::{flatten_to, parse_manifest, parse_manifest_file, DefaultVars, Manifest};
pub use model::*;
pub use osv::OsvClient;
pub use report::{build_report, Report};
pub use resolve::{AncestorResolver, GitCli};
pub use scan::{ScanOutcome, ScanPipeline, ScanStats};
pub use traits::*;
