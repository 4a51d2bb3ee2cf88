//! Manifest module - reads `DEPS`-style dependency manifests as data.
//!
//! The manifest is tokenized, parsed into a small expression tree and then
//! evaluated with `Var(...)` as the only lookup form:
//! - **Parsing**: [`parse_manifest`] / [`parse_manifest_file`]
//! - **Variables**: [`DefaultVars`] supplies `host_cpu` / `host_os`
//! - **Flattened lists**: [`flat`] reads and writes `url@commit` lines

pub mod eval;
pub mod flat;
mod lexer;
mod parser;
mod span;

use std::path::Path;
use tracing::{debug, info, warn};

use crate::model::{name_collisions, DependencyDeclaration, UpstreamMapping};
use crate::traits::ManifestError;

pub use eval::{Bindings, DefaultVars, Value};
pub use flat::{parse_flat_list, read_flat_list, render_flat_list, write_flat_list};

/// Key of the `vars` sub-mapping holding upstream urls.
pub const UPSTREAM_URLS_VAR: &str = "upstream_urls";

/// Prefix of flat `vars` entries naming an upstream url (older layout).
pub const UPSTREAM_VAR_PREFIX: &str = "upstream_";

/// Result of reading a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Plain git dependencies, sorted by name
    pub dependencies: Vec<DependencyDeclaration>,

    /// Upstream urls declared inside the manifest
    pub upstream: UpstreamMapping,
}

pub fn parse_manifest(source: &str, defaults: &DefaultVars) -> Result<Manifest, ManifestError> {
    let assignments = parser::parse(source)?;
    let bindings = eval::evaluate(&assignments, defaults)?;

    let dependencies = extract_dependencies(&bindings)?;
    let upstream = extract_upstream(&bindings)?;

    info!(
        dependencies = dependencies.len(),
        upstream_urls = upstream.len(),
        "Parsed manifest"
    );

    Ok(Manifest {
        dependencies,
        upstream,
    })
}

pub fn parse_manifest_file(path: &Path, defaults: &DefaultVars) -> Result<Manifest, ManifestError> {
    let source = std::fs::read_to_string(path)?;
    parse_manifest(&source, defaults)
}

/// Parses `manifest` and writes its flattened dependency list to `output`.
/// Nothing is written when the manifest does not parse.
pub fn flatten_to(
    manifest: &Path,
    output: &Path,
    defaults: &DefaultVars,
) -> Result<Vec<DependencyDeclaration>, ManifestError> {
    let parsed = parse_manifest_file(manifest, defaults)?;
    write_flat_list(output, &parsed.dependencies)?;
    info!(
        dependencies = parsed.dependencies.len(),
        output = %output.display(),
        "Wrote flattened dependency list"
    );
    Ok(parsed.dependencies)
}

/// Logs dependencies that end up sharing a name.
pub(crate) fn warn_name_collisions(deps: &[DependencyDeclaration]) {
    for name in name_collisions(deps) {
        let mirrors: Vec<&str> = deps
            .iter()
            .filter(|d| d.name == name)
            .map(|d| d.mirror_url.as_str())
            .collect();
        warn!(dependency = %name, mirrors = ?mirrors, "Different mirrors share a dependency name");
    }
}

fn extract_dependencies(bindings: &Bindings) -> Result<Vec<DependencyDeclaration>, ManifestError> {
    let entries = match bindings.get("deps") {
        Some(Value::Map(entries)) => entries,
        Some(_) => {
            return Err(ManifestError::InvalidStructure(
                "`deps` must be a mapping".to_string(),
            ))
        }
        None => return Ok(Vec::new()),
    };

    let mut deps = Vec::new();
    for (path, value) in entries {
        match value {
            Value::Str(spec) => {
                match DependencyDeclaration::parse(spec) {
                    Ok(dep) => deps.push(dep),
                    Err(ManifestError::UnsupportedPin { pin, .. }) => {
                        warn!(entry = %path, pin = %pin, "Skipping dependency not pinned to a commit");
                    }
                    Err(ManifestError::InvalidDependency { entry, reason }) => {
                        return Err(ManifestError::InvalidDependency {
                            entry,
                            reason: format!("{} (deps entry `{}`)", reason, path),
                        });
                    }
                    Err(other) => return Err(other),
                }
            }
            // cipd packages, gcs objects and conditional entries
            _ => debug!(entry = %path, "Skipping non-git dependency"),
        }
    }

    deps.sort();
    warn_name_collisions(&deps);
    Ok(deps)
}

fn extract_upstream(bindings: &Bindings) -> Result<UpstreamMapping, ManifestError> {
    let mut mapping = UpstreamMapping::new();
    let vars = match bindings.get("vars") {
        Some(Value::Map(entries)) => entries,
        _ => return Ok(mapping),
    };

    for (key, value) in vars {
        if key == UPSTREAM_URLS_VAR {
            continue;
        }
        if let (Some(name), Value::Str(url)) = (key.strip_prefix(UPSTREAM_VAR_PREFIX), value) {
            if !name.is_empty() {
                mapping.insert(name, url.clone());
            }
        }
    }

    // The sub-mapping wins over the flat layout.
    match vars.iter().find(|(k, _)| k == UPSTREAM_URLS_VAR) {
        Some((_, Value::Map(entries))) => {
            for (name, url) in entries {
                let url = url.as_str().ok_or_else(|| {
                    ManifestError::InvalidMapping(format!(
                        "upstream url for `{}` is not a string",
                        name
                    ))
                })?;
                mapping.insert(name.clone(), url);
            }
        }
        Some(_) => {
            return Err(ManifestError::InvalidMapping(format!(
                "`vars.{}` must be a mapping",
                UPSTREAM_URLS_VAR
            )))
        }
        None => {}
    }

    Ok(mapping)
}

/// Loads the standalone JSON form of the upstream mapping.
pub fn read_upstream_json(path: &Path) -> Result<UpstreamMapping, ManifestError> {
    let content = std::fs::read_to_string(path)?;
    UpstreamMapping::from_json(&content).map_err(|e| ManifestError::InvalidMapping(e.to_string()))
}
