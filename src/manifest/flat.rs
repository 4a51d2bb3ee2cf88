//! Plain-text flattened dependency list: one `url@commit` per line.

use std::path::Path;
use tracing::warn;

use super::warn_name_collisions;
use crate::model::DependencyDeclaration;
use crate::traits::ManifestError;

/// Parses a flattened list. Blank lines and `#` comments are ignored, lines
/// pinned to a tag are skipped with a warning, and the result is sorted by
/// name.
pub fn parse_flat_list(content: &str) -> Result<Vec<DependencyDeclaration>, ManifestError> {
    let mut deps = Vec::new();
    let lines = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'));
    for line in lines {
        match DependencyDeclaration::parse(line) {
            Ok(dep) => deps.push(dep),
            Err(ManifestError::UnsupportedPin { entry, pin }) => {
                warn!(entry = %entry, pin = %pin, "Skipping dependency not pinned to a commit");
            }
            Err(e) => return Err(e),
        }
    }
    deps.sort();
    warn_name_collisions(&deps);
    Ok(deps)
}

pub fn read_flat_list(path: &Path) -> Result<Vec<DependencyDeclaration>, ManifestError> {
    let content = std::fs::read_to_string(path)?;
    parse_flat_list(&content)
}

pub fn render_flat_list(deps: &[DependencyDeclaration]) -> String {
    let mut sorted: Vec<&DependencyDeclaration> = deps.iter().collect();
    sorted.sort();
    sorted.iter().map(|d| format!("{}\n", d)).collect()
}

pub fn write_flat_list(path: &Path, deps: &[DependencyDeclaration]) -> std::io::Result<()> {
    std::fs::write(path, render_flat_list(deps))
}
