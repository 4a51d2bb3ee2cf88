//! SARIF 2.1.0 report assembly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::model::{DependencyFindings, ResolutionBatch, VulnerabilityFinding};
use crate::osv::vulnerability_url;
use crate::traits::ReportError;

pub const SARIF_SCHEMA: &str = "https://json.schemastore.org/sarif-2.1.0.json";
pub const SARIF_VERSION: &str = "2.1.0";
pub const TOOL_NAME: &str = "OSV Scan";
pub const TOOL_URI: &str = "https://osv.dev/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub version: String,
    pub runs: Vec<Run>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub tool: Tool,
    pub results: Vec<SarifResult>,
    pub properties: RunProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub driver: Driver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub name: String,
    pub information_uri: String,
    pub semantic_version: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub text: String,
}

impl Text {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub short_description: Text,
    pub full_description: Text,
    pub help: Text,
    pub default_configuration: Configuration,
    pub properties: RuleProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleProperties {
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SarifResult {
    pub rule_id: String,
    pub level: String,
    pub message: Text,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub physical_location: PhysicalLocation,
    pub logical_locations: Vec<LogicalLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalLocation {
    pub artifact_location: ArtifactLocation,
    pub region: Region,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub start_line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalLocation {
    pub name: String,
    pub kind: String,
}

/// Blind spots of the scan, carried in the run's property bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProperties {
    pub failed_dependencies: Vec<String>,
    pub stale_dependencies: Vec<String>,
    pub skipped_dependencies: Vec<String>,
}

impl Report {
    pub fn rules(&self) -> &[Rule] {
        self.runs
            .first()
            .map(|run| run.tool.driver.rules.as_slice())
            .unwrap_or(&[])
    }

    pub fn results(&self) -> &[SarifResult] {
        self.runs
            .first()
            .map(|run| run.results.as_slice())
            .unwrap_or(&[])
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Serializes first so that nothing is written for an unserializable
    /// report.
    pub fn write_to(&self, path: &Path) -> Result<(), ReportError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| ReportError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}

fn rule_for(finding: &VulnerabilityFinding) -> Rule {
    let modified = finding.modified.as_deref().unwrap_or("unknown");
    let full = match finding.summary.as_deref().filter(|s| !s.is_empty()) {
        Some(summary) => format!(
            "{}: {} (last modified {})",
            finding.id, summary, modified
        ),
        None => format!(
            "Vulnerability {} (last modified {})",
            finding.id, modified
        ),
    };

    Rule {
        id: finding.id.clone(),
        name: "Vulnerability".to_string(),
        short_description: Text::new(finding.id.clone()),
        full_description: Text::new(full),
        help: Text::new(format!(
            "More details in the OSV DB at: {}",
            vulnerability_url(&finding.id)
        )),
        default_configuration: Configuration {
            level: "error".to_string(),
        },
        properties: RuleProperties {
            tags: vec!["supply-chain".to_string(), "dependency".to_string()],
        },
    }
}

fn result_for(finding_id: &str, dependency: &str, commit: &str, manifest_uri: &str) -> SarifResult {
    SarifResult {
        rule_id: finding_id.to_string(),
        level: "error".to_string(),
        message: Text::new(format!(
            "Vulnerability {} affects dependency {} (upstream ancestor {})",
            finding_id, dependency, commit
        )),
        locations: vec![Location {
            physical_location: PhysicalLocation {
                artifact_location: ArtifactLocation {
                    uri: manifest_uri.to_string(),
                },
                region: Region { start_line: 1 },
            },
            logical_locations: vec![LogicalLocation {
                name: dependency.to_string(),
                kind: "module".to_string(),
            }],
        }],
    }
}

/// Builds the report: one rule per distinct finding id, one result per
/// distinct (finding, dependency, commit) triple.
pub fn build_report(
    findings: &[DependencyFindings],
    batch: &ResolutionBatch,
    manifest_uri: &str,
) -> Report {
    let mut rules: BTreeMap<String, Rule> = BTreeMap::new();
    let mut seen: BTreeSet<(&str, &str, &str)> = BTreeSet::new();
    let mut results = Vec::new();

    for entry in findings {
        for finding in &entry.findings {
            rules
                .entry(finding.id.clone())
                .or_insert_with(|| rule_for(finding));
            let key = (
                finding.id.as_str(),
                entry.dependency.as_str(),
                entry.commit.as_str(),
            );
            if seen.insert(key) {
                results.push(result_for(
                    &finding.id,
                    &entry.dependency,
                    &entry.commit,
                    manifest_uri,
                ));
            }
        }
    }
    results.sort_by(|a, b| {
        let dep = |r: &SarifResult| {
            r.locations
                .first()
                .and_then(|l| l.logical_locations.first())
                .map(|l| l.name.clone())
                .unwrap_or_default()
        };
        (a.rule_id.as_str(), dep(a), a.message.text.as_str()).cmp(&(
            b.rule_id.as_str(),
            dep(b),
            b.message.text.as_str(),
        ))
    });

    Report {
        schema: SARIF_SCHEMA.to_string(),
        version: SARIF_VERSION.to_string(),
        runs: vec![Run {
            tool: Tool {
                driver: Driver {
                    name: TOOL_NAME.to_string(),
                    information_uri: TOOL_URI.to_string(),
                    semantic_version: env!("CARGO_PKG_VERSION").to_string(),
                    rules: rules.into_values().collect(),
                },
            },
            results,
            properties: RunProperties {
                failed_dependencies: batch.failed_names(),
                stale_dependencies: batch.stale.clone(),
                skipped_dependencies: batch.skipped.clone(),
            },
        }],
    }
}
