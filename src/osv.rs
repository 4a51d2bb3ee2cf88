//! OSV batch query client.
//!
//! Queries travel through the crate as [`CommitQuery`] values tagged with
//! their dependency. Only [`OsvClient::query_chunk`] strips the tag to build
//! the wire request, and it re-attaches the tag to each result before
//! returning.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::model::{CommitQuery, DependencyFindings, VulnerabilityFinding};
use crate::traits::{QueryError, VulnerabilitySource};

/// Largest number of queries accepted by one `querybatch` call.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Web page for a finding.
pub fn vulnerability_url(id: &str) -> String {
    format!("https://osv.dev/vulnerability/{}", id)
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    queries: Vec<WireQuery<'a>>,
}

#[derive(Debug, Serialize)]
struct WireQuery<'a> {
    commit: &'a str,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<WireResult>,
}

#[derive(Debug, Default, Deserialize)]
struct WireResult {
    #[serde(default)]
    vulns: Vec<VulnerabilityFinding>,
}

pub struct OsvClient {
    client: reqwest::Client,
    base_url: String,
}

impl OsvClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, QueryError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("deps-scanner/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn query_chunk(&self, chunk: &[CommitQuery]) -> Result<Vec<DependencyFindings>, QueryError> {
        let url = format!("{}/v1/querybatch", self.base_url);
        let request = BatchRequest {
            queries: chunk
                .iter()
                .map(|q| WireQuery { commit: &q.commit })
                .collect(),
        };

        debug!(url = %url, queries = chunk.len(), "POST querybatch");
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(map_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "OSV API error");
            return Err(QueryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(map_transport)?;
        let parsed: BatchResponse = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(500).collect();
            error!(error = %e, preview = %preview, "Undecodable OSV response");
            QueryError::Malformed(e.to_string())
        })?;

        attribute(chunk, parsed.results)
    }
}

fn map_transport(e: reqwest::Error) -> QueryError {
    if e.is_timeout() {
        QueryError::Timeout
    } else {
        QueryError::Http(e)
    }
}

/// Pairs each result with the query at the same position and drops empty
/// placeholders. A length mismatch means the pairing cannot be trusted.
fn attribute(
    queries: &[CommitQuery],
    results: Vec<WireResult>,
) -> Result<Vec<DependencyFindings>, QueryError> {
    // An empty `results` array is how the service reports "nothing found".
    if results.is_empty() {
        return Ok(Vec::new());
    }
    if results.len() != queries.len() {
        return Err(QueryError::Misaligned {
            expected: queries.len(),
            got: results.len(),
        });
    }

    Ok(queries
        .iter()
        .zip(results)
        .filter_map(|(query, result)| {
            let findings: Vec<VulnerabilityFinding> = result
                .vulns
                .into_iter()
                .filter(|v| !v.id.is_empty())
                .collect();
            if findings.is_empty() {
                None
            } else {
                Some(DependencyFindings {
                    dependency: query.dependency.clone(),
                    commit: query.commit.clone(),
                    findings,
                })
            }
        })
        .collect())
}

#[async_trait]
impl VulnerabilitySource for OsvClient {
    async fn query(&self, queries: &[CommitQuery]) -> Result<Vec<DependencyFindings>, QueryError> {
        if queries.is_empty() {
            info!("No resolved commits to query");
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for chunk in queries.chunks(MAX_BATCH_SIZE) {
            out.extend(self.query_chunk(chunk).await?);
        }

        info!(
            queries = queries.len(),
            affected = out.len(),
            "OSV batch query completed"
        );
        Ok(out)
    }
}
