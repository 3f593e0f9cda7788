//! Upstream metadata fetcher
//!
//! The metadata endpoint (Gerrit style `?format=JSON`) answers with a single
//! anti-XSSI line such as `)]}'` followed by a JSON object keyed by repository
//! name:
//!
//! ```text
//! )]}'
//! {"go":{"name":"go","branches":{"master":"4f1c..."}},"tools":{...}}
//! ```
//!
//! Every failure is reported as `None`: the caller skips the cycle and tries
//! again on the next tick.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Anything that can report the current head of each repository
#[async_trait]
pub trait HeadSource: Send + Sync {
    /// Map of repository name to commit, or `None` if nothing usable was fetched
    async fn fetch(&self) -> Option<HashMap<String, String>>;
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    #[serde(default)]
    branches: HashMap<String, String>,
}

/// Decode a metadata body into `repo -> commit` for `branch`.
///
/// Repositories without that branch are left out.
pub fn parse_meta_body(body: &[u8], branch: &str) -> Option<HashMap<String, String>> {
    let newline = body.iter().position(|b| *b == b'\n')?;
    let json = &body[newline + 1..];

    let projects: HashMap<String, ProjectInfo> = match serde_json::from_slice(json) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "Malformed metadata body");
            return None;
        }
    };

    Some(
        projects
            .into_iter()
            .filter_map(|(name, info)| {
                info.branches
                    .get(branch)
                    .map(|commit| (name, commit.clone()))
            })
            .collect(),
    )
}

/// Fetches repository heads over HTTP
pub struct MetadataFetcher {
    url: String,
    branch: String,
    max_body_bytes: usize,
    client: reqwest::Client,
}

impl MetadataFetcher {
    pub fn new(
        url: &str,
        branch: &str,
        timeout: Duration,
        max_body_bytes: usize,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build metadata HTTP client: {}", e))?;

        Ok(Self {
            url: url.to_string(),
            branch: branch.to_string(),
            max_body_bytes,
            client,
        })
    }
}

/// Read the whole body unless it is larger than `limit`
async fn read_capped(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Option<Vec<u8>>, reqwest::Error> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Ok(None);
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Ok(None);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Some(body))
}

#[async_trait]
impl HeadSource for MetadataFetcher {
    async fn fetch(&self) -> Option<HashMap<String, String>> {
        let response = match self.client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Metadata request failed");
                return None;
            }
        };

        let status = response.status();

        // Read to EOF even on bad status so the connection goes back to the pool
        let body = match read_capped(response, self.max_body_bytes).await {
            Ok(Some(b)) => b,
            Ok(None) => {
                warn!(url = %self.url, limit = self.max_body_bytes, "Metadata body too large");
                return None;
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Failed to read metadata body");
                return None;
            }
        };

        if status != reqwest::StatusCode::OK {
            debug!(url = %self.url, status = status.as_u16(), "Metadata request returned non-200");
            return None;
        }

        parse_meta_body(&body, &self.branch)
    }
}
