//! Tracker HTTP client
//!
//! Thin, typed wrapper over the tracker's REST API. All operations are
//! scoped to one project. Pagination is handled internally; callers see
//! plain vectors bounded by a per-call soft cap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::datasets::DatasetRow;
use crate::traces::Trace;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 100;
/// Soft cap on traces pulled in one call, so a backlog cannot stall a tick.
pub const TRACE_FETCH_CAP: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tracker rate limited the request")]
    RateLimited,
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

impl TrackerError {
    /// Rate limits get their own worker policy (enter WAITING); everything
    /// else is a plain transient failure.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TrackerError::RateLimited)
    }
}

/// A prompt as stored in the tracker's registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptRecord {
    pub hash: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct TracePage {
    traces: Vec<Trace>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct RowPage {
    rows: Vec<DatasetRow>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ExperimentCreated {
    experiment_ref: String,
}

#[derive(Clone)]
pub struct TrackerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    project: String,
}

impl TrackerClient {
    pub fn new(base_url: &str, api_key: &str, project: &str) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("autotune/0.1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            project: project.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/projects/{}/{}", self.base_url, self.project, path)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, TrackerError> {
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TrackerError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TrackerError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// Fetch traces with `created_at > cursor`, oldest first, optionally
    /// restricted to one source experiment. Bounded by [`TRACE_FETCH_CAP`].
    pub async fn fetch_traces_since(
        &self,
        cursor: Option<DateTime<Utc>>,
        source_experiment: Option<&str>,
    ) -> Result<Vec<Trace>, TrackerError> {
        let mut traces: Vec<Trace> = Vec::new();
        let mut page_cursor: Option<String> = None;

        loop {
            let mut params: Vec<(&str, String)> =
                vec![("limit", PAGE_SIZE.to_string()), ("order", "created_at".to_string())];
            if let Some(since) = cursor {
                params.push(("since", since.to_rfc3339()));
            }
            if let Some(exp) = source_experiment {
                if !exp.is_empty() {
                    params.push(("experiment", exp.to_string()));
                }
            }
            if let Some(ref pc) = page_cursor {
                params.push(("cursor", pc.clone()));
            }

            let response = self
                .client
                .get(self.url("traces"))
                .bearer_auth(&self.api_key)
                .query(&params)
                .send()
                .await?;
            let page: TracePage = self.check(response).await?.json().await?;

            debug!(count = page.traces.len(), "fetched trace page");
            traces.extend(page.traces);

            if traces.len() >= TRACE_FETCH_CAP {
                warn!(cap = TRACE_FETCH_CAP, "trace fetch hit soft cap, truncating");
                traces.truncate(TRACE_FETCH_CAP);
                break;
            }
            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        traces.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(traces)
    }

    /// Load every row of a frozen dataset. `(name, version)` is immutable on
    /// the tracker, so the result can be held for the whole run.
    pub async fn fetch_dataset(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Vec<DatasetRow>, TrackerError> {
        let mut rows: Vec<DatasetRow> = Vec::new();
        let mut page_cursor: Option<String> = None;

        loop {
            let mut params: Vec<(&str, String)> = vec![("limit", PAGE_SIZE.to_string())];
            if let Some(v) = version {
                params.push(("version", v.to_string()));
            }
            if let Some(ref pc) = page_cursor {
                params.push(("cursor", pc.clone()));
            }

            let response = self
                .client
                .get(self.url(&format!("datasets/{name}/rows")))
                .bearer_auth(&self.api_key)
                .query(&params)
                .send()
                .await?;
            let page: RowPage = self.check(response).await?.json().await?;
            rows.extend(page.rows);

            match page.next_cursor {
                Some(next) => page_cursor = Some(next),
                None => break,
            }
        }

        Ok(rows)
    }

    /// Create an experiment handle and attach the scored rows to it.
    pub async fn write_experiment(
        &self,
        name: &str,
        variant: &str,
        split: &str,
        rows: &serde_json::Value,
    ) -> Result<String, TrackerError> {
        let body = serde_json::json!({
            "name": name,
            "variant": variant,
            "split": split,
            "rows": rows,
        });
        let response = self
            .client
            .post(self.url("experiments"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let created: ExperimentCreated = self.check(response).await?.json().await?;
        Ok(created.experiment_ref)
    }

    /// Record a candidate or promoted prompt in the registry.
    pub async fn publish_prompt(
        &self,
        hash: &str,
        text: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), TrackerError> {
        let body = serde_json::json!({
            "hash": hash,
            "text": text,
            "metadata": metadata,
        });
        let response = self
            .client
            .post(self.url("prompts"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    /// The prompt currently live for this project, if any has been recorded.
    pub async fn fetch_current_prompt(&self) -> Result<Option<PromptRecord>, TrackerError> {
        let response = self
            .client
            .get(self.url("prompts/current"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let record: PromptRecord = self.check(response).await?.json().await?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = TrackerClient::new("https://tracker.example.com/", "k", "floodline").unwrap();
        assert_eq!(
            client.url("traces"),
            "https://tracker.example.com/v1/projects/floodline/traces"
        );
    }

    #[test]
    fn test_rate_limit_classification() {
        assert!(TrackerError::RateLimited.is_rate_limit());
        let api = TrackerError::Api {
            status: 503,
            message: "down".to_string(),
        };
        assert!(!api.is_rate_limit());
    }
}
