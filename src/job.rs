//! Job submission, bounded polling, and artifact retrieval for the
//! graph-based backend.
//!
//! One generation job moves through `Idle → Submitted → Polling` and ends in
//! exactly one of four terminal states: completed, timed out, aborted, or
//! failed. Submission failures surface as errors directly; the other three
//! terminals are the [`JobOutcome`] variants. Transient poll failures are
//! absorbed (the loop continues); every other failure propagates.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AbortStage, ProviderError, Result};
use crate::types::ArtifactRef;
use crate::workflow::{WorkflowGraph, SAVE_NODE_ID};

/// Fixed inter-poll delay.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll attempt ceiling (a 30-second budget at the 500 ms cadence).
pub const MAX_POLL_ATTEMPTS: u32 = 60;

/// Terminal state of one poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Artifacts are ready, in backend-reported order.
    Completed(Vec<ArtifactRef>),
    /// The attempt ceiling was exhausted without artifacts.
    TimedOut { attempts: u32, elapsed_secs: f64 },
    /// The cancellation signal was observed.
    Aborted(AbortStage),
}

/// Drives one generation job against the graph backend. Owns the job handle
/// for the lifetime of a single call; nothing is persisted across calls.
pub(crate) struct JobRunner<'a> {
    pub http: &'a Client,
    pub base_url: &'a str,
    pub client_id: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl JobRunner<'_> {
    /// Run a workflow to completion: submit, poll, download. Returns raw
    /// image bytes in artifact order.
    pub async fn run(
        &self,
        workflow: &WorkflowGraph,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(ProviderError::aborted(AbortStage::BeforeSubmission));
        }

        let prompt_id = self.submit(workflow).await?;

        let artifacts = match self.poll(&prompt_id, cancel).await {
            JobOutcome::Completed(artifacts) => artifacts,
            JobOutcome::TimedOut {
                attempts,
                elapsed_secs,
            } => {
                return Err(ProviderError::Timeout {
                    attempts,
                    elapsed_secs,
                })
            }
            JobOutcome::Aborted(stage) => return Err(ProviderError::aborted(stage)),
        };

        if cancel.is_cancelled() {
            return Err(ProviderError::aborted(AbortStage::BeforeDownload));
        }

        self.download_all(&artifacts, cancel).await
    }

    fn apply_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (name, value) in self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// Submit the workflow. Returns the backend's job handle (`prompt_id`).
    pub async fn submit(&self, workflow: &WorkflowGraph) -> Result<String> {
        let url = format!("{}/prompt", self.base_url);
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": self.client_id,
        });

        let resp = self
            .apply_headers(self.http.post(&url))
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::network(
                    format!(
                        "Cannot connect to backend at {} - is the service running?",
                        self.base_url
                    ),
                    e,
                )
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::network("Failed to parse submission response", e))?;

        json.get("prompt_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| ProviderError::InvalidResponse("Response missing prompt_id".into()))
    }

    /// Bounded poll loop. Cancellation is checked before every attempt and
    /// interrupts the inter-poll wait; transient request failures count as
    /// a no-result attempt.
    pub async fn poll(&self, prompt_id: &str, cancel: &CancellationToken) -> JobOutcome {
        let started = Instant::now();
        let mut attempts = 0;

        while attempts < self.max_poll_attempts {
            if cancel.is_cancelled() {
                return JobOutcome::Aborted(AbortStage::DuringPolling);
            }

            if let Some(artifacts) = self.poll_once(prompt_id).await {
                if !artifacts.is_empty() {
                    // Exit immediately; no trailing delay.
                    return JobOutcome::Completed(artifacts);
                }
            }

            attempts += 1;
            if attempts == self.max_poll_attempts {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return JobOutcome::Aborted(AbortStage::DuringPolling);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        JobOutcome::TimedOut {
            attempts,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }

    /// One status query. Returns `None` when the job has no output yet or
    /// the request failed (both mean "try again").
    async fn poll_once(&self, prompt_id: &str) -> Option<Vec<ArtifactRef>> {
        let url = format!("{}/history/{}", self.base_url, prompt_id);
        let resp = self
            .apply_headers(self.http.get(&url))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;

        if !resp.status().is_success() {
            return None;
        }

        let json: Value = resp.json().await.ok()?;
        let images = json
            .get(prompt_id)?
            .pointer(&format!("/outputs/{}/images", SAVE_NODE_ID))?
            .clone();
        serde_json::from_value(images).ok()
    }

    /// Fetch every artifact concurrently, recombining results in the
    /// original descriptor order. A single failed download fails the whole
    /// stage; no partial result set is returned.
    pub async fn download_all(
        &self,
        artifacts: &[ArtifactRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>> {
        try_join_all(
            artifacts
                .iter()
                .map(|artifact| self.download(artifact, cancel)),
        )
        .await
    }

    async fn download(&self, artifact: &ArtifactRef, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/view", self.base_url),
            &[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ],
        )
        .map_err(|e| ProviderError::InvalidResponse(format!("Bad artifact URL: {}", e)))?;

        let request = self
            .apply_headers(self.http.get(url))
            .timeout(Duration::from_secs(30));

        let resp = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProviderError::aborted(AbortStage::BeforeDownload));
            }
            resp = request.send() => resp.map_err(|e| {
                ProviderError::network(
                    format!("Failed to download image {}", artifact.filename),
                    e,
                )
            })?,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Network {
                context: format!(
                    "Failed to download image: {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                ),
                source: None,
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::network("Failed to read image bytes", e))?;
        Ok(bytes.to_vec())
    }
}
