//! Metrics ingestion pipeline
//!
//! One poll of one target runs fetch, validate, evaluate, persist (with
//! retention pruning in the same transaction) and finally notify when the
//! target just entered a warning state.
//!
//! ## Notification edge
//!
//! The notifier fires only on the transition from "no active warning" to
//! "active warning", judged against the target's `last_warning` as it was
//! before this poll. A target that stays in warning does not notify again;
//! a target that recovers and warns again does.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::MetricsPayload;
use crate::alerts::{Notifier, NotifyError, collect_summaries};
use crate::discord::truncate;
use crate::storage::{
    IngestionRecord, Retention, SnapshotRow, StorageBackend, StorageError, StorageResult, Target,
    warning_summary,
};
use crate::thresholds::{Thresholds, evaluate, recalculate_latest_warnings};

/// Characters of an error body kept in upstream error messages.
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Transport failure, timeout or non-2xx answer from the agent
    #[error("agent unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The agent answered but the body is not a usable metrics payload
    #[error("invalid agent payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A decoded agent answer together with the untouched `metrics` object.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub payload: MetricsPayload,
    pub raw: Value,
}

/// HTTP client for the agent `GET /metrics` endpoint.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
}

impl AgentClient {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    #[instrument(skip(self, token))]
    pub async fn fetch_metrics(&self, base_url: &str, token: &str) -> Result<AgentReport, IngestError> {
        let url = format!("{}/metrics", base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| IngestError::UpstreamUnavailable(format!("could not reach agent: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::UpstreamUnavailable(format!(
                "agent responded with {}: {}",
                status.as_u16(),
                truncate(&body, ERROR_BODY_LIMIT)
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| IngestError::UpstreamUnavailable(format!("could not read response: {e}")))?;

        parse_report(&body)
    }
}

/// Validate an agent response body and decode its `metrics` object.
pub fn parse_report(body: &[u8]) -> Result<AgentReport, IngestError> {
    let document: Value = serde_json::from_slice(body)
        .map_err(|e| IngestError::InvalidPayload(format!("response is not JSON: {e}")))?;

    let raw = match document.get("metrics") {
        Some(Value::Object(fields)) if !fields.is_empty() => Value::Object(fields.clone()),
        _ => {
            return Err(IngestError::InvalidPayload(
                "payload missing 'metrics'".to_string(),
            ));
        }
    };

    let payload = MetricsPayload::deserialize(&raw)
        .map_err(|e| IngestError::InvalidPayload(format!("metrics not decodable: {e}")))?;

    Ok(AgentReport { payload, raw })
}

pub struct Ingestor {
    client: AgentClient,
    storage: Arc<dyn StorageBackend>,
    notifier: Option<Arc<dyn Notifier>>,
    thresholds: RwLock<Thresholds>,
    retention: Retention,
}

impl Ingestor {
    pub fn new(client: AgentClient, storage: Arc<dyn StorageBackend>, retention: Retention) -> Self {
        Self {
            client,
            storage,
            notifier: None,
            thresholds: RwLock::new(Thresholds::default()),
            retention,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub async fn thresholds(&self) -> Thresholds {
        *self.thresholds.read().await
    }

    /// Swap the thresholds and re-evaluate the newest snapshot of every target.
    pub async fn update_thresholds(&self, thresholds: Thresholds) -> StorageResult<usize> {
        *self.thresholds.write().await = thresholds;
        recalculate_latest_warnings(self.storage.as_ref(), &thresholds).await
    }

    /// Poll `target` once and persist the result.
    #[instrument(skip(self, target), fields(target = %target.name))]
    pub async fn ingest(&self, target: &Target) -> Result<SnapshotRow, IngestError> {
        let report = self
            .client
            .fetch_metrics(&target.base_url, &target.api_token)
            .await?;

        let thresholds = self.thresholds().await;
        let warnings = evaluate(&report.payload, &thresholds);

        let was_warning = target.has_active_warning();
        let is_warning = !warnings.is_empty();

        let record = IngestionRecord {
            last_warning: warning_summary(&warnings),
            snapshot: SnapshotRow::from_payload(target.id, &report.payload, warnings, report.raw),
            seen_at: Utc::now(),
            retention: self.retention,
        };
        let stored = self.storage.commit_ingestion(record).await?;

        debug!(
            "stored snapshot {} with {} warnings",
            stored.id,
            stored.warnings.len()
        );

        if is_warning && !was_warning {
            info!("target entered warning state");
            if let Err(e) = self.notify().await {
                warn!("failed to send warning notification: {}", e);
            }
        }

        Ok(stored)
    }

    async fn notify(&self) -> Result<(), NotifyError> {
        let Some(notifier) = &self.notifier else {
            return Ok(());
        };
        let summaries = collect_summaries(self.storage.as_ref()).await?;
        notifier.send_warning_summary(&summaries).await
    }

    /// Reload the target and ingest it, never failing.
    ///
    /// A schema mismatch triggers one schema repair and one retry. Every
    /// other failure is logged and reported as `None`.
    #[instrument(skip(self))]
    pub async fn ingest_safely(&self, target_id: i64) -> Option<SnapshotRow> {
        let target = match self.storage.get_target(target_id).await {
            Ok(Some(target)) if target.is_active => target,
            Ok(Some(target)) => {
                debug!("skipping inactive target {}", target.name);
                return None;
            }
            Ok(None) => {
                warn!("target {} no longer exists", target_id);
                return None;
            }
            Err(e) => {
                warn!("could not load target {}: {}", target_id, e);
                return None;
            }
        };

        match self.ingest(&target).await {
            Ok(snapshot) => Some(snapshot),
            Err(IngestError::Storage(StorageError::SchemaMismatch(message))) => {
                warn!(
                    "schema mismatch while ingesting {}: {}; repairing",
                    target.name, message
                );
                match self.storage.repair_schema().await {
                    Ok(added) => info!("schema repaired, added columns: {:?}", added),
                    Err(e) => {
                        error!("schema repair failed: {}", e);
                        return None;
                    }
                }
                match self.ingest(&target).await {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        warn!("ingestion for {} failed after schema repair: {}", target.name, e);
                        None
                    }
                }
            }
            Err(e @ (IngestError::UpstreamUnavailable(_) | IngestError::InvalidPayload(_))) => {
                warn!("ingestion for {} failed: {}", target.name, e);
                None
            }
            Err(e) => {
                error!("unexpected storage error for {}: {}", target.name, e);
                None
            }
        }
    }
}
