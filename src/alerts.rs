use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::{Alert, Webhook};
use crate::discord::DiscordManager;
use crate::storage::{StorageBackend, StorageResult};

pub const WARNING_HEADER: &str = "Server Monitor Warnings";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification endpoint responded with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("could not collect warning summaries: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Current warnings of one target, as shown in a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSummary {
    pub name: String,
    pub warnings: Vec<String>,
}

/// Outbound alert channel. Called when a target enters a warning state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_warning_summary(&self, summaries: &[TargetSummary]) -> Result<(), NotifyError>;
}

/// Plain text rendering of the warning summary.
pub fn build_warning_message(summaries: &[TargetSummary]) -> String {
    let mut lines = vec![format!("*{WARNING_HEADER}*")];
    let mut any_warning = false;

    for summary in summaries.iter().filter(|s| !s.warnings.is_empty()) {
        any_warning = true;
        lines.push(format!("\n*{}*", summary.name));
        lines.extend(summary.warnings.iter().map(|w| format!("⚠️ {w}")));
    }

    if !any_warning {
        lines.push("\nAll systems nominal ✅".to_string());
    }
    lines.join("\n")
}

/// Warnings of every target, taken from each target's newest snapshot.
pub async fn collect_summaries(storage: &dyn StorageBackend) -> StorageResult<Vec<TargetSummary>> {
    let targets = storage.list_targets().await?;
    let ids: Vec<i64> = targets.iter().map(|target| target.id).collect();
    let mut latest = storage.latest_snapshots(&ids).await?;

    Ok(targets
        .into_iter()
        .map(|target| TargetSummary {
            warnings: latest
                .remove(&target.id)
                .map(|snapshot| snapshot.warnings)
                .unwrap_or_default(),
            name: target.name,
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct AlertManager {
    client: Client,
    alert: Alert,
    discord_manager: DiscordManager,
}

impl AlertManager {
    pub fn new(alert: Alert) -> Self {
        let client = Client::new();
        Self {
            discord_manager: DiscordManager::new(client.clone()),
            client,
            alert,
        }
    }

    #[instrument(skip(self, webhook, summaries))]
    async fn send_webhook_alert(
        &self,
        webhook: &Webhook,
        summaries: &[TargetSummary],
    ) -> Result<(), NotifyError> {
        let targets: Vec<_> = summaries
            .iter()
            .filter(|s| !s.warnings.is_empty())
            .map(|s| json!({"name": s.name, "warnings": s.warnings}))
            .collect();
        let payload = json!({
            "message": build_warning_message(summaries),
            "targets": targets,
            "timestamp": Utc::now().to_rfc3339()
        });

        let response = self.client.post(&webhook.url).json(&payload).send().await?;
        let status = response.status();
        if status.is_success() {
            info!("Successfully sent webhook alert");
            Ok(())
        } else {
            error!("Webhook alert failed with status: {}", status);
            let body = response.text().await.unwrap_or_default();
            Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: crate::discord::truncate(&body, 200),
            })
        }
    }
}

#[async_trait]
impl Notifier for AlertManager {
    async fn send_warning_summary(&self, summaries: &[TargetSummary]) -> Result<(), NotifyError> {
        match &self.alert {
            Alert::Discord(discord) => {
                let message = self.discord_manager.build_warning_message(discord, summaries);
                self.discord_manager.send_message(discord, &message).await
            }
            Alert::Webhook(webhook) => self.send_webhook_alert(webhook, summaries).await,
        }
    }
}
