use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::alerts::{NotifyError, TargetSummary, WARNING_HEADER};
use crate::config::Discord;

/// Discord rejects embed field values longer than this.
const FIELD_VALUE_LIMIT: usize = 1024;

const COLOR_RED: u32 = 15158332;
const COLOR_GREEN: u32 = 3066993;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscordManager {
    client: Client,
}

impl DiscordManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// One embed listing every target that currently has warnings.
    pub fn build_warning_embed(&self, summaries: &[TargetSummary]) -> Embed {
        let fields: Vec<EmbedField> = summaries
            .iter()
            .filter(|summary| !summary.warnings.is_empty())
            .map(|summary| EmbedField {
                name: summary.name.clone(),
                value: truncate(
                    &summary
                        .warnings
                        .iter()
                        .map(|warning| format!("⚠️ {warning}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    FIELD_VALUE_LIMIT,
                ),
                inline: false,
            })
            .collect();

        let (description, color) = if fields.is_empty() {
            ("All systems nominal ✅".to_string(), COLOR_GREEN)
        } else {
            (
                format!("{} target(s) reporting warnings", fields.len()),
                COLOR_RED,
            )
        };

        Embed {
            title: Some(WARNING_HEADER.to_string()),
            description: Some(description),
            color: Some(color),
            fields,
            footer: Some(EmbedFooter {
                text: format!("{} targets monitored", summaries.len()),
            }),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn build_warning_message(&self, discord: &Discord, summaries: &[TargetSummary]) -> Message {
        let mut builder = MessageBuilder::new().add_embed(self.build_warning_embed(summaries));
        if let Some(user_id) = &discord.user_id {
            builder = builder.content(format!("⚠️ <@{user_id}>"));
        }
        builder.build()
    }

    #[instrument(skip(self, discord, message))]
    pub async fn send_message(&self, discord: &Discord, message: &Message) -> Result<(), NotifyError> {
        let response = self.client.post(&discord.url).json(message).send().await?;
        let status = response.status();
        if status.is_success() {
            info!("Successfully sent Discord message");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        error!("Discord message failed with status: {}", status);
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body: truncate(&body, 200),
        })
    }
}

/// Cut `text` to at most `limit` characters.
pub(crate) fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}
