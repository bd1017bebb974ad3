//! Lifecycle status publication.
//!
//! Every image, region, and tile transition is published to its topic with
//! the transition's identifiers as message attributes. Only string values
//! survive as attributes; anything else is dropped rather than coerced.
//! Publication failures are logged and never fail the transition itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sns::types::MessageAttributeValue;
use osprey_common::types::{RequestContext, RequestStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusScope {
    Image,
    Region,
    Tile,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StatusMessage {
    pub job_id: String,
    pub image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_id: Option<String>,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration: Option<i64>,
    pub message: String,
}

impl StatusMessage {
    pub fn new(
        ctx: &RequestContext,
        status: RequestStatus,
        processing_duration: Option<i64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: ctx.job_id.clone(),
            image_id: ctx.image_id.clone(),
            region_id: ctx.region_id.clone(),
            tile_id: ctx.tile_id.clone(),
            status,
            processing_duration,
            message: message.into(),
        }
    }

    /// Attribute map for the topic message. Durations are stringified up
    /// front; everything non-string is then dropped.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let value = json!({
            "job_id": self.job_id,
            "image_id": self.image_id,
            "region_id": self.region_id,
            "tile_id": self.tile_id,
            "status": self.status.as_str(),
            "processing_duration": self.processing_duration.map(|d| d.to_string()),
            "message": self.message,
        });
        string_attributes(&value)
    }
}

/// Keep only the string-valued entries of a JSON object.
pub fn string_attributes(value: &Value) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    if let Some(object) = value.as_object() {
        for (key, value) in object {
            if let Some(text) = value.as_str() {
                attributes.insert(key.clone(), text.to_string());
            }
        }
    }
    attributes
}

#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, scope: StatusScope, message: &StatusMessage) -> Result<()>;
}

/// Publishes transitions to the configured SNS topics. A scope without a
/// topic is silently skipped.
pub struct SnsStatusPublisher {
    client: aws_sdk_sns::Client,
    image_topic: Option<String>,
    region_topic: Option<String>,
    tile_topic: Option<String>,
}

impl SnsStatusPublisher {
    pub fn new(
        client: aws_sdk_sns::Client,
        image_topic: Option<String>,
        region_topic: Option<String>,
        tile_topic: Option<String>,
    ) -> Self {
        Self {
            client,
            image_topic,
            region_topic,
            tile_topic,
        }
    }
}

#[async_trait]
impl StatusPublisher for SnsStatusPublisher {
    async fn publish(&self, scope: StatusScope, message: &StatusMessage) -> Result<()> {
        let topic = match scope {
            StatusScope::Image => &self.image_topic,
            StatusScope::Region => &self.region_topic,
            StatusScope::Tile => &self.tile_topic,
        };
        let Some(topic) = topic else {
            return Ok(());
        };
        let mut request = self
            .client
            .publish()
            .topic_arn(topic)
            .message(serde_json::to_string(message).context("serialize status message")?);
        for (key, value) in message.attributes() {
            request = request.message_attributes(
                key,
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(value)
                    .build()
                    .context("build message attribute")?,
            );
        }
        request
            .send()
            .await
            .with_context(|| format!("publish status to {topic}"))?;
        Ok(())
    }
}

/// Fan-out point the pipeline calls on every transition.
#[derive(Clone)]
pub struct StatusMonitor {
    publisher: Option<Arc<dyn StatusPublisher>>,
}

impl StatusMonitor {
    pub fn new(publisher: Arc<dyn StatusPublisher>) -> Self {
        Self {
            publisher: Some(publisher),
        }
    }

    pub fn disabled() -> Self {
        Self { publisher: None }
    }

    pub async fn emit(
        &self,
        scope: StatusScope,
        ctx: &RequestContext,
        status: RequestStatus,
        processing_duration: Option<i64>,
        message: &str,
    ) {
        tracing::info!(
            job_id = %ctx.job_id,
            image_id = %ctx.image_id,
            region_id = ctx.region_id.as_deref().unwrap_or(""),
            tile_id = ctx.tile_id.as_deref().unwrap_or(""),
            status = %status,
            message = message,
            "status transition"
        );
        let Some(publisher) = &self.publisher else {
            return;
        };
        let status_message = StatusMessage::new(ctx, status, processing_duration, message);
        if let Err(err) = publisher.publish(scope, &status_message).await {
            tracing::error!(error = ?err, "status publication failed");
        }
    }
}
