use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sqs::Client;

use super::{ReceivedMessage, RequestQueue};

#[derive(Clone)]
pub struct SqsRequestQueue {
    client: Client,
    queue_url: String,
}

impl SqsRequestQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl RequestQueue for SqsRequestQueue {
    async fn receive(
        &self,
        wait: Duration,
        visibility: Duration,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.clamp(1, 10) as i32)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .visibility_timeout(visibility.as_secs() as i32)
            .send()
            .await
            .with_context(|| format!("receive from {}", self.queue_url))?;

        let mut messages = Vec::new();
        for message in response.messages() {
            let (Some(receipt), Some(body)) = (message.receipt_handle(), message.body()) else {
                tracing::warn!(queue = %self.queue_url, "discarding message without body or receipt");
                continue;
            };
            messages.push(ReceivedMessage {
                receipt: receipt.to_string(),
                body: body.to_string(),
            });
        }
        Ok(messages)
    }

    async fn finish(&self, receipt: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .with_context(|| format!("delete message from {}", self.queue_url))?;
        Ok(())
    }

    async fn reset(&self, receipt: &str, visibility: Duration) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .visibility_timeout(visibility.as_secs() as i32)
            .send()
            .await
            .with_context(|| format!("reset message visibility on {}", self.queue_url))?;
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<()> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .with_context(|| format!("send message to {}", self.queue_url))?;
        Ok(())
    }
}
