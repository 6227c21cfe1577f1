use crate::config::{AwsConfig, QueueConfig};
use crate::error::{PipelineError, Result};
use crate::filter_engine::FilterParams;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Processing task carried as the queue message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    /// Image the task refers to
    pub image_id: String,
    /// Filter token
    #[serde(default = "default_filter_type")]
    pub filter_type: String,
    #[serde(default = "default_strength")]
    pub strength: u32,
    /// Resize factor
    #[serde(default = "default_size_multiplier")]
    pub size_multiplier: f64,
}

fn default_filter_type() -> String {
    FilterParams::default().filter
}

fn default_strength() -> u32 {
    FilterParams::default().strength
}

fn default_size_multiplier() -> f64 {
    FilterParams::default().resize_factor
}

impl ProcessingTask {
    pub fn new(image_id: impl Into<String>, params: &FilterParams) -> Self {
        Self {
            image_id: image_id.into(),
            filter_type: params.filter.clone(),
            strength: params.strength,
            size_multiplier: params.resize_factor,
        }
    }

    pub fn params(&self) -> FilterParams {
        FilterParams::new(self.filter_type.clone(), self.strength, self.size_multiplier)
    }

    pub fn to_body(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PipelineError::InvalidParameters(format!("task encode: {e}")))
    }
}

/// A message handed out by [`TaskQueue::receive`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Raw message body
    pub body: String,
    /// Token for [`TaskQueue::delete`]; valid for this delivery only
    pub receipt: String,
    /// How many times the queue has handed this message out, including now
    pub receive_count: u32,
}

impl ReceivedMessage {
    /// Decode the body as a [`ProcessingTask`]
    pub fn task(&self) -> Result<ProcessingTask> {
        serde_json::from_str(&self.body)
            .map_err(|e| PipelineError::InvalidParameters(format!("malformed task body: {e}")))
    }
}

/// At-least-once task hand-off with visibility-timeout redelivery.
///
/// A received message stays hidden from other receivers for the visibility
/// window and becomes receivable again unless it is deleted in time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task
    async fn send(&self, task: &ProcessingTask) -> Result<()>;

    /// Enqueue a raw body as-is
    async fn send_body(&self, body: &str) -> Result<()>;

    /// Long-poll for up to `max_count` messages
    async fn receive(&self, max_count: i32) -> Result<Vec<ReceivedMessage>>;

    /// Remove a message for good. Call only once its effects are committed.
    async fn delete(&self, receipt: &str) -> Result<()>;
}

/// SQS-backed task queue
#[derive(Clone)]
pub struct SqsTaskQueue {
    client: SqsClient,
    queue_url: String,
    wait_time_secs: i32,
    visibility_timeout_secs: i32,
}

impl SqsTaskQueue {
    pub fn new(sdk_config: &SdkConfig, aws: &AwsConfig, config: &QueueConfig) -> Self {
        let mut builder = aws_sdk_sqs::config::Builder::from(sdk_config);
        if let Some(ref endpoint_url) = aws.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(
            queue_url = %config.queue_url,
            visibility_timeout_secs = config.visibility_timeout_secs,
            "SQS task queue initialized"
        );

        Self {
            client: SqsClient::from_conf(builder.build()),
            queue_url: config.queue_url.clone(),
            wait_time_secs: config.wait_time_secs,
            visibility_timeout_secs: config.visibility_timeout_secs,
        }
    }

    /// Same client and timings against another queue
    pub fn for_queue(&self, queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            ..self.clone()
        }
    }
}

fn unavailable<E>(action: &str, err: E) -> PipelineError
where
    E: std::error::Error + 'static,
{
    PipelineError::QueueUnavailable(format!("{action}: {}", DisplayErrorContext(&err)))
}

/// Convert an SQS message, dropping ones that cannot be acknowledged
fn to_received(message: &Message) -> Option<ReceivedMessage> {
    let receipt = message.receipt_handle()?.to_string();
    let receive_count = message
        .attributes()
        .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse().ok())
        .unwrap_or(1);

    Some(ReceivedMessage {
        body: message.body().unwrap_or_default().to_string(),
        receipt,
        receive_count,
    })
}

#[async_trait]
impl TaskQueue for SqsTaskQueue {
    #[instrument(skip(self, task), fields(image_id = %task.image_id))]
    async fn send(&self, task: &ProcessingTask) -> Result<()> {
        let body = task.to_body()?;
        self.send_body(&body).await
    }

    #[instrument(skip(self, body), fields(queue_url = %self.queue_url))]
    async fn send_body(&self, body: &str) -> Result<()> {
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| unavailable("send message", e))?;

        debug!(message_id = output.message_id().unwrap_or_default(), "Message sent");
        Ok(())
    }

    async fn receive(&self, max_count: i32) -> Result<Vec<ReceivedMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_count)
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| unavailable("receive messages", e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let received = to_received(message);
                if received.is_none() {
                    warn!(message_id = message.message_id().unwrap_or_default(), "Message has no receipt handle");
                }
                received
            })
            .collect::<Vec<_>>();

        if !messages.is_empty() {
            debug!(count = messages.len(), "Received messages");
        }
        Ok(messages)
    }

    #[instrument(skip(self, receipt))]
    async fn delete(&self, receipt: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| unavailable("delete message", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_body_layout() {
        let task = ProcessingTask::new("abc-123", &FilterParams::new("EMBOSS", 3, 0.5));
        let body: serde_json::Value = serde_json::from_str(&task.to_body().unwrap()).unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "image_id": "abc-123",
                "filter_type": "EMBOSS",
                "strength": 3,
                "size_multiplier": 0.5
            })
        );
    }

    #[test]
    fn test_task_defaults_missing_parameters() {
        let message = ReceivedMessage {
            body: r#"{"image_id": "abc-123"}"#.to_string(),
            receipt: "r-1".to_string(),
            receive_count: 1,
        };

        let task = message.task().unwrap();
        assert_eq!(task.params(), FilterParams::default());
    }

    #[test]
    fn test_malformed_body() {
        let message = ReceivedMessage {
            body: "not json".to_string(),
            receipt: "r-1".to_string(),
            receive_count: 1,
        };
        assert!(matches!(message.task(), Err(PipelineError::InvalidParameters(_))));
    }

    #[test]
    fn test_to_received_reads_receive_count() {
        let message = Message::builder()
            .message_id("m-1")
            .receipt_handle("receipt-1")
            .body(r#"{"image_id":"x"}"#)
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "3")
            .build();

        let received = to_received(&message).unwrap();
        assert_eq!(received.receipt, "receipt-1");
        assert_eq!(received.receive_count, 3);

        let no_receipt = Message::builder().message_id("m-2").body("{}").build();
        assert!(to_received(&no_receipt).is_none());
    }
}
