use crate::asset_store::{content_type_for, original_key, processed_key, AssetStore, Namespace};
use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::filter_engine::FilterOutput;
use crate::metadata_store::{ImageStatus, MetadataStore, RecordUpdate};
use crate::task_queue::{ProcessingTask, ReceivedMessage, TaskQueue};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Step of a task at which processing stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Lookup,
    Download,
    Filter,
    Upload,
    Complete,
    DeadLetter,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Lookup => "lookup",
            FailureStage::Download => "download",
            FailureStage::Filter => "filter",
            FailureStage::Upload => "upload",
            FailureStage::Complete => "complete",
            FailureStage::DeadLetter => "dead_letter",
        }
    }
}

/// What happened to one received message
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Processed and committed; the message was deleted
    Completed { image_id: String, format: String },
    /// Record was already completed; the message was deleted
    AlreadyCompleted { image_id: String },
    /// Left on the queue for redelivery
    Failed {
        image_id: String,
        stage: FailureStage,
        error: PipelineError,
    },
    /// Delivered too many times; the message was deleted
    Abandoned {
        image_id: Option<String>,
        attempts: u32,
    },
    /// Body is not a task; left on the queue
    Malformed { error: PipelineError },
}

impl TaskOutcome {
    fn metric_name(&self) -> &'static str {
        match self {
            TaskOutcome::Completed { .. } => "processor.tasks.completed",
            TaskOutcome::AlreadyCompleted { .. } => "processor.tasks.duplicate",
            TaskOutcome::Failed { .. } => "processor.tasks.failed",
            TaskOutcome::Abandoned { .. } => "processor.tasks.abandoned",
            TaskOutcome::Malformed { .. } => "processor.tasks.malformed",
        }
    }
}

/// Polling consumer that runs queued filter tasks one at a time
pub struct ImageWorker {
    queue: Arc<dyn TaskQueue>,
    assets: Arc<dyn AssetStore>,
    metadata: Arc<dyn MetadataStore>,
    dead_letter: Option<Arc<dyn TaskQueue>>,
    config: WorkerConfig,
    max_messages: i32,
    attempt_limit: Option<u32>,
}

impl ImageWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        assets: Arc<dyn AssetStore>,
        metadata: Arc<dyn MetadataStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            assets,
            metadata,
            dead_letter: None,
            config,
            max_messages: 10,
            attempt_limit: None,
        }
    }

    pub fn with_max_messages(mut self, max_messages: i32) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Abandon messages received more than `limit` times; `None` never abandons
    pub fn with_attempt_limit(mut self, limit: Option<u32>) -> Self {
        self.attempt_limit = limit;
        self
    }

    pub fn with_dead_letter(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    /// Poll until `shutdown` fires.
    ///
    /// Cancellation is observed only while waiting on the queue or sleeping,
    /// never in the middle of a task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            max_messages = self.max_messages,
            attempt_limit = ?self.attempt_limit,
            "Starting image worker"
        );

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(self.max_messages) => received,
            };

            let pause = match received {
                Ok(messages) if messages.is_empty() => self.config.idle_sleep(),
                Ok(messages) => {
                    self.process_all(messages).await;
                    self.config.busy_sleep()
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive from task queue");
                    metrics::counter!("processor.queue.errors").increment(1);
                    self.config.error_sleep()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Image worker stopped");
    }

    /// One receive plus processing of everything received
    pub async fn poll_once(&self) -> Result<Vec<TaskOutcome>> {
        let messages = self.queue.receive(self.max_messages).await?;
        Ok(self.process_all(messages).await)
    }

    async fn process_all(&self, messages: Vec<ReceivedMessage>) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            let outcome = self.process_message(&message).await;
            metrics::counter!(outcome.metric_name()).increment(1);
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Drive one message through the status lifecycle
    #[instrument(skip(self, message), fields(attempt = message.receive_count))]
    pub async fn process_message(&self, message: &ReceivedMessage) -> TaskOutcome {
        if let Some(limit) = self.attempt_limit {
            if message.receive_count > limit {
                return self.abandon(message).await;
            }
        }

        let task = match message.task() {
            Ok(task) => task,
            Err(error) => {
                warn!(error = %error, "Leaving malformed message for redelivery");
                return TaskOutcome::Malformed { error };
            }
        };

        let image_id = task.image_id.clone();
        let tracked = match self.metadata.get(&image_id).await {
            Ok(Some(record)) if record.status == ImageStatus::Completed => {
                info!(image_id = %image_id, "Task already completed, acknowledging");
                self.acknowledge(&message.receipt).await;
                return TaskOutcome::AlreadyCompleted { image_id };
            }
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!(image_id = %image_id, "No metadata record for task, processing untracked");
                false
            }
            Err(error) => {
                return self.fail(image_id, FailureStage::Lookup, error, false).await;
            }
        };

        self.set_status(&image_id, ImageStatus::Processing).await;

        let output = match self.execute(&task).await {
            Ok(output) => output,
            Err((stage, error)) => return self.fail(image_id, stage, error, true).await,
        };

        let update = RecordUpdate::status(ImageStatus::Completed).with_format(output.format.clone());
        if self.metadata.update(&image_id, &update).await.is_none() && tracked {
            let error = PipelineError::StorageUnavailable("completion update not applied".into());
            return self.fail(image_id, FailureStage::Complete, error, false).await;
        }

        self.acknowledge(&message.receipt).await;
        info!(
            image_id = %image_id,
            format = %output.format,
            width = output.width,
            height = output.height,
            "Image processed"
        );
        TaskOutcome::Completed {
            image_id,
            format: output.format,
        }
    }

    /// Steps 2-4: fetch original, filter, upload result
    async fn execute(
        &self,
        task: &ProcessingTask,
    ) -> std::result::Result<FilterOutput, (FailureStage, PipelineError)> {
        let original = self
            .assets
            .get(Namespace::Original, &original_key(&task.image_id))
            .await
            .and_then(|bytes| {
                bytes.ok_or_else(|| {
                    PipelineError::NotFound(format!("original for {}", task.image_id))
                })
            })
            .map_err(|e| (FailureStage::Download, e))?;

        let params = task.params();
        let started = Instant::now();
        let output = tokio::task::spawn_blocking(move || params.apply(&original))
            .await
            .map_err(|e| PipelineError::ProcessingFailed(format!("filter task aborted: {e}")))
            .and_then(|result| result)
            .map_err(|e| (FailureStage::Filter, e))?;
        metrics::histogram!("processor.filter.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        self.assets
            .put(
                Namespace::Processed,
                &processed_key(&task.image_id),
                output.bytes.clone(),
                content_type_for(&output.format),
            )
            .await
            .map_err(|e| (FailureStage::Upload, e))?;

        Ok(output)
    }

    async fn fail(
        &self,
        image_id: String,
        stage: FailureStage,
        error: PipelineError,
        mark_failed: bool,
    ) -> TaskOutcome {
        error!(
            image_id = %image_id,
            stage = stage.as_str(),
            error = %error,
            retryable = error.is_retryable(),
            "Task failed, leaving message for redelivery"
        );
        if mark_failed {
            self.set_status(&image_id, ImageStatus::Failed).await;
        }
        TaskOutcome::Failed {
            image_id,
            stage,
            error,
        }
    }

    async fn abandon(&self, message: &ReceivedMessage) -> TaskOutcome {
        let image_id = message.task().ok().map(|task| task.image_id);
        warn!(
            image_id = ?image_id,
            attempts = message.receive_count,
            "Attempt limit exceeded, abandoning message"
        );

        if let Some(ref dead_letter) = self.dead_letter {
            if let Err(error) = dead_letter.send_body(&message.body).await {
                return TaskOutcome::Failed {
                    image_id: image_id.unwrap_or_default(),
                    stage: FailureStage::DeadLetter,
                    error,
                };
            }
            debug!("Forwarded message to dead-letter queue");
        }

        if let Some(ref image_id) = image_id {
            self.set_status(image_id, ImageStatus::Failed).await;
        }
        self.acknowledge(&message.receipt).await;

        TaskOutcome::Abandoned {
            image_id,
            attempts: message.receive_count,
        }
    }

    /// Move a record to `status` unless a delivery has already completed it
    async fn set_status(&self, image_id: &str, status: ImageStatus) {
        let update = RecordUpdate::status(status).unless_status(ImageStatus::Completed);
        if self
            .metadata
            .update(image_id, &update)
            .await
            .is_none()
        {
            debug!(image_id = %image_id, status = status.as_str(), "Status update not applied");
        }
    }

    /// A lost delete only means one more delivery, which is then acknowledged as a duplicate
    async fn acknowledge(&self, receipt: &str) {
        if let Err(e) = self.queue.delete(receipt).await {
            warn!(error = %e, "Failed to delete message");
            metrics::counter!("processor.queue.delete_errors").increment(1);
        }
    }
}
