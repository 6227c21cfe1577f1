use crate::asset_store::{content_type_for, original_key, processed_key, AssetStore, Namespace};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::filter_engine::{detect_format, validate_request, FilterParams};
use crate::metadata_store::{ImageRecord, ImageStatus, MetadataStore, RecordUpdate};
use crate::task_queue::{ProcessingTask, TaskQueue};
use crate::url_cache::UrlCache;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Authenticated caller, taken from already-verified token claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
}

impl Caller {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    /// `cognito:username`, falling back to `username`
    pub fn from_claims(claims: &serde_json::Value) -> Result<Self> {
        ["cognito:username", "username"]
            .iter()
            .find_map(|claim| claims.get(claim).and_then(|v| v.as_str()))
            .filter(|username| !username.is_empty())
            .map(Caller::new)
            .ok_or_else(|| PipelineError::InvalidParameters("claims carry no username".into()))
    }
}

/// One uploaded file
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// Result of the synchronous path for one image
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedImage {
    pub image_id: String,
    pub filename: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub filename: String,
    #[serde(flatten)]
    pub status: BatchItemStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemStatus {
    Processed {
        image_id: String,
        format: String,
        url: Option<String>,
    },
    Error {
        code: &'static str,
        error: String,
    },
}

/// Itemized outcome of a batch; one entry per upload, in upload order
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub user: String,
    pub processed_count: usize,
    pub error_count: usize,
    pub results: Vec<BatchItemResult>,
}

/// Gallery entry for an owner
#[derive(Debug, Clone, Serialize)]
pub struct ImageListing {
    pub image_id: String,
    pub filename: String,
    pub filter: String,
    pub strength: u32,
    pub resize_factor: f64,
    pub format: String,
    pub status: ImageStatus,
    pub created_at: DateTime<Utc>,
    /// Read URL, present once the processed blob exists
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageDownload {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Tunables for [`ImageService`]
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub url_expiry: Duration,
    pub batch_concurrency: usize,
    /// Capacity and TTL of the read URL cache; `None` disables it
    pub url_cache: Option<(usize, Duration)>,
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url_expiry: config.presigned_url_expiry(),
            batch_concurrency: config.batch.concurrency.max(1),
            url_cache: config
                .cache
                .enabled
                .then(|| (config.cache.capacity, config.cache_ttl())),
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            url_expiry: Duration::from_secs(3600),
            batch_concurrency: 10,
            url_cache: Some((1024, Duration::from_secs(300))),
        }
    }
}

/// Request-side operations over the asset store, metadata store and queue
pub struct ImageService {
    assets: Arc<dyn AssetStore>,
    metadata: Arc<dyn MetadataStore>,
    queue: Arc<dyn TaskQueue>,
    url_cache: Option<UrlCache>,
    options: ServiceOptions,
}

impl ImageService {
    pub fn new(
        assets: Arc<dyn AssetStore>,
        metadata: Arc<dyn MetadataStore>,
        queue: Arc<dyn TaskQueue>,
        options: ServiceOptions,
    ) -> Self {
        let url_cache = options
            .url_cache
            .map(|(capacity, ttl)| UrlCache::new(capacity, ttl.min(options.url_expiry)));

        Self {
            assets,
            metadata,
            queue,
            url_cache,
            options,
        }
    }

    /// Accept an upload for background processing and return its image ID
    #[instrument(skip(self, upload), fields(user = %caller.username, filename = %upload.filename))]
    pub async fn submit(
        &self,
        caller: &Caller,
        upload: Upload,
        params: &FilterParams,
    ) -> Result<String> {
        let format = detect_format(&upload.bytes)
            .ok_or_else(|| PipelineError::Decode(format!("{} is not an image", upload.filename)))?;
        validate_request(&upload.bytes, params.resize_factor)?;

        let image_id = Uuid::new_v4().to_string();
        self.assets
            .put(
                Namespace::Original,
                &original_key(&image_id),
                upload.bytes,
                content_type_for(format),
            )
            .await?;

        let record = ImageRecord::new(
            &image_id,
            &caller.username,
            upload.filename,
            params,
            format,
            ImageStatus::Pending,
        );
        self.metadata.put(&record).await?;

        if let Err(e) = self.queue.send(&ProcessingTask::new(&image_id, params)).await {
            // Leave the record retryable instead of stuck in pending
            self.metadata
                .update(&image_id, &RecordUpdate::status(ImageStatus::Failed))
                .await;
            return Err(e);
        }

        info!(image_id = %image_id, "Image queued for processing");
        metrics::counter!("processor.tasks.submitted").increment(1);
        Ok(image_id)
    }

    /// Re-enqueue a failed image with its stored parameters
    #[instrument(skip(self))]
    pub async fn retry(&self, image_id: &str) -> Result<()> {
        let record = self
            .metadata
            .get(image_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("image {image_id}")))?;

        if record.status != ImageStatus::Failed {
            return Err(PipelineError::InvalidState(format!(
                "image {image_id} is {}, only failed images can be retried",
                record.status.as_str()
            )));
        }

        self.metadata
            .update(image_id, &RecordUpdate::status(ImageStatus::Pending))
            .await
            .ok_or_else(|| {
                PipelineError::StorageUnavailable(format!("could not reset {image_id}"))
            })?;

        self.queue
            .send(&ProcessingTask::new(image_id, &record.params()))
            .await?;

        info!("Image re-queued");
        metrics::counter!("processor.tasks.retried").increment(1);
        Ok(())
    }

    /// Filter one upload inline and persist both blobs and a completed record
    #[instrument(skip(self, upload, params), fields(user = %caller.username, filename = %upload.filename))]
    pub async fn process_upload(
        &self,
        caller: &Caller,
        upload: Upload,
        params: &FilterParams,
    ) -> Result<ProcessedImage> {
        let Upload { filename, bytes } = upload;
        let job = params.clone();
        let (bytes, output) = tokio::task::spawn_blocking(move || {
            let output = job.apply(&bytes);
            (bytes, output)
        })
        .await
        .map_err(|e| PipelineError::ProcessingFailed(format!("filter task aborted: {e}")))?;
        let output = output?;

        let image_id = Uuid::new_v4().to_string();
        let content_type = content_type_for(&output.format);
        self.assets
            .put(Namespace::Original, &original_key(&image_id), bytes, content_type)
            .await?;
        self.assets
            .put(
                Namespace::Processed,
                &processed_key(&image_id),
                output.bytes,
                content_type,
            )
            .await?;

        let record = ImageRecord::new(
            &image_id,
            &caller.username,
            filename.clone(),
            params,
            output.format.clone(),
            ImageStatus::Completed,
        );
        self.metadata.put(&record).await?;

        let url = self.read_url(&record.processed_key).await?;
        debug!(image_id = %image_id, "Image processed inline");

        Ok(ProcessedImage {
            image_id,
            filename,
            format: output.format,
            width: output.width,
            height: output.height,
            url,
        })
    }

    /// Process several uploads in parallel; one failure never aborts the rest
    #[instrument(skip(self, uploads, params), fields(user = %caller.username, count = uploads.len()))]
    pub async fn process_batch(
        &self,
        caller: &Caller,
        uploads: Vec<Upload>,
        params: &FilterParams,
    ) -> BatchReport {
        let mut results: Vec<(usize, BatchItemResult)> = stream::iter(uploads.into_iter().enumerate())
            .map(|(index, upload)| async move {
                let filename = upload.filename.clone();
                let status = match self.process_upload(caller, upload, params).await {
                    Ok(processed) => BatchItemStatus::Processed {
                        image_id: processed.image_id,
                        format: processed.format,
                        url: processed.url,
                    },
                    Err(e) => {
                        warn!(filename = %filename, error = %e, "Batch item failed");
                        BatchItemStatus::Error {
                            code: e.code(),
                            error: e.to_string(),
                        }
                    }
                };
                (index, BatchItemResult { filename, status })
            })
            .buffer_unordered(self.options.batch_concurrency)
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        let results: Vec<BatchItemResult> = results.into_iter().map(|(_, item)| item).collect();
        let error_count = results
            .iter()
            .filter(|item| matches!(item.status, BatchItemStatus::Error { .. }))
            .count();
        let processed_count = results.len() - error_count;

        metrics::counter!("processor.batch.processed").increment(processed_count as u64);
        metrics::counter!("processor.batch.errors").increment(error_count as u64);
        info!(processed_count, error_count, "Batch finished");

        BatchReport {
            user: caller.username.clone(),
            processed_count,
            error_count,
            results,
        }
    }

    /// Caller's images, newest first
    #[instrument(skip(self), fields(user = %caller.username))]
    pub async fn list_images(&self, caller: &Caller) -> Vec<ImageListing> {
        let mut records = self.metadata.list_by_owner(&caller.username).await;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut listings = Vec::with_capacity(records.len());
        for record in records {
            let url = if record.status == ImageStatus::Completed {
                match self.read_url(&record.processed_key).await {
                    Ok(url) => url,
                    Err(e) => {
                        error!(image_id = %record.image_id, error = %e, "Failed to issue read URL");
                        None
                    }
                }
            } else {
                None
            };

            listings.push(ImageListing {
                image_id: record.image_id,
                filename: record.filename,
                filter: record.filter,
                strength: record.strength,
                resize_factor: record.resize_factor,
                format: record.format,
                status: record.status,
                created_at: record.created_at,
                url,
            });
        }
        listings
    }

    /// Processed bytes with a download filename
    #[instrument(skip(self))]
    pub async fn download(&self, image_id: &str) -> Result<ImageDownload> {
        let record = self
            .metadata
            .get(image_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("image {image_id}")))?;

        let bytes = self
            .assets
            .get(Namespace::Processed, &record.processed_key)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("processed image {image_id}")))?;

        Ok(ImageDownload {
            filename: format!(
                "filtered_image_{}.{}",
                record.filter.to_lowercase(),
                record.format
            ),
            content_type: content_type_for(&record.format),
            bytes,
        })
    }

    async fn read_url(&self, key: &str) -> Result<Option<String>> {
        if let Some(url) = self.url_cache.as_ref().and_then(|cache| cache.get(key)) {
            return Ok(Some(url));
        }

        let url = self
            .assets
            .issue_read_url(Namespace::Processed, key, self.options.url_expiry)
            .await?;
        if let (Some(cache), Some(url)) = (self.url_cache.as_ref(), url.as_ref()) {
            cache.insert(key, url.clone());
        }
        Ok(url)
    }
}
