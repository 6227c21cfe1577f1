use crate::config::{AwsConfig, StorageConfig};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Logical blob namespace; each maps to its own bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Original,
    Processed,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Original => "original",
            Namespace::Processed => "processed",
        }
    }
}

/// Key of the uploaded original for an image
pub fn original_key(image_id: &str) -> String {
    format!("original_{image_id}")
}

/// Key of the filtered result for an image
pub fn processed_key(image_id: &str) -> String {
    image_id.to_string()
}

/// Get content type for an image format token
pub fn content_type_for(format: &str) -> &'static str {
    match format.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "tiff" | "tif" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Key-addressed blob storage with time-limited read URLs.
///
/// Every call is a single remote attempt; transport failures surface as
/// [`PipelineError::StorageUnavailable`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store `bytes` under `key`, overwriting any previous blob
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;

    /// Fetch a blob, `None` when the key does not exist
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, namespace: Namespace, key: &str) -> Result<bool>;

    /// Presigned GET URL valid for `ttl`, `None` when the key does not exist
    async fn issue_read_url(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<String>>;

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<()>;
}

/// S3-backed asset store over two buckets
pub struct S3AssetStore {
    client: S3Client,
    original_bucket: String,
    processed_bucket: String,
}

impl S3AssetStore {
    /// Create a new S3 asset store from the shared SDK configuration
    pub fn new(sdk_config: &SdkConfig, aws: &AwsConfig, storage: &StorageConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = aws.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if aws.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            original_bucket = %storage.original_bucket,
            processed_bucket = %storage.processed_bucket,
            "S3 asset store initialized"
        );

        Self::from_client(client, storage)
    }

    pub fn from_client(client: S3Client, storage: &StorageConfig) -> Self {
        Self {
            client,
            original_bucket: storage.original_bucket.clone(),
            processed_bucket: storage.processed_bucket.clone(),
        }
    }

    /// Bucket backing a namespace
    pub fn bucket(&self, namespace: Namespace) -> &str {
        match namespace {
            Namespace::Original => &self.original_bucket,
            Namespace::Processed => &self.processed_bucket,
        }
    }

    /// Sign a GET for `key` without checking that it exists
    pub async fn presign_get(&self, namespace: Namespace, key: &str, ttl: Duration) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| PipelineError::InvalidParameters(format!("presign expiry: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(self.bucket(namespace))
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| unavailable("presign object", e))?;

        Ok(presigned.uri().to_string())
    }
}

fn unavailable<E>(action: &str, err: E) -> PipelineError
where
    E: std::error::Error + 'static,
{
    PipelineError::StorageUnavailable(format!("{action}: {}", DisplayErrorContext(&err)))
}

#[async_trait]
impl AssetStore for S3AssetStore {
    #[instrument(skip(self, bytes), fields(namespace = namespace.as_str(), size_bytes = bytes.len()))]
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket(namespace))
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| unavailable("upload object", e))?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = namespace.as_str()))]
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        match self
            .client
            .get_object()
            .bucket(self.bucket(namespace))
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| unavailable("read object body", e))?;
                Ok(Some(data.into_bytes().to_vec()))
            }
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    warn!(key = %key, "Object not found");
                    Ok(None)
                } else {
                    Err(unavailable("download object", e))
                }
            }
        }
    }

    async fn exists(&self, namespace: Namespace, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(self.bucket(namespace))
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(unavailable("check object existence", e))
                }
            }
        }
    }

    #[instrument(skip(self), fields(namespace = namespace.as_str()))]
    async fn issue_read_url(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<String>> {
        if !self.exists(namespace, key).await? {
            return Ok(None);
        }
        self.presign_get(namespace, key, ttl).await.map(Some)
    }

    #[instrument(skip(self), fields(namespace = namespace.as_str()))]
    async fn delete(&self, namespace: Namespace, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(self.bucket(namespace))
            .key(key)
            .send()
            .await
            .map_err(|e| unavailable("delete object", e))?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }
}
