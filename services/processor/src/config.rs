use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the image processor
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Shared AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata table configuration
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Task queue configuration
    pub queue: QueueConfig,
    /// Worker loop timing
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Synchronous batch processing
    #[serde(default)]
    pub batch: BatchConfig,
    /// Read URL cache
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// AWS client configuration shared by S3, DynamoDB and SQS
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, MinIO, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style S3 access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding uploaded originals
    #[serde(default = "default_original_bucket")]
    pub original_bucket: String,
    /// Bucket holding filtered results
    #[serde(default = "default_processed_bucket")]
    pub processed_bucket: String,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Metadata table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Table keyed by image identifier
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Secondary index keyed by owner
    #[serde(default = "default_owner_index")]
    pub owner_index: String,
}

/// Task queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Processing queue URL
    pub queue_url: String,
    /// Visibility window applied to received messages, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i32,
    /// Long-poll wait in seconds (0-20)
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: i32,
    /// Maximum messages per receive (1-10)
    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    /// Deliveries before a message is abandoned (0 = unbounded)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Queue that receives abandoned message bodies
    pub dead_letter_queue_url: Option<String>,
}

/// Worker loop timing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Sleep after an empty receive
    #[serde(default = "default_idle_sleep_secs")]
    pub idle_sleep_secs: u64,
    /// Sleep after a batch with items
    #[serde(default = "default_busy_sleep_secs")]
    pub busy_sleep_secs: u64,
    /// Sleep after a loop-level error
    #[serde(default = "default_error_sleep_secs")]
    pub error_sleep_secs: u64,
}

/// Synchronous batch path configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Images processed in parallel within one batch
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
}

/// Read URL cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum cached URLs
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime in seconds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "image-processor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "ap-southeast-2".to_string()
}

fn default_original_bucket() -> String {
    "original-images".to_string()
}

fn default_processed_bucket() -> String {
    "processed-images".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_table_name() -> String {
    "ImageMetadata".to_string()
}

fn default_owner_index() -> String {
    "UserIndex".to_string()
}

fn default_visibility_timeout_secs() -> i32 {
    300
}

fn default_wait_time_secs() -> i32 {
    20
}

fn default_max_messages() -> i32 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_idle_sleep_secs() -> u64 {
    5
}

fn default_busy_sleep_secs() -> u64 {
    1
}

fn default_error_sleep_secs() -> u64 {
    10
}

fn default_batch_concurrency() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "image-processor")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/processor").required(false))
            .add_source(config::File::with_name("/etc/image-processor/processor").required(false))
            // PROCESSOR__QUEUE__QUEUE_URL -> queue.queue_url
            .add_source(
                config::Environment::with_prefix("PROCESSOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the managed services would refuse at runtime
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.original_bucket.is_empty() || self.storage.processed_bucket.is_empty() {
            anyhow::bail!("storage.original_bucket and storage.processed_bucket must be set");
        }
        if self.metadata.table_name.is_empty() {
            anyhow::bail!("metadata.table_name must be set");
        }
        if self.queue.queue_url.is_empty() {
            anyhow::bail!("queue.queue_url must be set");
        }
        if self.queue.visibility_timeout_secs <= 0 {
            anyhow::bail!("queue.visibility_timeout_secs must be positive");
        }
        if !(0..=20).contains(&self.queue.wait_time_secs) {
            anyhow::bail!("queue.wait_time_secs must be between 0 and 20");
        }
        if !(1..=10).contains(&self.queue.max_messages) {
            anyhow::bail!("queue.max_messages must be between 1 and 10");
        }
        if self.batch.concurrency == 0 {
            anyhow::bail!("batch.concurrency must be at least 1");
        }
        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }

    /// Cache entry lifetime, kept strictly below the URL expiry
    pub fn cache_ttl(&self) -> Duration {
        let expiry = self.storage.presigned_url_expiry_secs;
        let ttl = self.cache.ttl_secs.min(expiry.saturating_sub(1));
        Duration::from_secs(ttl)
    }
}

impl WorkerConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_secs)
    }

    pub fn busy_sleep(&self) -> Duration {
        Duration::from_secs(self.busy_sleep_secs)
    }

    pub fn error_sleep(&self) -> Duration {
        Duration::from_secs(self.error_sleep_secs)
    }
}

impl QueueConfig {
    /// Attempt ceiling, `None` when redelivery is unbounded
    pub fn attempt_limit(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            original_bucket: default_original_bucket(),
            processed_bucket: default_processed_bucket(),
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            owner_index: default_owner_index(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_secs: default_idle_sleep_secs(),
            busy_sleep_secs: default_busy_sleep_secs(),
            error_sleep_secs: default_error_sleep_secs(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_batch_concurrency(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}
