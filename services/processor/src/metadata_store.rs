use crate::asset_store::{original_key, processed_key};
use crate::config::{AwsConfig, MetadataConfig};
use crate::error::{PipelineError, Result};
use crate::filter_engine::FilterParams;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, error, info, instrument, warn};

/// Processing lifecycle of an image record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Processing => "processing",
            ImageStatus::Completed => "completed",
            ImageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ImageStatus::Pending),
            "processing" => Some(ImageStatus::Processing),
            "completed" => Some(ImageStatus::Completed),
            "failed" => Some(ImageStatus::Failed),
            _ => None,
        }
    }
}

/// Stored image metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Unique image ID
    pub image_id: String,
    /// Owning user
    pub owner_id: String,
    /// Filename as uploaded
    pub filename: String,
    /// Filter token
    pub filter: String,
    pub strength: u32,
    pub resize_factor: f64,
    /// Lower-case format token
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub status: ImageStatus,
    /// Key of the original blob
    pub original_key: String,
    /// Key of the processed blob
    pub processed_key: String,
}

impl ImageRecord {
    pub fn new(
        image_id: impl Into<String>,
        owner_id: impl Into<String>,
        filename: impl Into<String>,
        params: &FilterParams,
        format: impl Into<String>,
        status: ImageStatus,
    ) -> Self {
        let image_id = image_id.into();
        Self {
            original_key: original_key(&image_id),
            processed_key: processed_key(&image_id),
            image_id,
            owner_id: owner_id.into(),
            filename: filename.into(),
            filter: params.filter.clone(),
            strength: params.strength,
            resize_factor: params.resize_factor,
            format: format.into(),
            created_at: Utc::now(),
            status,
        }
    }

    pub fn params(&self) -> FilterParams {
        FilterParams::new(self.filter.clone(), self.strength, self.resize_factor)
    }
}

/// Partial record update; unset fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<ImageStatus>,
    pub format: Option<String>,
    /// Skip the update when the stored record is in this status
    pub unless_status: Option<ImageStatus>,
}

impl RecordUpdate {
    pub fn status(status: ImageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn unless_status(mut self, status: ImageStatus) -> Self {
        self.unless_status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.format.is_none()
    }

    /// Whether the guard lets this update touch `record`
    pub fn permits(&self, record: &ImageRecord) -> bool {
        self.unless_status != Some(record.status)
    }

    /// Apply to an in-memory record
    pub fn apply_to(&self, record: &mut ImageRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(ref format) = self.format {
            record.format = format.clone();
        }
    }
}

/// Image metadata keyed by image ID, with a secondary index by owner
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Write a full record, replacing any existing one
    async fn put(&self, record: &ImageRecord) -> Result<()>;

    async fn get(&self, image_id: &str) -> Result<Option<ImageRecord>>;

    /// Apply a partial update to an existing record.
    ///
    /// Returns `None` when the record does not exist or the service reports
    /// an error; failures are logged, not raised.
    async fn update(&self, image_id: &str, update: &RecordUpdate) -> Option<ImageRecord>;

    /// All records for an owner, unordered; empty on failure
    async fn list_by_owner(&self, owner_id: &str) -> Vec<ImageRecord>;

    async fn delete(&self, image_id: &str) -> Result<()>;
}

// Attribute names in the metadata table
const ATTR_IMAGE_ID: &str = "image_id";
const ATTR_OWNER: &str = "user_id";
const ATTR_FILENAME: &str = "filename";
const ATTR_FILTER: &str = "filter";
const ATTR_STRENGTH: &str = "strength";
const ATTR_RESIZE: &str = "size_multiplier";
const ATTR_FORMAT: &str = "format";
const ATTR_CREATED_AT: &str = "created_at";
const ATTR_STATUS: &str = "status";
const ATTR_ORIGINAL_KEY: &str = "original_key";
const ATTR_PROCESSED_KEY: &str = "processed_key";

/// DynamoDB-backed metadata store
pub struct DynamoMetadataStore {
    client: DynamoClient,
    table_name: String,
    owner_index: String,
}

impl DynamoMetadataStore {
    pub fn new(sdk_config: &SdkConfig, aws: &AwsConfig, config: &MetadataConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Some(ref endpoint_url) = aws.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(
            table = %config.table_name,
            owner_index = %config.owner_index,
            "DynamoDB metadata store initialized"
        );

        Self {
            client: DynamoClient::from_conf(builder.build()),
            table_name: config.table_name.clone(),
            owner_index: config.owner_index.clone(),
        }
    }

    fn key(image_id: &str) -> (String, AttributeValue) {
        (ATTR_IMAGE_ID.to_string(), AttributeValue::S(image_id.to_string()))
    }
}

#[async_trait]
impl MetadataStore for DynamoMetadataStore {
    #[instrument(skip(self, record), fields(image_id = %record.image_id))]
    async fn put(&self, record: &ImageRecord) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(record)))
            .send()
            .await
            .map_err(|e| {
                PipelineError::StorageUnavailable(format!("put item: {}", DisplayErrorContext(&e)))
            })?;

        debug!(status = record.status.as_str(), "Stored image metadata");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        let (key_name, key_value) = Self::key(image_id);
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(key_name, key_value)
            .send()
            .await
            .map_err(|e| {
                PipelineError::StorageUnavailable(format!("get item: {}", DisplayErrorContext(&e)))
            })?;

        match output.item() {
            Some(item) => from_item(item).map(Some),
            None => {
                debug!("Metadata not found");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, update))]
    async fn update(&self, image_id: &str, update: &RecordUpdate) -> Option<ImageRecord> {
        if update.is_empty() {
            return self.get(image_id).await.ok().flatten();
        }

        let expression = UpdateExpression::from_update(update);
        let (key_name, key_value) = Self::key(image_id);

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(key_name, key_value)
            .update_expression(expression.expression)
            .set_expression_attribute_names(Some(expression.names))
            .set_expression_attribute_values(Some(expression.values))
            .condition_expression(expression.condition)
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes().map(from_item) {
                Some(Ok(record)) => Some(record),
                Some(Err(e)) => {
                    warn!(error = %e, "Updated item could not be read back");
                    None
                }
                None => None,
            },
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false)
                {
                    warn!("Update skipped, record missing or guarded by its status");
                } else {
                    error!(error = %DisplayErrorContext(&e), "Failed to update image metadata");
                }
                None
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_by_owner(&self, owner_id: &str) -> Vec<ImageRecord> {
        let mut records = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = match self
                .client
                .query()
                .table_name(&self.table_name)
                .index_name(&self.owner_index)
                .key_condition_expression("#owner = :owner")
                .expression_attribute_names("#owner", ATTR_OWNER)
                .expression_attribute_values(":owner", AttributeValue::S(owner_id.to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    error!(error = %DisplayErrorContext(&e), "Failed to query owner index");
                    return Vec::new();
                }
            };

            for item in output.items() {
                match from_item(item) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(error = %e, "Skipping malformed metadata item"),
                }
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        debug!(count = records.len(), "Retrieved images for owner");
        records
    }

    #[instrument(skip(self))]
    async fn delete(&self, image_id: &str) -> Result<()> {
        let (key_name, key_value) = Self::key(image_id);
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(key_name, key_value)
            .send()
            .await
            .map_err(|e| {
                PipelineError::StorageUnavailable(format!("delete item: {}", DisplayErrorContext(&e)))
            })?;

        info!("Deleted image metadata");
        Ok(())
    }
}

/// `SET` expression and condition with their placeholder maps
#[derive(Debug)]
struct UpdateExpression {
    expression: String,
    condition: String,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl UpdateExpression {
    fn from_update(update: &RecordUpdate) -> Self {
        let mut assignments: Vec<(&str, AttributeValue)> = Vec::new();

        if let Some(status) = update.status {
            assignments.push((ATTR_STATUS, AttributeValue::S(status.as_str().to_string())));
        }
        if let Some(ref format) = update.format {
            assignments.push((ATTR_FORMAT, AttributeValue::S(format.clone())));
        }

        let mut names = HashMap::new();
        let mut values = HashMap::new();
        let clauses: Vec<String> = assignments
            .into_iter()
            .map(|(attr, value)| {
                names.insert(format!("#{attr}"), attr.to_string());
                values.insert(format!(":{attr}"), value);
                format!("#{attr} = :{attr}")
            })
            .collect();

        let mut condition = format!("attribute_exists({ATTR_IMAGE_ID})");
        if let Some(status) = update.unless_status {
            names.insert(format!("#{ATTR_STATUS}"), ATTR_STATUS.to_string());
            values.insert(
                ":unless_status".to_string(),
                AttributeValue::S(status.as_str().to_string()),
            );
            condition.push_str(&format!(" AND #{ATTR_STATUS} <> :unless_status"));
        }

        Self {
            expression: format!("SET {}", clauses.join(", ")),
            condition,
            names,
            values,
        }
    }
}

/// Decimal string for a float; shortest representation that parses back exactly
fn decimal(value: f64) -> String {
    format!("{value}")
}

fn to_item(record: &ImageRecord) -> HashMap<String, AttributeValue> {
    HashMap::from([
        (ATTR_IMAGE_ID.to_string(), AttributeValue::S(record.image_id.clone())),
        (ATTR_OWNER.to_string(), AttributeValue::S(record.owner_id.clone())),
        (ATTR_FILENAME.to_string(), AttributeValue::S(record.filename.clone())),
        (ATTR_FILTER.to_string(), AttributeValue::S(record.filter.clone())),
        (ATTR_STRENGTH.to_string(), AttributeValue::N(record.strength.to_string())),
        (ATTR_RESIZE.to_string(), AttributeValue::N(decimal(record.resize_factor))),
        (ATTR_FORMAT.to_string(), AttributeValue::S(record.format.clone())),
        (ATTR_CREATED_AT.to_string(), AttributeValue::S(record.created_at.to_rfc3339())),
        (ATTR_STATUS.to_string(), AttributeValue::S(record.status.as_str().to_string())),
        (ATTR_ORIGINAL_KEY.to_string(), AttributeValue::S(record.original_key.clone())),
        (ATTR_PROCESSED_KEY.to_string(), AttributeValue::S(record.processed_key.clone())),
    ])
}

fn from_item(item: &HashMap<String, AttributeValue>) -> Result<ImageRecord> {
    let image_id = string_attr(item, ATTR_IMAGE_ID)?;

    // Records written without a status predate the queue and were processed inline
    let status = match optional_string_attr(item, ATTR_STATUS) {
        Some(raw) => ImageStatus::parse(&raw).ok_or_else(|| malformed(ATTR_STATUS))?,
        None => ImageStatus::Completed,
    };

    Ok(ImageRecord {
        owner_id: string_attr(item, ATTR_OWNER)?,
        filename: optional_string_attr(item, ATTR_FILENAME).unwrap_or_default(),
        filter: string_attr(item, ATTR_FILTER)?,
        strength: number_attr(item, ATTR_STRENGTH)?,
        resize_factor: number_attr(item, ATTR_RESIZE)?,
        format: optional_string_attr(item, ATTR_FORMAT).unwrap_or_else(|| "jpeg".to_string()),
        created_at: parse_timestamp(&string_attr(item, ATTR_CREATED_AT)?)?,
        status,
        original_key: optional_string_attr(item, ATTR_ORIGINAL_KEY)
            .unwrap_or_else(|| original_key(&image_id)),
        processed_key: optional_string_attr(item, ATTR_PROCESSED_KEY)
            .unwrap_or_else(|| processed_key(&image_id)),
        image_id,
    })
}

fn malformed(attr: &str) -> PipelineError {
    PipelineError::InvalidState(format!("metadata item has missing or malformed `{attr}`"))
}

fn optional_string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<String> {
    optional_string_attr(item, name).ok_or_else(|| malformed(name))
}

fn number_attr<T: FromStr>(item: &HashMap<String, AttributeValue>, name: &str) -> Result<T> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| malformed(name))
}

/// RFC 3339, or a naive ISO timestamp taken as UTC
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| malformed(ATTR_CREATED_AT))
}
