//! Image Processor
//!
//! Filters user-uploaded images and keeps the originals, the filtered results
//! and their metadata in managed AWS services. Work arrives either through
//! the SQS task queue, drained by a single polling worker, or through the
//! synchronous [`ImageService`] path that filters inline.
//!
//! ## Features
//!
//! - **Filter Engine**: decode, resize, apply one named filter and re-encode
//!   in the source format
//! - **Asset Store**: original and processed blobs in two S3 buckets, with
//!   presigned read URLs
//! - **Metadata Store**: DynamoDB records keyed by image ID, indexed by owner
//! - **Task Queue**: at-least-once hand-off with visibility-timeout redelivery,
//!   an attempt limit and an optional dead-letter queue
//! - **Worker**: `pending -> processing -> completed | failed`, deleting a
//!   message only once its result is committed
//!
//! ## Architecture
//!
//! ```text
//!  ImageService::submit          SQS                    ImageWorker
//! ┌──────────────┐         ┌──────────────┐          ┌──────────────┐
//! │ original ──▶ S3        │ {image_id,   │  receive │ get original │
//! │ pending  ──▶ DynamoDB  │  filter_type,│─────────▶│ filter       │
//! │ task     ──────────────▶  strength,   │          │ put processed│
//! └──────────────┘         │  size_mult.} │◀─────────│ completed    │
//!                          └──────────────┘  delete  └──────────────┘
//! ```

pub mod asset_store;
pub mod config;
pub mod error;
pub mod filter_engine;
pub mod metadata_store;
pub mod service;
pub mod task_queue;
pub mod url_cache;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use asset_store::{AssetStore, Namespace, S3AssetStore};
pub use config::Config;
pub use error::{PipelineError, Result};
pub use filter_engine::{FilterKind, FilterOutput, FilterParams};
pub use metadata_store::{DynamoMetadataStore, ImageRecord, ImageStatus, MetadataStore, RecordUpdate};
pub use service::{BatchReport, Caller, ImageService, ServiceOptions, Upload};
pub use task_queue::{ProcessingTask, ReceivedMessage, SqsTaskQueue, TaskQueue};
pub use url_cache::UrlCache;
pub use worker::{FailureStage, ImageWorker, TaskOutcome};
