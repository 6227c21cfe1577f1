//! In-memory collaborators with failure injection, for unit tests.

use crate::asset_store::{AssetStore, Namespace};
use crate::error::{PipelineError, Result};
use crate::metadata_store::{ImageRecord, ImageStatus, MetadataStore, RecordUpdate};
use crate::task_queue::{ProcessingTask, ReceivedMessage, TaskQueue};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
pub struct InMemoryAssetStore {
    blobs: Mutex<HashMap<(Namespace, String), (Vec<u8>, String)>>,
    pub fail_gets: AtomicBool,
    pub fail_puts: AtomicBool,
    puts: AtomicUsize,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: Namespace, key: &str, bytes: Vec<u8>) {
        self.blobs
            .lock()
            .insert((namespace, key.to_string()), (bytes, "application/octet-stream".into()));
    }

    pub fn blob(&self, namespace: Namespace, key: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .get(&(namespace, key.to_string()))
            .map(|(bytes, _)| bytes.clone())
    }

    pub fn content_type(&self, namespace: Namespace, key: &str) -> Option<String> {
        self.blobs
            .lock()
            .get(&(namespace, key.to_string()))
            .map(|(_, content_type)| content_type.clone())
    }

    pub fn count(&self, namespace: Namespace) -> usize {
        self.blobs.lock().keys().filter(|(ns, _)| *ns == namespace).count()
    }

    /// Successful puts so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn put(
        &self,
        namespace: Namespace,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(PipelineError::StorageUnavailable("injected put failure".into()));
        }
        self.blobs
            .lock()
            .insert((namespace, key.to_string()), (bytes, content_type.to_string()));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(PipelineError::StorageUnavailable("injected get failure".into()));
        }
        Ok(self.blob(namespace, key))
    }

    async fn exists(&self, namespace: Namespace, key: &str) -> Result<bool> {
        Ok(self.blobs.lock().contains_key(&(namespace, key.to_string())))
    }

    async fn issue_read_url(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<String>> {
        if !self.exists(namespace, key).await? {
            return Ok(None);
        }
        Ok(Some(format!(
            "memory://{}/{}?expires={}",
            namespace.as_str(),
            key,
            ttl.as_secs()
        )))
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<()> {
        self.blobs.lock().remove(&(namespace, key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: Mutex<HashMap<String, ImageRecord>>,
    pub fail_gets: AtomicBool,
    /// The next update that sets this status is dropped
    drop_next_update_to: Mutex<Option<ImageStatus>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, image_id: &str) -> Option<ImageRecord> {
        self.records.lock().get(image_id).cloned()
    }

    pub fn status(&self, image_id: &str) -> Option<ImageStatus> {
        self.record(image_id).map(|record| record.status)
    }

    pub fn insert(&self, record: ImageRecord) {
        self.records.lock().insert(record.image_id.clone(), record);
    }

    pub fn drop_next_update_to(&self, status: ImageStatus) {
        *self.drop_next_update_to.lock() = Some(status);
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put(&self, record: &ImageRecord) -> Result<()> {
        self.insert(record.clone());
        Ok(())
    }

    async fn get(&self, image_id: &str) -> Result<Option<ImageRecord>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(PipelineError::StorageUnavailable("injected get failure".into()));
        }
        Ok(self.record(image_id))
    }

    async fn update(&self, image_id: &str, update: &RecordUpdate) -> Option<ImageRecord> {
        {
            let mut drop_to = self.drop_next_update_to.lock();
            if update.status.is_some() && *drop_to == update.status {
                *drop_to = None;
                return None;
            }
        }

        let mut records = self.records.lock();
        let record = records.get_mut(image_id)?;
        if !update.permits(record) {
            return None;
        }
        update.apply_to(record);
        Some(record.clone())
    }

    async fn list_by_owner(&self, owner_id: &str) -> Vec<ImageRecord> {
        self.records
            .lock()
            .values()
            .filter(|record| record.owner_id == owner_id)
            .cloned()
            .collect()
    }

    async fn delete(&self, image_id: &str) -> Result<()> {
        self.records.lock().remove(image_id);
        Ok(())
    }
}

struct QueuedMessage {
    id: u64,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

/// Queue with visibility-timeout semantics on the tokio clock
pub struct InMemoryQueue {
    messages: Mutex<Vec<QueuedMessage>>,
    next_id: AtomicUsize,
    visibility: Duration,
    pub fail_receives: AtomicBool,
    pub fail_next_delete: AtomicBool,
    deletes: AtomicUsize,
    receives: AtomicUsize,
}

impl InMemoryQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            visibility,
            fail_receives: AtomicBool::new(false),
            fail_next_delete: AtomicBool::new(false),
            deletes: AtomicUsize::new(0),
            receives: AtomicUsize::new(0),
        }
    }

    /// Messages not yet deleted, visible or not
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.body.clone()).collect()
    }

    pub fn tasks(&self) -> Vec<ProcessingTask> {
        self.bodies()
            .iter()
            .filter_map(|body| serde_json::from_str(body).ok())
            .collect()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Receive calls so far, failed ones included
    pub fn receive_calls(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn send(&self, task: &ProcessingTask) -> Result<()> {
        let body = task.to_body()?;
        self.send_body(&body).await
    }

    async fn send_body(&self, body: &str) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        self.messages.lock().push(QueuedMessage {
            id,
            body: body.to_string(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        Ok(())
    }

    async fn receive(&self, max_count: i32) -> Result<Vec<ReceivedMessage>> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        if self.fail_receives.load(Ordering::SeqCst) {
            return Err(PipelineError::QueueUnavailable("injected receive failure".into()));
        }

        let now = Instant::now();
        let mut messages = self.messages.lock();
        let received = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_count.max(0) as usize)
            .map(|m| {
                m.receive_count += 1;
                m.visible_at = now + self.visibility;
                let receipt = format!("{}-{}", m.id, m.receive_count);
                m.receipt = Some(receipt.clone());
                ReceivedMessage {
                    body: m.body.clone(),
                    receipt,
                    receive_count: m.receive_count,
                }
            })
            .collect();
        Ok(received)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::QueueUnavailable("injected delete failure".into()));
        }
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| m.receipt.as_deref() != Some(receipt));
        if messages.len() < before {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_queue_redelivers_after_visibility_window() {
        let queue = InMemoryQueue::new(Duration::from_secs(300));
        queue.send_body("{}").await.unwrap();

        let first = queue.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(300)).await;
        let second = queue.receive(10).await.unwrap();
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt, first[0].receipt);

        // A stale receipt no longer removes the message
        queue.delete(&first[0].receipt).await.unwrap();
        assert_eq!(queue.len(), 1);
        queue.delete(&second[0].receipt).await.unwrap();
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_asset_put_is_idempotent() {
        let store = InMemoryAssetStore::new();
        store.put(Namespace::Processed, "k", vec![1, 2, 3], "image/png").await.unwrap();
        store.put(Namespace::Processed, "k", vec![1, 2, 3], "image/png").await.unwrap();

        assert_eq!(store.count(Namespace::Processed), 1);
        assert_eq!(
            store.get(Namespace::Processed, "k").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert!(store.get(Namespace::Original, "k").await.unwrap().is_none());

        store.delete(Namespace::Processed, "k").await.unwrap();
        assert!(!store.exists(Namespace::Processed, "k").await.unwrap());
    }
}
