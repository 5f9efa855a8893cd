//! Storage collaborator interface and an in-memory implementation.
//!
//! The engine persists a [`WorkflowRecord`] when a run starts, pauses and
//! finishes; the recovery manager reads and rewrites records. Production
//! backends implement [`WorkflowStorage`]; [`InMemoryStorage`] serves tests
//! and embedded use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use magicflow_core::{ErrorCode, MagicFlowError, WorkflowRecord, WorkflowStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, MagicFlowError>;

/// Field used to order [`WorkflowStorage::list`] results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    CreatedAt,
    UpdatedAt,
    StartTime,
}

/// Query parameters for [`WorkflowStorage::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub status: Option<WorkflowStatus>,
    pub workflow_name: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub order_by: OrderBy,
    pub descending: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn with_status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn name(mut self, workflow_name: impl Into<String>) -> Self {
        self.workflow_name = Some(workflow_name.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn order(mut self, order_by: OrderBy, descending: bool) -> Self {
        self.order_by = order_by;
        self.descending = descending;
        self
    }

    fn matches(&self, record: &WorkflowRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .workflow_name
                .as_deref()
                .map_or(true, |n| record.workflow_name == n)
            && self.started_after.map_or(true, |t| record.start_time >= t)
            && self.started_before.map_or(true, |t| record.start_time < t)
    }
}

/// Durable storage of workflow records.
#[async_trait]
pub trait WorkflowStorage: Send + Sync {
    /// Stores a new record. Fails with `StorageConflict` if the id exists.
    async fn create(&self, record: WorkflowRecord) -> StorageResult<()>;

    /// Loads a record. Fails with `StorageNotFound` if it does not exist.
    async fn get(&self, id: &str) -> StorageResult<WorkflowRecord>;

    /// Replaces an existing record. Fails with `StorageNotFound` otherwise.
    async fn update(&self, record: WorkflowRecord) -> StorageResult<()>;

    async fn delete(&self, id: &str) -> StorageResult<()>;

    async fn list(&self, filter: &RecordFilter) -> StorageResult<Vec<WorkflowRecord>>;

    /// Paused records, optionally only those waiting on `trigger_key`.
    async fn list_waiting(&self, trigger_key: Option<&str>) -> StorageResult<Vec<WorkflowRecord>>;

    /// Updates the record, creating it if it does not exist yet.
    async fn save(&self, record: WorkflowRecord) -> StorageResult<()> {
        match self.update(record.clone()).await {
            Err(e) if e.code() == ErrorCode::StorageNotFound => self.create(record).await,
            other => other,
        }
    }
}

/// Thread-safe in-memory storage. Data is lost when dropped.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: RwLock<HashMap<String, WorkflowRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl WorkflowStorage for InMemoryStorage {
    async fn create(&self, record: WorkflowRecord) -> StorageResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(MagicFlowError::new(
                ErrorCode::StorageConflict,
                format!("workflow record already exists: {}", record.id),
            )
            .with_detail("id", record.id.as_str()));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<WorkflowRecord> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MagicFlowError::not_found("workflow record", id))
    }

    async fn update(&self, record: WorkflowRecord) -> StorageResult<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(MagicFlowError::not_found("workflow record", record.id)),
        }
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.records
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MagicFlowError::not_found("workflow record", id))
    }

    async fn list(&self, filter: &RecordFilter) -> StorageResult<Vec<WorkflowRecord>> {
        let mut matched: Vec<WorkflowRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        matched.sort_by_key(|r| match filter.order_by {
            OrderBy::CreatedAt => r.created_at,
            OrderBy::UpdatedAt => r.updated_at,
            OrderBy::StartTime => r.start_time,
        });
        if filter.descending {
            matched.reverse();
        }

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn list_waiting(&self, trigger_key: Option<&str>) -> StorageResult<Vec<WorkflowRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.status == WorkflowStatus::Paused)
            .filter(|r| {
                trigger_key.map_or(true, |key| {
                    r.custom("wait_trigger").and_then(|v| v.as_str()) == Some(key)
                })
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magicflow_core::WorkflowContext;

    fn record(id: &str, name: &str, status: WorkflowStatus) -> WorkflowRecord {
        let mut record = WorkflowRecord::from_context(&WorkflowContext::new(id, name), None);
        record.status = status;
        record
    }

    #[tokio::test]
    async fn test_crud() {
        let storage = InMemoryStorage::new();
        storage
            .create(record("a", "flow", WorkflowStatus::Running))
            .await
            .unwrap();

        let err = storage
            .create(record("a", "flow", WorkflowStatus::Running))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageConflict);

        let mut loaded = storage.get("a").await.unwrap();
        loaded.status = WorkflowStatus::Failed;
        storage.update(loaded).await.unwrap();
        assert_eq!(
            storage.get("a").await.unwrap().status,
            WorkflowStatus::Failed
        );

        storage.delete("a").await.unwrap();
        let err = storage.get("a").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageNotFound);
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_save_upserts() {
        let storage = InMemoryStorage::new();
        storage
            .save(record("a", "flow", WorkflowStatus::Running))
            .await
            .unwrap();
        storage
            .save(record("a", "flow", WorkflowStatus::Completed))
            .await
            .unwrap();
        assert_eq!(storage.len().await, 1);
        assert_eq!(
            storage.get("a").await.unwrap().status,
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let storage = InMemoryStorage::new();
        for (i, status) in [
            WorkflowStatus::Failed,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Failed,
        ]
        .into_iter()
        .enumerate()
        {
            let mut r = record(&format!("wf-{i}"), "flow", status);
            r.created_at += chrono::Duration::seconds(i as i64);
            storage.create(r).await.unwrap();
        }
        storage
            .create(record("other", "billing", WorkflowStatus::Failed))
            .await
            .unwrap();

        let failed = storage
            .list(&RecordFilter::with_status(WorkflowStatus::Failed).name("flow"))
            .await
            .unwrap();
        let ids: Vec<_> = failed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["wf-0", "wf-2", "wf-3"]);

        let page = storage
            .list(
                &RecordFilter::with_status(WorkflowStatus::Failed)
                    .name("flow")
                    .order(OrderBy::CreatedAt, true)
                    .offset(1)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "wf-2");
    }

    #[tokio::test]
    async fn test_list_waiting_by_trigger() {
        let storage = InMemoryStorage::new();
        let ctx = WorkflowContext::new("w1", "approval");
        ctx.start().unwrap();
        ctx.pause().unwrap();
        ctx.set_custom("wait_trigger", "approve:1");
        storage
            .create(WorkflowRecord::from_context(&ctx, None))
            .await
            .unwrap();
        storage
            .create(record("w2", "approval", WorkflowStatus::Paused))
            .await
            .unwrap();

        assert_eq!(storage.list_waiting(None).await.unwrap().len(), 2);
        let waiting = storage.list_waiting(Some("approve:1")).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, "w1");
    }
}
