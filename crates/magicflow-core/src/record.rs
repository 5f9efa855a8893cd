//! Durable representation of a workflow run.

use crate::context::{ContextState, WorkflowContext, WorkflowMetadata};
use crate::error::{ErrorCode, MagicFlowError};
use crate::status::WorkflowStatus;
use crate::step::StepName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// The record shape every storage backend persists.
///
/// Metadata is stored as a map with `tags`, `metrics` and `custom` entries
/// so that backends without nested types can still keep it as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub workflow_name: String,
    pub current_step: String,
    pub next_step: Option<String>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub step_results: HashMap<String, Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub step_order: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Snapshots `ctx` into a record. `created_at` is preserved when the
    /// record already exists in storage.
    pub fn from_context(ctx: &WorkflowContext, created_at: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        ctx.inspect(|state| Self {
            id: ctx.workflow_id().to_string(),
            workflow_name: ctx.workflow_name().to_string(),
            current_step: state
                .current_step
                .as_ref()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            next_step: state.next_step.as_ref().map(|s| s.as_str().to_string()),
            status: state.status,
            data: state.data.clone(),
            metadata: metadata_to_map(&state.metadata),
            step_results: state.step_results.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            error: state.error.as_ref().map(|e| e.to_string()),
            step_order: state.step_order,
            created_at: created_at.unwrap_or(now),
            updated_at: now,
        })
    }

    /// Rebuilds an in-memory context from this record.
    ///
    /// The stored error text becomes a `WorkflowFailed` error.
    pub fn to_context(&self) -> WorkflowContext {
        let state = ContextState {
            current_step: (!self.current_step.is_empty())
                .then(|| StepName::new(self.current_step.clone())),
            next_step: self.next_step.clone().map(StepName::new),
            data: self.data.clone(),
            metadata: metadata_from_map(&self.metadata),
            step_results: self.step_results.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            error: self.error.as_ref().map(|text| self.stored_error(text)),
            step_order: self.step_order,
            started_at: Instant::now(),
        };
        WorkflowContext::from_state(self.id.clone(), self.workflow_name.clone(), state)
    }

    fn stored_error(&self, text: &str) -> MagicFlowError {
        MagicFlowError::new(ErrorCode::WorkflowFailed, text.to_string())
            .with_detail("workflow_id", self.id.as_str())
    }

    /// The stored error as a [`MagicFlowError`], if any.
    pub fn last_error(&self) -> Option<MagicFlowError> {
        self.error.as_ref().map(|text| self.stored_error(text))
    }

    /// Reads a field from the `custom` metadata section.
    pub fn custom(&self, key: &str) -> Option<&Value> {
        self.metadata
            .get("custom")
            .and_then(|custom| custom.get(key))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata
            .get("tags")
            .and_then(Value::as_array)
            .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(tag)))
    }
}

impl WorkflowContext {
    /// Shorthand for [`WorkflowRecord::from_context`].
    pub fn to_record(&self, created_at: Option<DateTime<Utc>>) -> WorkflowRecord {
        WorkflowRecord::from_context(self, created_at)
    }

    /// Shorthand for [`WorkflowRecord::to_context`].
    pub fn from_record(record: &WorkflowRecord) -> Self {
        record.to_context()
    }
}

fn metadata_to_map(metadata: &WorkflowMetadata) -> HashMap<String, Value> {
    let mut map = HashMap::with_capacity(3);
    map.insert(
        "tags".to_string(),
        Value::from(metadata.tags.iter().cloned().collect::<Vec<_>>()),
    );
    map.insert(
        "metrics".to_string(),
        Value::Object(metadata.metrics.clone().into_iter().collect()),
    );
    map.insert(
        "custom".to_string(),
        Value::Object(metadata.custom.clone().into_iter().collect()),
    );
    map
}

fn metadata_from_map(map: &HashMap<String, Value>) -> WorkflowMetadata {
    let section = |key: &str| -> HashMap<String, Value> {
        map.get(key)
            .and_then(Value::as_object)
            .map(|obj| obj.clone().into_iter().collect())
            .unwrap_or_default()
    };
    WorkflowMetadata {
        tags: map
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        metrics: section("metrics"),
        custom: section("custom"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_snapshot_and_restore() {
        let ctx = WorkflowContext::new("wf-7", "billing");
        ctx.start().unwrap();
        ctx.insert("amount", 42);
        ctx.add_tag("nightly");
        ctx.set_custom("retry_count", 2);
        ctx.set_metric("charge.duration_ms", 5);
        ctx.set_current_step("charge");
        ctx.set_next_step(Some(StepName::new("notify")));
        ctx.set_step_result("validate", "ok");
        ctx.advance_step_order();
        ctx.fail(MagicFlowError::step_error("charge", "card declined"))
            .unwrap();

        let record = WorkflowRecord::from_context(&ctx, None);
        assert_eq!(record.status, WorkflowStatus::Failed);
        assert_eq!(record.current_step, "charge");
        assert_eq!(record.next_step.as_deref(), Some("notify"));
        assert_eq!(record.custom("retry_count"), Some(&Value::from(2)));
        assert!(record.has_tag("nightly"));
        assert!(record.error.as_deref().unwrap().contains("card declined"));

        let restored = record.to_context();
        assert_eq!(restored.workflow_id(), "wf-7");
        assert_eq!(restored.status(), WorkflowStatus::Failed);
        assert_eq!(restored.get_as::<i64>("amount").unwrap(), 42);
        assert_eq!(restored.custom("retry_count"), Some(Value::from(2)));
        assert_eq!(restored.metric("charge.duration_ms"), Some(Value::from(5)));
        assert_eq!(restored.step_order(), 1);
        assert_eq!(
            restored.error().map(|e| e.code()),
            Some(ErrorCode::WorkflowFailed)
        );
    }

    #[test]
    fn test_record_json_shape() {
        let ctx = WorkflowContext::new("wf-8", "shape");
        let record = WorkflowRecord::from_context(&ctx, None);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["current_step"], "");
        assert!(json["metadata"]["tags"].is_array());
    }
}
