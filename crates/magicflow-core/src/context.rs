//! Workflow execution context shared by the engine, steps and middleware.

use crate::error::MagicFlowError;
use crate::status::WorkflowStatus;
use crate::step::StepName;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Tags, execution metrics and free-form fields attached to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metrics: HashMap<String, Value>,
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

pub(crate) struct ContextState {
    pub(crate) current_step: Option<StepName>,
    pub(crate) next_step: Option<StepName>,
    pub(crate) data: HashMap<String, Value>,
    pub(crate) metadata: WorkflowMetadata,
    pub(crate) step_results: HashMap<String, Value>,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) status: WorkflowStatus,
    pub(crate) error: Option<MagicFlowError>,
    pub(crate) step_order: u64,
    pub(crate) started_at: Instant,
}

impl ContextState {
    fn new(data: HashMap<String, Value>) -> Self {
        Self {
            current_step: None,
            next_step: None,
            data,
            metadata: WorkflowMetadata::default(),
            step_results: HashMap::new(),
            start_time: Utc::now(),
            end_time: None,
            status: WorkflowStatus::Pending,
            error: None,
            step_order: 0,
            started_at: Instant::now(),
        }
    }
}

/// Mutable state of one workflow run.
///
/// The engine owns the run, steps and middleware read and write through the
/// accessors below. All state sits behind a single lock that is held only
/// for the duration of an accessor call, so a context can be shared as
/// `Arc<WorkflowContext>` with event handlers and cancellation requests.
///
/// # Examples
///
/// ```
/// use magicflow_core::{WorkflowContext, WorkflowStatus};
///
/// let ctx = WorkflowContext::new("order-42", "order_processing");
/// ctx.insert("amount", 150);
/// ctx.add_tag("priority");
///
/// assert_eq!(ctx.get_as::<i64>("amount").unwrap(), 150);
/// assert!(ctx.get_as::<i64>("missing").is_err());
/// assert_eq!(ctx.status(), WorkflowStatus::Pending);
/// ```
pub struct WorkflowContext {
    workflow_id: String,
    workflow_name: String,
    state: RwLock<ContextState>,
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &self.workflow_id)
            .field("workflow_name", &self.workflow_name)
            .field("status", &state.status)
            .field("current_step", &state.current_step)
            .field("keys", &state.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkflowContext {
    /// Creates a pending context with an empty data bag.
    pub fn new(workflow_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self::with_data(workflow_id, workflow_name, HashMap::new())
    }

    /// Creates a pending context seeded with `data`.
    pub fn with_data(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        data: HashMap<String, Value>,
    ) -> Self {
        Self::from_state(workflow_id, workflow_name, ContextState::new(data))
    }

    pub(crate) fn from_state(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        state: ContextState,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ContextState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContextState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against a consistent view of the whole state.
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&ContextState) -> R) -> R {
        f(&self.read())
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    // ---- data bag ----

    /// Inserts a value, replacing any previous value under `key`.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().data.insert(key.into(), value.into());
    }

    /// Serializes `value` and inserts it under `key`.
    pub fn insert_as<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), MagicFlowError> {
        let value = serde_json::to_value(value)?;
        self.insert(key, value);
        Ok(())
    }

    /// Returns a copy of the value for `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().data.get(key).cloned()
    }

    /// Returns the value for `key`, or a `StorageNotFound` error.
    pub fn require(&self, key: &str) -> Result<Value, MagicFlowError> {
        self.get(key)
            .ok_or_else(|| MagicFlowError::not_found("context key", key))
    }

    /// Deserializes the value for `key` into `T`.
    ///
    /// Fails with a not-found error when the key is missing and with a
    /// validation error when the value has a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, MagicFlowError> {
        let value = self.require(key)?;
        serde_json::from_value(value).map_err(|e| {
            MagicFlowError::validation(key, format!("unexpected value type: {e}"))
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().data.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().data.remove(key)
    }

    /// Copy of the whole data bag.
    pub fn data(&self) -> HashMap<String, Value> {
        self.read().data.clone()
    }

    /// Merges `values` into the data bag, overwriting existing keys.
    pub fn extend_data(&self, values: HashMap<String, Value>) {
        self.write().data.extend(values);
    }

    // ---- metadata ----

    pub fn add_tag(&self, tag: impl Into<String>) {
        self.write().metadata.tags.insert(tag.into());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.read().metadata.tags.contains(tag)
    }

    pub fn set_metric(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().metadata.metrics.insert(key.into(), value.into());
    }

    pub fn metric(&self, key: &str) -> Option<Value> {
        self.read().metadata.metrics.get(key).cloned()
    }

    pub fn set_custom(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().metadata.custom.insert(key.into(), value.into());
    }

    pub fn custom(&self, key: &str) -> Option<Value> {
        self.read().metadata.custom.get(key).cloned()
    }

    /// Copy of tags, metrics and custom fields.
    pub fn metadata(&self) -> WorkflowMetadata {
        self.read().metadata.clone()
    }

    // ---- step bookkeeping ----

    pub fn set_step_result(&self, step: impl Into<String>, result: impl Into<Value>) {
        self.write().step_results.insert(step.into(), result.into());
    }

    pub fn step_result(&self, step: &str) -> Option<Value> {
        self.read().step_results.get(step).cloned()
    }

    pub fn step_results(&self) -> HashMap<String, Value> {
        self.read().step_results.clone()
    }

    pub fn set_current_step(&self, step: impl Into<StepName>) {
        self.write().current_step = Some(step.into());
    }

    pub fn current_step(&self) -> Option<StepName> {
        self.read().current_step.clone()
    }

    pub fn set_next_step(&self, step: Option<StepName>) {
        self.write().next_step = step;
    }

    pub fn next_step(&self) -> Option<StepName> {
        self.read().next_step.clone()
    }

    /// Increments the step-order counter and returns the new value.
    pub fn advance_step_order(&self) -> u64 {
        let mut state = self.write();
        state.step_order += 1;
        state.step_order
    }

    pub fn step_order(&self) -> u64 {
        self.read().step_order
    }

    // ---- timing ----

    pub fn start_time(&self) -> DateTime<Utc> {
        self.read().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.read().end_time
    }

    /// Time since this context was created in memory.
    pub fn elapsed(&self) -> Duration {
        self.read().started_at.elapsed()
    }

    // ---- status ----

    pub fn status(&self) -> WorkflowStatus {
        self.read().status
    }

    pub fn error(&self) -> Option<MagicFlowError> {
        self.read().error.clone()
    }

    /// Moves the run to `next`, returning the previous status.
    ///
    /// Entering a terminal status sets the end time; leaving it for a
    /// non-terminal one clears it.
    pub fn transition(&self, next: WorkflowStatus) -> Result<WorkflowStatus, MagicFlowError> {
        let mut state = self.write();
        Self::apply_transition(&self.workflow_id, &mut state, next)
    }

    fn apply_transition(
        workflow_id: &str,
        state: &mut ContextState,
        next: WorkflowStatus,
    ) -> Result<WorkflowStatus, MagicFlowError> {
        let current = state.status;
        if !current.can_transition_to(next) {
            return Err(MagicFlowError::invalid_state(format!(
                "workflow {workflow_id} cannot move from {current} to {next}"
            ))
            .with_detail("from", current.as_str())
            .with_detail("to", next.as_str()));
        }
        state.status = next;
        state.end_time = next.is_terminal().then(Utc::now);
        Ok(current)
    }

    pub fn start(&self) -> Result<(), MagicFlowError> {
        self.transition(WorkflowStatus::Running).map(|_| ())
    }

    pub fn complete(&self) -> Result<(), MagicFlowError> {
        self.transition(WorkflowStatus::Completed).map(|_| ())
    }

    pub fn cancel(&self) -> Result<(), MagicFlowError> {
        let mut state = self.write();
        if state.status == WorkflowStatus::Cancelled {
            return Err(MagicFlowError::invalid_state(format!(
                "workflow {} is already cancelled",
                self.workflow_id
            )));
        }
        Self::apply_transition(&self.workflow_id, &mut state, WorkflowStatus::Cancelled)
            .map(|_| ())
    }

    pub fn pause(&self) -> Result<(), MagicFlowError> {
        self.transition(WorkflowStatus::Paused).map(|_| ())
    }

    /// Resumes a paused run.
    pub fn resume(&self) -> Result<(), MagicFlowError> {
        let mut state = self.write();
        if state.status != WorkflowStatus::Paused {
            return Err(MagicFlowError::invalid_state(format!(
                "workflow {} is {} and cannot be resumed",
                self.workflow_id, state.status
            )));
        }
        Self::apply_transition(&self.workflow_id, &mut state, WorkflowStatus::Running).map(|_| ())
    }

    /// Marks the run failed and records `error` as its terminal error.
    pub fn fail(&self, error: MagicFlowError) -> Result<(), MagicFlowError> {
        let mut state = self.write();
        Self::apply_transition(&self.workflow_id, &mut state, WorkflowStatus::Failed)?;
        state.error = Some(error);
        Ok(())
    }

    /// Returns a failed run to `pending`, dropping progress.
    ///
    /// The data bag and metadata survive a restart.
    pub fn restart(&self) -> Result<(), MagicFlowError> {
        let mut state = self.write();
        Self::apply_transition(&self.workflow_id, &mut state, WorkflowStatus::Pending)?;
        state.current_step = None;
        state.next_step = None;
        state.step_results.clear();
        state.error = None;
        state.step_order = 0;
        Ok(())
    }

    pub fn clear_error(&self) {
        self.write().error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: String,
        amount: u32,
    }

    #[test]
    fn test_data_operations() {
        let ctx = WorkflowContext::new("wf-1", "test");

        ctx.insert("key1", "value1");
        assert_eq!(ctx.get("key1"), Some(Value::from("value1")));
        assert_eq!(ctx.get("nonexistent"), None);
        assert!(ctx.contains_key("key1"));
        assert_eq!(ctx.remove("key1"), Some(Value::from("value1")));
        assert!(!ctx.contains_key("key1"));
    }

    #[test]
    fn test_typed_access() {
        let ctx = WorkflowContext::new("wf-1", "test");
        let order = Order {
            id: "o-1".to_string(),
            amount: 99,
        };
        ctx.insert_as("order", &order).unwrap();

        assert_eq!(ctx.get_as::<Order>("order").unwrap(), order);

        let missing = ctx.get_as::<Order>("nope").unwrap_err();
        assert_eq!(missing.code(), crate::ErrorCode::StorageNotFound);

        ctx.insert("order", "not an order");
        let wrong = ctx.get_as::<Order>("order").unwrap_err();
        assert_eq!(wrong.code(), crate::ErrorCode::Validation);
    }

    #[test]
    fn test_metadata_operations() {
        let ctx = WorkflowContext::new("wf-1", "test");

        ctx.add_tag("vip");
        ctx.set_metric("duration_ms", 12);
        ctx.set_custom("owner", "ops");

        assert!(ctx.has_tag("vip"));
        assert_eq!(ctx.metric("duration_ms"), Some(Value::from(12)));
        assert_eq!(ctx.custom("owner"), Some(Value::from("ops")));
        assert_eq!(ctx.metadata().tags.len(), 1);
    }

    #[test]
    fn test_end_time_follows_terminal_status() {
        let ctx = WorkflowContext::new("wf-1", "test");
        ctx.start().unwrap();
        assert!(ctx.end_time().is_none());

        ctx.fail(MagicFlowError::internal("boom")).unwrap();
        assert!(ctx.end_time().is_none());
        assert!(ctx.error().is_some());

        ctx.transition(WorkflowStatus::Running).unwrap();
        ctx.complete().unwrap();
        assert!(ctx.end_time().is_some());
        assert!(ctx.start().is_err());
    }

    #[test]
    fn test_cancel_twice_is_rejected() {
        let ctx = WorkflowContext::new("wf-1", "test");
        ctx.start().unwrap();
        ctx.cancel().unwrap();
        let err = ctx.cancel().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::WorkflowInvalidState);
        assert!(ctx.end_time().is_some());
    }

    #[test]
    fn test_pause_and_resume() {
        let ctx = WorkflowContext::new("wf-1", "test");
        assert!(ctx.resume().is_err());
        ctx.start().unwrap();
        ctx.pause().unwrap();
        ctx.resume().unwrap();
        assert_eq!(ctx.status(), WorkflowStatus::Running);
    }

    #[test]
    fn test_restart_clears_progress() {
        let ctx = WorkflowContext::new("wf-1", "test");
        ctx.start().unwrap();
        ctx.set_current_step("charge");
        ctx.set_step_result("validate", true);
        ctx.advance_step_order();
        ctx.fail(MagicFlowError::internal("boom")).unwrap();

        ctx.restart().unwrap();
        assert_eq!(ctx.status(), WorkflowStatus::Pending);
        assert!(ctx.step_results().is_empty());
        assert_eq!(ctx.step_order(), 0);
        assert!(ctx.error().is_none());
    }

    #[test]
    fn test_step_order_is_monotonic() {
        let ctx = WorkflowContext::new("wf-1", "test");
        assert_eq!(ctx.advance_step_order(), 1);
        assert_eq!(ctx.advance_step_order(), 2);
        assert_eq!(ctx.step_order(), 2);
    }
}
