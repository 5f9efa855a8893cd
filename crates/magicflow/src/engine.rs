//! Workflow engine for executing steps.

use crate::config::EngineConfig;
use crate::events::{EventDispatcher, EventHandler, EventKind, WorkflowEvent};
use crate::middleware::MiddlewareChain;
use crate::storage::{InMemoryStorage, WorkflowStorage};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use magicflow_core::{
    ErrorCode, MagicFlowError, Step, StepName, StepResult, WorkflowContext, WorkflowRecord,
    WorkflowStatus,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to start one run.
///
/// # Examples
///
/// ```
/// use magicflow::{FunctionStep, WorkflowRequest};
///
/// let request = WorkflowRequest::new("order-42", "order_processing")
///     .step(FunctionStep::new("validate", |_| Ok(None)))
///     .data("amount", 150)
///     .tag("priority");
///
/// assert_eq!(request.step_count(), 1);
/// ```
pub struct WorkflowRequest {
    id: String,
    name: String,
    steps: Vec<Arc<dyn Step>>,
    data: HashMap<String, Value>,
    tags: Vec<String>,
    cancellation: Option<CancellationToken>,
}

impl fmt::Debug for WorkflowRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkflowRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            data: HashMap::new(),
            tags: Vec::new(),
            cancellation: None,
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends a step that is shared with other requests or a recovery
    /// registry.
    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: HashMap<String, Value>) -> Self {
        self.data.extend(data);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Cancelling `token` aborts the run before its next step.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Snapshot of an in-flight run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningWorkflow {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub current_step: Option<StepName>,
    pub start_time: DateTime<Utc>,
}

/// Drives workflows step by step through the middleware chain.
///
/// One engine is shared by many concurrent runs, usually as
/// `Arc<WorkflowEngine>`. Steps within a run execute sequentially. A step
/// may redirect the run by returning the name of another step in the same
/// request; returning `None` moves on to the next step in the list.
///
/// # Examples
///
/// ```
/// use magicflow::{FunctionStep, WorkflowEngine, WorkflowRequest, WorkflowStatus};
///
/// # tokio_test::block_on(async {
/// let engine = WorkflowEngine::builder().build()?;
/// let request = WorkflowRequest::new("greeting-1", "greeting").step(
///     FunctionStep::new("greet", |ctx| {
///         ctx.set_step_result("greet", "hello");
///         Ok(None)
///     }),
/// );
///
/// let ctx = engine.execute(request).await?;
/// assert_eq!(ctx.status(), WorkflowStatus::Completed);
/// # Ok::<(), magicflow::MagicFlowError>(())
/// # });
/// ```
pub struct WorkflowEngine {
    config: EngineConfig,
    middleware: MiddlewareChain,
    storage: Arc<dyn WorkflowStorage>,
    events: EventDispatcher,
    running: DashMap<String, Arc<WorkflowContext>>,
    /// Slots reserved against `max_concurrent_workflows`.
    admitted: AtomicUsize,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("middleware", &self.middleware)
            .field("running", &self.running.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Removes a run from the running table and frees its slot when dropped.
struct RunningGuard<'a> {
    table: &'a DashMap<String, Arc<WorkflowContext>>,
    admitted: &'a AtomicUsize,
    id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
        self.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn WorkflowStorage> {
        &self.storage
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Cancelled once [`shutdown`](Self::shutdown) starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs a workflow to completion, failure, cancellation or suspension.
    ///
    /// Returns `Ok` with the final context when the run completed, or when a
    /// step paused it (the context then reports [`WorkflowStatus::Paused`]).
    /// Every other outcome is an `Err`; the partial progress stays in the
    /// persisted record.
    pub async fn execute(
        &self,
        request: WorkflowRequest,
    ) -> Result<Arc<WorkflowContext>, MagicFlowError> {
        let WorkflowRequest {
            id,
            name,
            steps,
            data,
            tags,
            cancellation,
        } = request;

        if id.is_empty() {
            return Err(MagicFlowError::validation(
                "workflow_id",
                "workflow id must not be empty",
            ));
        }
        if steps.is_empty() {
            return Err(MagicFlowError::validation(
                "steps",
                "workflow must have at least one step",
            )
            .with_detail("workflow_id", id));
        }

        let ctx = Arc::new(WorkflowContext::with_data(id, name, data));
        for tag in tags {
            ctx.add_tag(tag);
        }

        let _guard = self.register(&ctx)?;
        ctx.start()?;
        self.persist(&ctx).await?;

        let token = cancellation.unwrap_or_default();
        self.run(ctx, &steps, &token, 0, false).await
    }

    /// Runs `steps` under a workflow named after `workflow_id`.
    pub async fn execute_steps(
        &self,
        workflow_id: impl Into<String>,
        steps: Vec<Arc<dyn Step>>,
        data: HashMap<String, Value>,
    ) -> Result<Arc<WorkflowContext>, MagicFlowError> {
        let workflow_id = workflow_id.into();
        let request = WorkflowRequest::new(workflow_id.clone(), workflow_id)
            .steps(steps)
            .with_data(data);
        self.execute(request).await
    }

    /// Continues a paused run from its recorded next step.
    ///
    /// `data` is merged into the stored data bag before the run continues,
    /// which is how an external trigger hands over its payload.
    pub async fn resume_workflow(
        &self,
        workflow_id: &str,
        steps: Vec<Arc<dyn Step>>,
        data: HashMap<String, Value>,
    ) -> Result<Arc<WorkflowContext>, MagicFlowError> {
        if steps.is_empty() {
            return Err(MagicFlowError::validation(
                "steps",
                "workflow must have at least one step",
            ));
        }
        let record = self.load_record(workflow_id).await?;
        if record.status != WorkflowStatus::Paused {
            return Err(MagicFlowError::invalid_state(format!(
                "workflow {workflow_id} is {} and cannot be resumed",
                record.status
            )));
        }

        let ctx = Arc::new(record.to_context());
        let start = match ctx.next_step() {
            Some(next) => position_of(&steps, &next).ok_or_else(|| {
                MagicFlowError::step_not_found(next).with_detail("workflow_id", workflow_id)
            })?,
            None => steps.len(),
        };
        ctx.extend_data(data);

        let _guard = self.register(&ctx)?;
        ctx.resume()?;
        info!(workflow_id, start, "Resuming workflow");

        self.run(ctx, &steps, &CancellationToken::new(), start, true)
            .await
    }

    /// Runs one step through the middleware chain.
    ///
    /// Failures come back as `StepFailed` errors carrying the step name,
    /// with the original error as the cause.
    pub async fn execute_step(&self, step: &dyn Step, ctx: &WorkflowContext) -> StepResult {
        let name = step.name();
        ctx.set_current_step(name.clone());
        self.middleware.run(step, ctx).await.map_err(|e| {
            let already_wrapped = e.code() == ErrorCode::StepFailed
                && e.detail("step").and_then(Value::as_str) == Some(name.as_str());
            if already_wrapped {
                e
            } else {
                MagicFlowError::step_failed(name, e)
            }
        })
    }

    /// Flips a running workflow to `cancelled`.
    ///
    /// The run stops before its next step. Fails with `WorkflowNotFound`
    /// when the id is not running and `WorkflowInvalidState` when it is
    /// already cancelled.
    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<(), MagicFlowError> {
        let ctx = self
            .running
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MagicFlowError::workflow_not_found(workflow_id))?;

        ctx.cancel()?;
        info!(workflow_id, "Workflow cancelled");
        self.events
            .emit(self.event(EventKind::WorkflowCancelled, &ctx));
        Ok(())
    }

    /// Stops accepting new runs and waits for running ones to finish.
    ///
    /// Only the first call acts; later calls return `Ok` immediately. Runs
    /// still going after `shutdown_timeout` are abandoned and a `Timeout`
    /// error names them.
    pub async fn shutdown(&self) -> Result<(), MagicFlowError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return Ok(());
        }

        info!(running = self.running.len(), "Shutting down workflow engine");
        self.shutdown.cancel();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.running.is_empty() {
                info!("Workflow engine stopped");
                return Ok(());
            }
            if Instant::now() >= deadline {
                let abandoned: Vec<String> =
                    self.running.iter().map(|e| e.key().clone()).collect();
                warn!(?abandoned, "Shutdown timed out, abandoning running workflows");
                return Err(MagicFlowError::timeout(
                    "shutdown",
                    self.config.shutdown_timeout,
                )
                .with_detail("abandoned", abandoned));
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    /// Status of a running workflow, falling back to storage.
    pub async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, MagicFlowError> {
        if let Some(ctx) = self.running.get(workflow_id) {
            return Ok(ctx.status());
        }
        Ok(self.load_record(workflow_id).await?.status)
    }

    pub fn get_running_workflows(&self) -> Vec<RunningWorkflow> {
        self.running
            .iter()
            .map(|entry| {
                let ctx = entry.value();
                RunningWorkflow {
                    id: ctx.workflow_id().to_string(),
                    name: ctx.workflow_name().to_string(),
                    status: ctx.status(),
                    current_step: ctx.current_step(),
                    start_time: ctx.start_time(),
                }
            })
            .collect()
    }

    /// The live context of a running workflow.
    pub fn get_context(&self, workflow_id: &str) -> Option<Arc<WorkflowContext>> {
        self.running
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.events.register(kind, handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Emits an application-defined event for `workflow_id`.
    pub fn emit_custom(&self, kind: impl Into<String>, workflow_id: &str, data: Value) {
        let workflow_name = self
            .running
            .get(workflow_id)
            .map(|ctx| ctx.workflow_name().to_string())
            .unwrap_or_default();
        self.events.emit(
            WorkflowEvent::new(EventKind::custom(kind), workflow_id, workflow_name)
                .with_data(data),
        );
    }

    fn register(&self, ctx: &Arc<WorkflowContext>) -> Result<RunningGuard<'_>, MagicFlowError> {
        if self.is_shutting_down() {
            return Err(MagicFlowError::engine_shutdown());
        }
        let limit = self.config.max_concurrent_workflows;
        let reserved = self
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(MagicFlowError::resource_limit("concurrent workflows", limit));
        }

        let id = ctx.workflow_id().to_string();
        match self.running.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.admitted.fetch_sub(1, Ordering::SeqCst);
                Err(MagicFlowError::workflow_exists(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(ctx));
                Ok(RunningGuard {
                    table: &self.running,
                    admitted: &self.admitted,
                    id,
                })
            }
        }
    }

    async fn run(
        &self,
        ctx: Arc<WorkflowContext>,
        steps: &[Arc<dyn Step>],
        token: &CancellationToken,
        start: usize,
        resumed: bool,
    ) -> Result<Arc<WorkflowContext>, MagicFlowError> {
        info!(
            workflow_id = ctx.workflow_id(),
            workflow_name = ctx.workflow_name(),
            steps = steps.len(),
            "Workflow started"
        );
        self.events.emit(
            self.event(EventKind::WorkflowStarted, &ctx)
                .with_data(json!({ "resumed": resumed })),
        );

        let run = self.run_loop(&ctx, steps, token, start);
        let outcome = if self.config.features.tracing {
            let span = info_span!(
                "workflow",
                workflow_id = ctx.workflow_id(),
                workflow_name = ctx.workflow_name()
            );
            run.instrument(span).await
        } else {
            run.await
        };

        let result = self.finish(&ctx, outcome);
        if let Err(e) = self.persist(&ctx).await {
            error!(
                workflow_id = ctx.workflow_id(),
                error = %e,
                "Failed to persist final workflow record"
            );
        }
        result.map(|()| ctx)
    }

    async fn run_loop(
        &self,
        ctx: &WorkflowContext,
        steps: &[Arc<dyn Step>],
        token: &CancellationToken,
        start: usize,
    ) -> Result<(), MagicFlowError> {
        let workflow_id = ctx.workflow_id();
        let deadline = Instant::now() + self.config.workflow_timeout;
        let mut position = start;
        let mut executions = 0usize;

        while let Some(step) = steps.get(position) {
            if token.is_cancelled() {
                return Err(MagicFlowError::cancelled(workflow_id));
            }
            if self.shutdown.is_cancelled() {
                return Err(MagicFlowError::engine_shutdown().with_detail("workflow_id", workflow_id));
            }
            if ctx.status() == WorkflowStatus::Cancelled {
                return Err(MagicFlowError::cancelled(workflow_id));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MagicFlowError::workflow_timeout(
                    workflow_id,
                    self.config.workflow_timeout,
                ));
            }

            executions += 1;
            if executions > self.config.max_step_executions {
                return Err(MagicFlowError::resource_limit(
                    "step executions",
                    self.config.max_step_executions,
                )
                .with_detail("workflow_id", workflow_id));
            }

            let name = step.name();
            ctx.set_next_step(steps.get(position + 1).map(|s| s.name()));
            let step_timeout = step.timeout().unwrap_or(self.config.step_timeout);
            let remaining = deadline - now;
            let started = Instant::now();
            let outcome = match timeout(
                step_timeout.min(remaining),
                self.execute_step(step.as_ref(), ctx),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) if step_timeout < remaining => {
                    Err(MagicFlowError::step_timeout(&name, step_timeout))
                }
                Err(_) => Err(MagicFlowError::workflow_timeout(
                    workflow_id,
                    self.config.workflow_timeout,
                )),
            };

            if self.config.features.profiling {
                debug!(
                    workflow_id,
                    step = %name,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "Step timing"
                );
            }

            let target = match outcome {
                Ok(target) => target,
                Err(e) => {
                    self.events.emit(
                        self.event(EventKind::StepFailed, ctx)
                            .with_step(name)
                            .with_error(&e),
                    );
                    return Err(e);
                }
            };
            self.events.emit(
                self.event(EventKind::StepCompleted, ctx)
                    .with_step(name.clone())
                    .with_data(json!({
                        "step_order": ctx.step_order(),
                        "next": target.as_ref().map(StepName::as_str),
                    })),
            );

            position = match &target {
                Some(next) => position_of(steps, next).ok_or_else(|| {
                    MagicFlowError::step_not_found(next.clone())
                        .with_detail("workflow_id", workflow_id)
                        .with_detail("from", name.as_str())
                })?,
                None => position + 1,
            };
            ctx.advance_step_order();
            ctx.set_next_step(steps.get(position).map(|s| s.name()));

            if ctx.status() == WorkflowStatus::Paused {
                info!(workflow_id, step = %name, "Workflow paused");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Settles the final status and emits the matching lifecycle event.
    fn finish(
        &self,
        ctx: &WorkflowContext,
        outcome: Result<(), MagicFlowError>,
    ) -> Result<(), MagicFlowError> {
        let workflow_id = ctx.workflow_id();
        if self.config.features.metrics {
            ctx.set_metric("workflow.duration_ms", ctx.elapsed().as_millis() as u64);
            ctx.set_metric("workflow.steps_executed", ctx.step_order());
        }

        let outcome = match outcome {
            Ok(()) if ctx.status() == WorkflowStatus::Paused => {
                self.events.emit(
                    self.event(EventKind::WorkflowPaused, ctx)
                        .with_data(ctx.custom("wait_trigger").unwrap_or(Value::Null)),
                );
                return Ok(());
            }
            Ok(()) => ctx.complete(),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(
                    workflow_id,
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    "Workflow completed"
                );
                self.events
                    .emit(self.event(EventKind::WorkflowCompleted, ctx));
                Ok(())
            }
            Err(_) if ctx.status() == WorkflowStatus::Cancelled => {
                // cancel_workflow already emitted the event
                warn!(workflow_id, "Workflow stopped after cancellation");
                Err(MagicFlowError::cancelled(workflow_id))
            }
            Err(e) if e.is_cancellation() => {
                if ctx.cancel().is_ok() {
                    self.events.emit(
                        self.event(EventKind::WorkflowCancelled, ctx)
                            .with_error(&e),
                    );
                }
                warn!(workflow_id, error = %e, "Workflow cancelled");
                Err(e)
            }
            Err(e) => {
                if let Err(transition) = ctx.fail(e.clone()) {
                    warn!(
                        workflow_id,
                        error = %transition,
                        "Could not mark workflow failed"
                    );
                }
                error!(
                    workflow_id,
                    code = %e.code(),
                    error = %e,
                    "Workflow failed"
                );
                self.events
                    .emit(self.event(EventKind::WorkflowFailed, ctx).with_error(&e));
                Err(e)
            }
        }
    }

    async fn persist(&self, ctx: &WorkflowContext) -> Result<(), MagicFlowError> {
        let created_at = match self.storage.get(ctx.workflow_id()).await {
            Ok(existing) => Some(existing.created_at),
            Err(e) if e.code() == ErrorCode::StorageNotFound => None,
            Err(e) => return Err(e),
        };
        self.storage
            .save(WorkflowRecord::from_context(ctx, created_at))
            .await
    }

    async fn load_record(&self, workflow_id: &str) -> Result<WorkflowRecord, MagicFlowError> {
        self.storage.get(workflow_id).await.map_err(|e| {
            if e.code() == ErrorCode::StorageNotFound {
                MagicFlowError::workflow_not_found(workflow_id).with_cause(e)
            } else {
                e
            }
        })
    }

    fn event(&self, kind: EventKind, ctx: &WorkflowContext) -> WorkflowEvent {
        WorkflowEvent::new(kind, ctx.workflow_id(), ctx.workflow_name())
    }
}

fn position_of(steps: &[Arc<dyn Step>], name: &StepName) -> Option<usize> {
    steps.iter().position(|s| s.name() == *name)
}

/// Builder for [`WorkflowEngine`].
#[derive(Default)]
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    middleware: Option<MiddlewareChain>,
    storage: Option<Arc<dyn WorkflowStorage>>,
}

impl fmt::Debug for WorkflowEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngineBuilder")
            .field("config", &self.config)
            .field("middleware", &self.middleware)
            .field("custom_storage", &self.storage.is_some())
            .finish()
    }
}

impl WorkflowEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default chain from [`MiddlewareChain::with_defaults`].
    pub fn middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = Some(chain);
        self
    }

    /// Defaults to a fresh [`InMemoryStorage`].
    pub fn storage(mut self, storage: Arc<dyn WorkflowStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<WorkflowEngine, MagicFlowError> {
        self.config.validate()?;
        Ok(WorkflowEngine {
            events: EventDispatcher::new(self.config.event_buffer),
            middleware: self.middleware.unwrap_or_else(MiddlewareChain::with_defaults),
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(InMemoryStorage::new())),
            config: self.config,
            running: DashMap::new(),
            admitted: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        })
    }
}
