//! Recovery of failed workflows.
//!
//! A [`RecoveryManager`] picks a [`RecoveryPolicy`] by workflow name, applies
//! its strategy to the stored record and keeps a short history of attempts
//! per workflow. A background monitor can sweep storage for failed records
//! and recover them automatically once they have cooled down.

use crate::config::{duration_ms, RecoveryConfig};
use crate::engine::WorkflowEngine;
use crate::storage::{RecordFilter, WorkflowStorage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use magicflow_core::{
    ErrorCode, MagicFlowError, Step, StepName, WorkflowContext, WorkflowRecord, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RETRY_COUNT: &str = "retry_count";
const RESTART_COUNT: &str = "restart_count";
const RECOVERY_HALTED: &str = "recovery_halted";
const RECOVERY_MESSAGE: &str = "recovery_message";

/// What to do with a failed workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run the step that failed, with backoff.
    #[default]
    Retry,
    /// Move past the failed step.
    Skip,
    /// Leave it failed and stop automatic recovery.
    Fail,
    /// Back to `pending` with progress cleared.
    Restart,
    /// Ask a registered [`RecoveryHandler`].
    Custom,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Fail => "fail",
            Self::Restart => "restart",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workflow is recovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub strategy: RecoveryStrategy,
    pub max_retries: u32,
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Bound on a single recovery attempt, delay included.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategy::Retry,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
        }
    }
}

impl RecoveryPolicy {
    /// Builds a validated policy.
    pub fn new(
        strategy: RecoveryStrategy,
        max_retries: u32,
        retry_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
        timeout: Duration,
    ) -> Result<Self, MagicFlowError> {
        let policy = Self {
            strategy,
            max_retries,
            retry_delay,
            backoff_factor,
            max_delay,
            timeout,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// The default policy with another strategy.
    pub fn with_strategy(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), MagicFlowError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(MagicFlowError::config(
                "backoff_factor",
                format!("must be a finite number >= 1.0, got {}", self.backoff_factor),
            ));
        }
        if self.max_delay < self.retry_delay {
            return Err(MagicFlowError::config(
                "max_delay_ms",
                "must not be below retry_delay_ms",
            ));
        }
        if self.timeout.is_zero() {
            return Err(MagicFlowError::config(
                "timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Delay before the retry made after `count` earlier retries:
    /// `retry_delay × count × backoff_factor`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, count: u32) -> Duration {
        let nanos = self.retry_delay.as_nanos() as f64 * f64::from(count) * self.backoff_factor;
        let cap = self.max_delay.as_nanos() as f64;
        Duration::from_nanos(nanos.min(cap) as u64)
    }
}

/// One logged recovery attempt. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub workflow_id: String,
    /// Strategy of the policy in force.
    pub strategy: RecoveryStrategy,
    /// Built-in strategy that actually ran. Differs from `strategy` only
    /// when a custom handler made the choice.
    pub applied: RecoveryStrategy,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

/// Decision returned by a [`RecoveryHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub next_step: Option<StepName>,
    /// Merged into the workflow data before the strategy runs.
    pub data: HashMap<String, Value>,
    /// Overrides the policy delay for a retry.
    pub delay: Option<Duration>,
    pub message: Option<String>,
}

impl RecoveryAction {
    pub fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            next_step: None,
            data: HashMap::new(),
            delay: None,
            message: None,
        }
    }

    pub fn with_next_step(mut self, step: impl Into<StepName>) -> Self {
        self.next_step = Some(step.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Application logic behind [`RecoveryStrategy::Custom`].
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &WorkflowContext,
        error: &MagicFlowError,
    ) -> Result<RecoveryAction, MagicFlowError>;
}

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Marks a workflow as being recovered for as long as it lives.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Applies recovery strategies to failed workflows.
///
/// Retries re-run the failed step through [`WorkflowEngine::execute_step`],
/// so the steps that may need retrying must be registered with
/// [`register_step`](Self::register_step).
pub struct RecoveryManager {
    engine: Arc<WorkflowEngine>,
    config: RecoveryConfig,
    policies: RwLock<HashMap<String, RecoveryPolicy>>,
    steps: RwLock<HashMap<StepName, Arc<dyn Step>>>,
    handlers: RwLock<HashMap<String, Arc<dyn RecoveryHandler>>>,
    default_handler: RwLock<Option<Arc<dyn RecoveryHandler>>>,
    history: Mutex<HashMap<String, VecDeque<RecoveryAttempt>>>,
    in_flight: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<Monitor>>,
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &self.config)
            .field("monitoring", &self.is_monitoring())
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Creates a manager over the engine's storage.
    pub fn new(engine: Arc<WorkflowEngine>, config: RecoveryConfig) -> Result<Self, MagicFlowError> {
        config.validate()?;
        Ok(Self {
            engine,
            policies: RwLock::new(config.policies.clone()),
            config,
            steps: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(None),
            history: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        })
    }

    fn storage(&self) -> &Arc<dyn WorkflowStorage> {
        self.engine.storage()
    }

    /// Sets the policy for workflows named `workflow_name`.
    pub fn set_policy(
        &self,
        workflow_name: impl Into<String>,
        policy: RecoveryPolicy,
    ) -> Result<(), MagicFlowError> {
        policy.validate()?;
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow_name.into(), policy);
        Ok(())
    }

    /// The policy applied to workflows named `workflow_name`.
    pub fn policy_for(&self, workflow_name: &str) -> RecoveryPolicy {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_name)
            .cloned()
            .unwrap_or_else(|| self.config.default_policy.clone())
    }

    /// Makes `step` available to retries by its name.
    pub fn register_step(&self, step: Arc<dyn Step>) {
        self.steps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step.name(), step);
    }

    /// Handler for `Custom` recovery of workflows named `workflow_name`.
    pub fn register_handler(
        &self,
        workflow_name: impl Into<String>,
        handler: Arc<dyn RecoveryHandler>,
    ) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow_name.into(), handler);
    }

    /// Handler used when no workflow-specific one is registered.
    pub fn set_default_handler(&self, handler: Arc<dyn RecoveryHandler>) {
        *self
            .default_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Recovery attempts for `workflow_id`, oldest first.
    pub fn history(&self, workflow_id: &str) -> Vec<RecoveryAttempt> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .map(|attempts| attempts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_attempt(&self, workflow_id: &str) -> Option<RecoveryAttempt> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .and_then(|attempts| attempts.back().cloned())
    }

    /// Recovers `workflow_id` according to its policy.
    ///
    /// Every attempt that reaches a strategy is logged in the history,
    /// whatever its outcome. Fails with `WorkflowInvalidState` while another
    /// recovery of the same workflow is still in progress, while the engine
    /// is still running it, or when its record is not `failed`.
    pub async fn recover_workflow(
        &self,
        workflow_id: &str,
        error: &MagicFlowError,
    ) -> Result<RecoveryAttempt, MagicFlowError> {
        let _in_flight = self.begin(workflow_id)?;
        let started = Instant::now();

        let record = self.storage().get(workflow_id).await.map_err(|e| {
            if e.code() == ErrorCode::StorageNotFound {
                MagicFlowError::workflow_not_found(workflow_id).with_cause(e)
            } else {
                e
            }
        })?;
        if self.engine.get_context(workflow_id).is_some() {
            return Err(MagicFlowError::invalid_state(format!(
                "workflow {workflow_id} is still running"
            ))
            .with_detail("workflow_id", workflow_id));
        }
        if record.status != WorkflowStatus::Failed {
            return Err(MagicFlowError::invalid_state(format!(
                "workflow {workflow_id} is {} and cannot be recovered",
                record.status
            ))
            .with_detail("workflow_id", workflow_id)
            .with_detail("status", record.status.as_str()));
        }
        let policy = self.policy_for(&record.workflow_name);
        info!(
            workflow_id,
            workflow_name = %record.workflow_name,
            strategy = %policy.strategy,
            "Recovering workflow"
        );

        let mut applied = policy.strategy;
        let outcome = match tokio::time::timeout(
            policy.timeout,
            self.apply(record, &policy, error, &mut applied),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(MagicFlowError::timeout("recovery", policy.timeout)
                .with_detail("workflow_id", workflow_id)),
        };

        let attempt = RecoveryAttempt {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            strategy: policy.strategy,
            applied,
            timestamp: Utc::now(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            duration: started.elapsed(),
        };
        self.record_attempt(attempt.clone());

        match outcome {
            Ok(()) => {
                info!(
                    workflow_id,
                    strategy = %policy.strategy,
                    applied = %applied,
                    duration_ms = attempt.duration.as_millis() as u64,
                    "Workflow recovered"
                );
                Ok(attempt)
            }
            Err(e) => {
                error!(
                    workflow_id,
                    strategy = %policy.strategy,
                    code = %e.code(),
                    error = %e,
                    "Workflow recovery failed"
                );
                Err(e)
            }
        }
    }

    /// Spawns the background sweep. Does nothing if it is already running.
    pub fn start_monitor(self: &Arc<Self>, interval: Duration) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            debug!("Recovery monitor already running");
            return;
        }

        let token = self.shutdown.child_token();
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(run_monitor(manager, interval, token.clone()));
        info!(interval_ms = interval.as_millis() as u64, "Recovery monitor started");
        *monitor = Some(Monitor { token, handle });
    }

    /// Same as [`start_monitor`](Self::start_monitor) with the configured
    /// interval.
    pub fn start_default_monitor(self: &Arc<Self>) {
        self.start_monitor(self.config.monitor_interval);
    }

    /// Stops the background sweep and waits for it to exit.
    pub async fn stop_monitor(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Monitor { token, handle }) = monitor {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Recovery monitor task ended abnormally");
            }
            info!("Recovery monitor stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stops the monitor and interrupts pending retry delays.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_monitor().await;
    }

    /// Recovers every failed, cooled-down, non-halted record once.
    ///
    /// Returns the number of recoveries attempted.
    pub async fn sweep(&self) -> usize {
        let failed = match self
            .storage()
            .list(&RecordFilter::with_status(WorkflowStatus::Failed))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Could not list failed workflows");
                return 0;
            }
        };

        let cooldown = chrono::Duration::from_std(self.config.cooldown)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let now = Utc::now();
        let mut attempted = 0;
        for record in failed {
            if is_halted(&record) || now - record.updated_at < cooldown {
                continue;
            }
            if self
                .last_attempt(&record.id)
                .is_some_and(|last| now - last.timestamp < cooldown)
            {
                continue;
            }

            let error = record.last_error().unwrap_or_else(|| {
                MagicFlowError::new(ErrorCode::WorkflowFailed, "workflow failed")
            });
            attempted += 1;
            if let Err(e) = self.recover_workflow(&record.id, &error).await {
                debug!(workflow_id = %record.id, error = %e, "Monitor recovery attempt failed");
            }
        }
        attempted
    }

    fn begin(&self, workflow_id: &str) -> Result<InFlight<'_>, MagicFlowError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(workflow_id.to_string()) {
            return Err(MagicFlowError::invalid_state(format!(
                "workflow {workflow_id} is already being recovered"
            ))
            .with_detail("workflow_id", workflow_id));
        }
        Ok(InFlight {
            set: &self.in_flight,
            id: workflow_id.to_string(),
        })
    }

    fn record_attempt(&self, attempt: RecoveryAttempt) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let attempts = history.entry(attempt.workflow_id.clone()).or_default();
        attempts.push_back(attempt);
        while attempts.len() > self.config.history_limit {
            attempts.pop_front();
        }
    }

    async fn apply(
        &self,
        record: WorkflowRecord,
        policy: &RecoveryPolicy,
        error: &MagicFlowError,
        applied: &mut RecoveryStrategy,
    ) -> Result<(), MagicFlowError> {
        if policy.strategy != RecoveryStrategy::Custom {
            return self
                .apply_builtin(record, policy, policy.strategy, error, None)
                .await;
        }

        let handler = self.handler_for(&record.workflow_name).ok_or_else(|| {
            MagicFlowError::recovery_failed(&record.id, "no custom recovery handler registered")
        })?;
        let ctx = record.to_context();
        let action = handler.handle(&ctx, error).await?;
        if action.strategy == RecoveryStrategy::Custom {
            return Err(MagicFlowError::recovery_failed(
                &record.id,
                "custom handler must choose a built-in strategy",
            ));
        }
        debug!(
            workflow_id = %record.id,
            strategy = %action.strategy,
            "Custom handler chose a strategy"
        );
        *applied = action.strategy;

        if let Some(next) = action.next_step {
            ctx.set_next_step(Some(next));
        }
        ctx.extend_data(action.data);
        if let Some(message) = action.message {
            ctx.set_custom(RECOVERY_MESSAGE, message);
        }
        let updated = WorkflowRecord::from_context(&ctx, Some(record.created_at));
        self.apply_builtin(updated, policy, action.strategy, error, action.delay)
            .await
    }

    async fn apply_builtin(
        &self,
        record: WorkflowRecord,
        policy: &RecoveryPolicy,
        strategy: RecoveryStrategy,
        error: &MagicFlowError,
        delay: Option<Duration>,
    ) -> Result<(), MagicFlowError> {
        match strategy {
            RecoveryStrategy::Retry => self.retry(record, policy, delay).await,
            RecoveryStrategy::Skip => self.skip(record).await,
            RecoveryStrategy::Fail => self.fail(record, error).await,
            RecoveryStrategy::Restart => self.restart(record).await,
            RecoveryStrategy::Custom => Err(MagicFlowError::recovery_failed(
                &record.id,
                "custom strategy cannot be applied directly",
            )),
        }
    }

    async fn retry(
        &self,
        record: WorkflowRecord,
        policy: &RecoveryPolicy,
        delay: Option<Duration>,
    ) -> Result<(), MagicFlowError> {
        let workflow_id = record.id.as_str();
        let count = record
            .custom(RETRY_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        if count >= policy.max_retries {
            let ctx = record.to_context();
            ctx.set_custom(RECOVERY_HALTED, true);
            self.save(&ctx, &record).await?;
            return Err(MagicFlowError::recovery_failed(
                workflow_id,
                format!("retry limit of {} reached", policy.max_retries),
            )
            .with_detail(RETRY_COUNT, count));
        }

        let step_name = StepName::new(record.current_step.clone());
        let step = self
            .steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&step_name)
            .cloned()
            .ok_or_else(|| {
                MagicFlowError::step_not_found(step_name.clone())
                    .with_detail("workflow_id", workflow_id)
            })?;

        let delay = delay.unwrap_or_else(|| policy.delay_for_attempt(count));
        debug!(
            workflow_id,
            retry = count + 1,
            delay_ms = delay.as_millis() as u64,
            "Waiting before retry"
        );
        self.wait(delay).await?;

        let ctx = record.to_context();
        ctx.set_custom(RETRY_COUNT, count + 1);
        ctx.transition(WorkflowStatus::Running)?;
        ctx.clear_error();

        match self.engine.execute_step(step.as_ref(), &ctx).await {
            Ok(next) => {
                ctx.advance_step_order();
                ctx.set_next_step(next);
                self.save(&ctx, &record).await
            }
            Err(e) => {
                ctx.fail(e.clone())?;
                self.save(&ctx, &record).await?;
                Err(e)
            }
        }
    }

    async fn skip(&self, record: WorkflowRecord) -> Result<(), MagicFlowError> {
        let ctx = record.to_context();
        ctx.clear_error();
        match ctx.next_step() {
            Some(next) => {
                ctx.transition(WorkflowStatus::Running)?;
                info!(workflow_id = %record.id, step = %next, "Skipping to next step");
                ctx.set_current_step(next);
                ctx.set_next_step(None);
            }
            None => {
                ctx.set_next_step(None);
                ctx.complete()?;
                info!(workflow_id = %record.id, "Skipped last step, workflow completed");
            }
        }
        self.save(&ctx, &record).await
    }

    async fn fail(
        &self,
        record: WorkflowRecord,
        error: &MagicFlowError,
    ) -> Result<(), MagicFlowError> {
        let ctx = record.to_context();
        ctx.fail(error.clone())?;
        ctx.set_custom(RECOVERY_HALTED, true);
        self.save(&ctx, &record).await
    }

    async fn restart(&self, record: WorkflowRecord) -> Result<(), MagicFlowError> {
        let restarts = record
            .custom(RESTART_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        let ctx = record.to_context();
        ctx.restart()?;
        ctx.set_custom(RESTART_COUNT, restarts);
        info!(workflow_id = %record.id, restarts, "Workflow reset to pending");
        self.save(&ctx, &record).await
    }

    async fn save(
        &self,
        ctx: &WorkflowContext,
        original: &WorkflowRecord,
    ) -> Result<(), MagicFlowError> {
        self.storage()
            .update(WorkflowRecord::from_context(ctx, Some(original.created_at)))
            .await
    }

    async fn wait(&self, delay: Duration) -> Result<(), MagicFlowError> {
        if delay.is_zero() {
            return Ok(());
        }
        let engine_shutdown = self.engine.shutdown_token();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.shutdown.cancelled() => Err(MagicFlowError::engine_shutdown()),
            _ = engine_shutdown.cancelled() => Err(MagicFlowError::engine_shutdown()),
        }
    }

    fn handler_for(&self, workflow_name: &str) -> Option<Arc<dyn RecoveryHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_name)
            .cloned()
            .or_else(|| {
                self.default_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
    }
}

fn is_halted(record: &WorkflowRecord) -> bool {
    record.custom(RECOVERY_HALTED).and_then(Value::as_bool) == Some(true)
}

async fn run_monitor(manager: Weak<RecoveryManager>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                let attempted = manager.sweep().await;
                if attempted > 0 {
                    debug!(attempted, "Recovery sweep finished");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, factor: f64, max_ms: u64) -> RecoveryPolicy {
        RecoveryPolicy::new(
            RecoveryStrategy::Retry,
            3,
            Duration::from_millis(base_ms),
            factor,
            Duration::from_millis(max_ms),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_delay_formula() {
        let policy = policy(100, 2.0, 1_000);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(600));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(1_000));

        let fractional = self::policy(100, 1.5, 10_000);
        assert_eq!(fractional.delay_for_attempt(3), Duration::from_millis(450));
    }

    #[test]
    fn test_policy_validation() {
        let base = Duration::from_millis(100);
        let err = RecoveryPolicy::new(
            RecoveryStrategy::Retry,
            1,
            base,
            0.5,
            base,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigInvalid);

        let err = RecoveryPolicy::new(
            RecoveryStrategy::Retry,
            1,
            base,
            f64::NAN,
            base,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.detail("key"), Some(&Value::from("backoff_factor")));

        let err = RecoveryPolicy::new(
            RecoveryStrategy::Retry,
            1,
            base,
            2.0,
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.detail("key"), Some(&Value::from("max_delay_ms")));

        let err = RecoveryPolicy::new(
            RecoveryStrategy::Retry,
            1,
            base,
            2.0,
            base,
            Duration::ZERO,
        )
        .unwrap_err();
        assert_eq!(err.detail("key"), Some(&Value::from("timeout_ms")));
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_value(RecoveryStrategy::Restart).unwrap();
        assert_eq!(json, "restart");
        let parsed: RecoveryPolicy =
            serde_json::from_value(serde_json::json!({ "strategy": "custom", "max_retries": 7 }))
                .unwrap();
        assert_eq!(parsed.strategy, RecoveryStrategy::Custom);
        assert_eq!(parsed.max_retries, 7);
        assert_eq!(parsed.retry_delay, Duration::from_secs(1));
    }
}
