//! Built-in step variants.
//!
//! Each variant encodes a control-flow pattern behind the plain [`Step`]
//! trait, so the engine never needs to know which one it is running.

use crate::context::WorkflowContext;
use crate::error::MagicFlowError;
use crate::step::{Step, StepName, StepResult};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type StepFn = dyn Fn(&WorkflowContext) -> StepResult + Send + Sync;
type PredicateFn = dyn Fn(&WorkflowContext) -> Result<bool, MagicFlowError> + Send + Sync;

/// A step that delegates to a closure.
///
/// ```
/// use magicflow_core::{FunctionStep, Step, WorkflowContext};
///
/// let step = FunctionStep::new("greet", |ctx| {
///     ctx.insert("greeting", "hello");
///     Ok(None)
/// });
/// assert_eq!(step.name(), "greet");
/// ```
pub struct FunctionStep {
    name: StepName,
    description: String,
    timeout: Option<Duration>,
    handler: Option<Arc<StepFn>>,
}

impl FunctionStep {
    pub fn new<F>(name: impl Into<StepName>, handler: F) -> Self
    where
        F: Fn(&WorkflowContext) -> StepResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            timeout: None,
            handler: Some(Arc::new(handler)),
        }
    }

    /// A function step without a handler. Executing it fails.
    pub fn unconfigured(name: impl Into<StepName>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            timeout: None,
            handler: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for FunctionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionStep")
            .field("name", &self.name)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[async_trait]
impl Step for FunctionStep {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        match &self.handler {
            Some(handler) => handler(ctx),
            None => Err(MagicFlowError::step_error(
                self.name.clone(),
                "no handler configured",
            )),
        }
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Branches on a predicate evaluated against the context.
///
/// The chosen target is recorded as the context's next step. A branch
/// without a target ends the chain with `Ok(None)`.
pub struct ConditionalStep {
    name: StepName,
    description: String,
    predicate: Arc<PredicateFn>,
    on_true: Option<StepName>,
    on_false: Option<StepName>,
}

impl ConditionalStep {
    pub fn new<P>(name: impl Into<StepName>, predicate: P) -> Self
    where
        P: Fn(&WorkflowContext) -> Result<bool, MagicFlowError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            predicate: Arc::new(predicate),
            on_true: None,
            on_false: None,
        }
    }

    pub fn when_true(mut self, step: impl Into<StepName>) -> Self {
        self.on_true = Some(step.into());
        self
    }

    pub fn when_false(mut self, step: impl Into<StepName>) -> Self {
        self.on_false = Some(step.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for ConditionalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalStep")
            .field("name", &self.name)
            .field("on_true", &self.on_true)
            .field("on_false", &self.on_false)
            .finish()
    }
}

#[async_trait]
impl Step for ConditionalStep {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        let outcome = (self.predicate)(ctx)?;
        let target = if outcome {
            self.on_true.clone()
        } else {
            self.on_false.clone()
        };
        ctx.set_custom(format!("{}.condition", self.name), outcome);
        if target.is_some() {
            ctx.set_next_step(target.clone());
        }
        Ok(target)
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Suspends the workflow until an external trigger resumes it.
///
/// Records `wait_trigger` and `wait_started_at` in custom metadata and moves
/// the context to `paused`.
#[derive(Debug)]
pub struct WaitStep {
    name: StepName,
    trigger_key: String,
    next: Option<StepName>,
}

impl WaitStep {
    pub fn new(name: impl Into<StepName>, trigger_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger_key: trigger_key.into(),
            next: None,
        }
    }

    pub fn then(mut self, next: impl Into<StepName>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn trigger_key(&self) -> &str {
        &self.trigger_key
    }
}

#[async_trait]
impl Step for WaitStep {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        ctx.pause()?;
        ctx.set_custom("wait_trigger", self.trigger_key.clone());
        ctx.set_custom("wait_started_at", Utc::now().to_rfc3339());
        if self.next.is_some() {
            ctx.set_next_step(self.next.clone());
        }
        Ok(self.next.clone())
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }

    fn description(&self) -> &str {
        "waits for an external trigger"
    }
}

/// Records a fan-out directive without executing anything itself.
#[derive(Debug)]
pub struct ParallelStep {
    name: StepName,
    branches: Vec<StepName>,
    next: Option<StepName>,
}

impl ParallelStep {
    pub fn new<I, S>(name: impl Into<StepName>, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepName>,
    {
        Self {
            name: name.into(),
            branches: branches.into_iter().map(Into::into).collect(),
            next: None,
        }
    }

    pub fn then(mut self, next: impl Into<StepName>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn branches(&self) -> &[StepName] {
        &self.branches
    }
}

#[async_trait]
impl Step for ParallelStep {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        let branches: Vec<Value> = self
            .branches
            .iter()
            .map(|b| Value::from(b.as_str()))
            .collect();
        ctx.set_custom("parallel_steps", branches);
        ctx.set_custom(
            "parallel_next",
            self.next
                .as_ref()
                .map(|n| Value::from(n.as_str()))
                .unwrap_or(Value::Null),
        );
        Ok(None)
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }

    fn description(&self) -> &str {
        "fans out to parallel branches"
    }
}

/// Re-invokes a wrapped step up to `max_retries` additional times.
///
/// The retry counter lives on this value, so a single `RetryStep` must not
/// be shared between simultaneously running workflows.
#[derive(Debug)]
pub struct RetryStep {
    name: StepName,
    inner: Arc<dyn Step>,
    max_retries: u32,
    retries: AtomicU32,
}

impl RetryStep {
    /// Wraps `inner`, keeping its name.
    pub fn new(inner: Arc<dyn Step>, max_retries: u32) -> Self {
        Self {
            name: inner.name(),
            inner,
            max_retries,
            retries: AtomicU32::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<StepName>) -> Self {
        self.name = name.into();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Retries used by the most recent execution.
    pub fn retry_count(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for RetryStep {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        self.retries.store(0, Ordering::SeqCst);
        let mut attempt = 0;
        loop {
            match self.inner.execute(ctx).await {
                Ok(next) => {
                    ctx.set_metric(format!("{}.retry_count", self.name), attempt);
                    return Ok(next);
                }
                Err(error) => {
                    ctx.set_custom(
                        format!("{}.retry.{}", self.name, attempt + 1),
                        error.to_string(),
                    );
                    if attempt >= self.max_retries {
                        ctx.set_metric(format!("{}.retry_count", self.name), attempt);
                        let attempts = attempt + 1;
                        return Err(MagicFlowError::step_failed(
                            self.name.clone(),
                            error,
                        )
                        .with_detail("attempts", attempts));
                    }
                    attempt += 1;
                    self.retries.store(attempt, Ordering::SeqCst);
                }
            }
        }
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorCode, WorkflowStatus};

    /// Fails `failures` times, then succeeds.
    #[derive(Debug)]
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Step for Flaky {
        async fn execute(&self, _ctx: &WorkflowContext) -> StepResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(MagicFlowError::step_error("flaky", format!("failure {call}")))
            } else {
                Ok(Some(StepName::new("after")))
            }
        }

        fn name(&self) -> StepName {
            StepName::new("flaky")
        }
    }

    #[tokio::test]
    async fn test_function_step_runs_handler() {
        let step = FunctionStep::new("store", |ctx| {
            ctx.insert("stored", true);
            Ok(Some(StepName::new("next")))
        });
        let ctx = WorkflowContext::new("wf", "fn");

        assert_eq!(step.execute(&ctx).await.unwrap(), Some("next".into()));
        assert_eq!(ctx.get("stored"), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_function_step_without_handler_fails() {
        let step = FunctionStep::unconfigured("empty");
        let ctx = WorkflowContext::new("wf", "fn");

        let err = step.execute(&ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StepFailed);
    }

    #[tokio::test]
    async fn test_conditional_routes_by_predicate() {
        let step = ConditionalStep::new("branch", |ctx| Ok(ctx.get_as::<i64>("amount")? >= 100))
            .when_true("large")
            .when_false("small");

        let ctx = WorkflowContext::new("wf", "cond");
        ctx.insert("amount", 150);
        assert_eq!(step.execute(&ctx).await.unwrap(), Some("large".into()));
        assert_eq!(ctx.next_step(), Some("large".into()));

        ctx.insert("amount", 50);
        assert_eq!(step.execute(&ctx).await.unwrap(), Some("small".into()));
        assert_eq!(ctx.next_step(), Some("small".into()));
    }

    #[tokio::test]
    async fn test_conditional_without_target_ends_chain() {
        let step = ConditionalStep::new("branch", |_| Ok(false)).when_true("yes");
        let ctx = WorkflowContext::new("wf", "cond");

        assert_eq!(step.execute(&ctx).await.unwrap(), None);
        assert_eq!(ctx.next_step(), None);
    }

    #[tokio::test]
    async fn test_conditional_predicate_error_propagates() {
        let step = ConditionalStep::new("branch", |ctx| Ok(ctx.get_as::<i64>("amount")? > 0));
        let ctx = WorkflowContext::new("wf", "cond");

        let err = step.execute(&ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageNotFound);
    }

    #[tokio::test]
    async fn test_wait_step_pauses_workflow() {
        let step = WaitStep::new("await_approval", "approval:42").then("ship");
        let ctx = WorkflowContext::new("wf", "wait");
        ctx.start().unwrap();

        assert_eq!(step.execute(&ctx).await.unwrap(), Some("ship".into()));
        assert_eq!(ctx.status(), WorkflowStatus::Paused);
        assert_eq!(ctx.custom("wait_trigger"), Some(Value::from("approval:42")));
        assert!(ctx.custom("wait_started_at").is_some());
        assert_eq!(ctx.next_step(), Some("ship".into()));
    }

    #[tokio::test]
    async fn test_parallel_step_records_directive() {
        let step = ParallelStep::new("fan_out", ["email", "sms"]).then("join");
        let ctx = WorkflowContext::new("wf", "parallel");

        assert_eq!(step.execute(&ctx).await.unwrap(), None);
        assert_eq!(
            ctx.custom("parallel_steps"),
            Some(serde_json::json!(["email", "sms"]))
        );
        assert_eq!(ctx.custom("parallel_next"), Some(Value::from("join")));
    }

    #[tokio::test]
    async fn test_retry_step_recovers_after_failures() {
        let inner = Flaky::new(2);
        let step = RetryStep::new(inner.clone(), 3);
        let ctx = WorkflowContext::new("wf", "retry");

        assert_eq!(step.execute(&ctx).await.unwrap(), Some("after".into()));
        assert_eq!(step.retry_count(), 2);
        assert_eq!(ctx.metric("flaky.retry_count"), Some(Value::from(2)));
        assert!(ctx.custom("flaky.retry.1").is_some());
        assert!(ctx.custom("flaky.retry.2").is_some());
        assert!(ctx.custom("flaky.retry.3").is_none());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_step_gives_up_with_last_error() {
        let inner = Flaky::new(10);
        let step = RetryStep::new(inner.clone(), 2);
        let ctx = WorkflowContext::new("wf", "retry");

        let err = step.execute(&ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StepFailed);
        assert_eq!(err.detail("attempts"), Some(&Value::from(3)));
        assert!(err.cause().unwrap().message().contains("failure 3"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
