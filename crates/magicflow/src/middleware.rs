//! Middleware wrapped around every step invocation.
//!
//! A middleware receives the context and a [`Next`] handle. Calling
//! [`Next::run`] invokes the rest of the chain and finally the step itself,
//! so code before the call runs on the way in and code after it on the way
//! out:
//!
//! ```text
//! [A, B] around H:  A-before -> B-before -> H -> B-after -> A-after
//! ```

use crate::config::EngineConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use magicflow_core::{MagicFlowError, Severity, Step, StepName, StepResult, WorkflowContext};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Cross-cutting behavior around a step.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &WorkflowContext, next: Next<'_>) -> StepResult;

    /// Name used in logs and `Debug` output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The remainder of a middleware chain.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    step: &'a dyn Step,
    remaining: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub fn new(step: &'a dyn Step, remaining: &'a [Arc<dyn Middleware>]) -> Self {
        Self { step, remaining }
    }

    /// Runs the next middleware, or the step once the chain is exhausted.
    pub async fn run(self, ctx: &WorkflowContext) -> StepResult {
        match self.remaining.split_first() {
            Some((head, tail)) => head.handle(ctx, Next::new(self.step, tail)).await,
            None => self.step.execute(ctx).await,
        }
    }

    pub fn step(&self) -> &'a dyn Step {
        self.step
    }

    pub fn step_name(&self) -> StepName {
        self.step.name()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("step", &self.step.name())
            .field("remaining", &self.remaining.len())
            .finish()
    }
}

/// An ordered list of middleware, outermost first.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.middleware.iter().map(|m| m.name()))
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panic recovery, logging, timing and validation, in that order.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(PanicRecoveryMiddleware)
            .with(LoggingMiddleware)
            .with(TimingMiddleware)
            .with(ValidationMiddleware::new())
    }

    /// Appends `middleware` inside the ones already added.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Runs `step` through the whole chain.
    pub async fn run(&self, step: &dyn Step, ctx: &WorkflowContext) -> StepResult {
        Next::new(step, &self.middleware).run(ctx).await
    }
}

/// Logs step entry, exit and failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, ctx: &WorkflowContext, next: Next<'_>) -> StepResult {
        let step = next.step_name();
        let order = ctx.step_order();
        info!(
            workflow_id = ctx.workflow_id(),
            step = %step,
            step_order = order,
            "Step started"
        );

        let result = next.run(ctx).await;
        match &result {
            Ok(next_step) => info!(
                workflow_id = ctx.workflow_id(),
                step = %step,
                step_order = order,
                next = next_step.as_ref().map(StepName::as_str),
                "Step finished"
            ),
            Err(e) => match e.severity() {
                Severity::Critical | Severity::High => error!(
                    workflow_id = ctx.workflow_id(),
                    step = %step,
                    step_order = order,
                    code = %e.code(),
                    error = %e,
                    "Step failed"
                ),
                Severity::Medium => warn!(
                    workflow_id = ctx.workflow_id(),
                    step = %step,
                    step_order = order,
                    code = %e.code(),
                    error = %e,
                    "Step failed"
                ),
                Severity::Low => info!(
                    workflow_id = ctx.workflow_id(),
                    step = %step,
                    step_order = order,
                    code = %e.code(),
                    error = %e,
                    "Step failed"
                ),
            },
        }
        result
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Records how long each step took.
///
/// Sets the metric `<step>.duration_ms` and the custom fields
/// `<step>.started_at` and `<step>.finished_at` (RFC 3339), also when the
/// step fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingMiddleware;

#[async_trait]
impl Middleware for TimingMiddleware {
    async fn handle(&self, ctx: &WorkflowContext, next: Next<'_>) -> StepResult {
        let step = next.step_name();
        ctx.set_custom(format!("{step}.started_at"), Utc::now().to_rfc3339());
        let started = Instant::now();

        let result = next.run(ctx).await;

        let elapsed = started.elapsed().as_millis() as u64;
        ctx.set_metric(format!("{step}.duration_ms"), elapsed);
        ctx.set_custom(format!("{step}.finished_at"), Utc::now().to_rfc3339());
        result
    }

    fn name(&self) -> &str {
        "timing"
    }
}

/// Rejects invocations with an empty workflow id, an empty step name, or
/// missing required data keys.
#[derive(Debug, Clone, Default)]
pub struct ValidationMiddleware {
    required_keys: Vec<String>,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_key(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(&self, ctx: &WorkflowContext, next: Next<'_>) -> StepResult {
        if ctx.workflow_id().is_empty() {
            return Err(MagicFlowError::validation(
                "workflow_id",
                "workflow id must not be empty",
            ));
        }
        if next.step_name().is_empty() {
            return Err(MagicFlowError::validation(
                "step",
                "step name must not be empty",
            ));
        }
        if let Some(missing) = self.required_keys.iter().find(|k| !ctx.contains_key(k)) {
            return Err(MagicFlowError::validation(
                missing,
                format!("required key '{missing}' is missing"),
            )
            .with_detail("step", next.step_name().as_str()));
        }
        next.run(ctx).await
    }

    fn name(&self) -> &str {
        "validation"
    }
}

/// Turns a panic anywhere further down the chain into a `StepPanic` error.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicRecoveryMiddleware;

#[async_trait]
impl Middleware for PanicRecoveryMiddleware {
    async fn handle(&self, ctx: &WorkflowContext, next: Next<'_>) -> StepResult {
        let step = next.step_name();
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    workflow_id = ctx.workflow_id(),
                    step = %step,
                    panic = %message,
                    "Step panicked"
                );
                Err(MagicFlowError::panic(step, message))
            }
        }
    }

    fn name(&self) -> &str {
        "panic_recovery"
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Bounds the rest of the chain with a fixed duration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Uses `middleware_timeout` from the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.middleware_timeout)
    }
}

impl Default for TimeoutMiddleware {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, ctx: &WorkflowContext, next: Next<'_>) -> StepResult {
        let step = next.step_name();
        match tokio::time::timeout(self.timeout, next.run(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    workflow_id = ctx.workflow_id(),
                    step = %step,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Step exceeded middleware timeout"
                );
                Err(MagicFlowError::step_timeout(&step, self.timeout))
            }
        }
    }

    fn name(&self) -> &str {
        "timeout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magicflow_core::{ErrorCode, FunctionStep};
    use std::sync::Mutex;

    /// Appends `<label>-before` / `<label>-after` to a shared log.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: &WorkflowContext, next: Next<'_>) -> StepResult {
            self.log.lock().unwrap().push(format!("{}-before", self.label));
            let result = next.run(ctx).await;
            self.log.lock().unwrap().push(format!("{}-after", self.label));
            result
        }
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl Step for Slow {
        async fn execute(&self, _ctx: &WorkflowContext) -> StepResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        fn name(&self) -> StepName {
            StepName::new("slow")
        }
    }

    #[derive(Debug)]
    struct Panics;

    #[allow(clippy::panic)]
    #[async_trait]
    impl Step for Panics {
        async fn execute(&self, _ctx: &WorkflowContext) -> StepResult {
            panic!("index out of range");
        }

        fn name(&self) -> StepName {
            StepName::new("panics")
        }
    }

    #[tokio::test]
    async fn test_chain_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let step = FunctionStep::new("H", move |_| {
            handler_log.lock().unwrap().push("H".to_string());
            Ok(None)
        });
        let chain = MiddlewareChain::new()
            .with(Recorder {
                label: "A",
                log: Arc::clone(&log),
            })
            .with(Recorder {
                label: "B",
                log: Arc::clone(&log),
            });

        let ctx = WorkflowContext::new("wf", "order");
        chain.run(&step, &ctx).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["A-before", "B-before", "H", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_invokes_step_directly() {
        let step = FunctionStep::new("direct", |_| Ok(Some(StepName::new("next"))));
        let ctx = WorkflowContext::new("wf", "direct");
        let next = MiddlewareChain::new().run(&step, &ctx).await.unwrap();
        assert_eq!(next, Some(StepName::new("next")));
    }

    #[tokio::test]
    async fn test_timing_records_metrics_on_failure() {
        let step = FunctionStep::new("charge", |_| {
            Err(MagicFlowError::step_error("charge", "declined"))
        });
        let ctx = WorkflowContext::new("wf", "timing");
        let chain = MiddlewareChain::new().with(TimingMiddleware);

        assert!(chain.run(&step, &ctx).await.is_err());
        assert!(ctx.metric("charge.duration_ms").is_some());
        assert!(ctx.custom("charge.started_at").is_some());
        assert!(ctx.custom("charge.finished_at").is_some());
    }

    #[tokio::test]
    async fn test_validation_rejects_missing_key() {
        let step = FunctionStep::new("ship", |_| Ok(None));
        let chain = MiddlewareChain::new().with(ValidationMiddleware::new().require_key("address"));

        let ctx = WorkflowContext::new("wf", "validation");
        let err = chain.run(&step, &ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        ctx.insert("address", "1 Main St");
        assert!(chain.run(&step, &ctx).await.is_ok());

        let anonymous = WorkflowContext::new("", "validation");
        anonymous.insert("address", "1 Main St");
        let err = chain.run(&step, &anonymous).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_panic_becomes_critical_error() {
        let ctx = WorkflowContext::new("wf", "panics");
        let err = MiddlewareChain::with_defaults()
            .run(&Panics, &ctx)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::StepPanic);
        assert_eq!(err.severity(), Severity::Critical);
        assert!(err.message().contains("index out of range"));
        assert!(err.stack().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_middleware() {
        let ctx = WorkflowContext::new("wf", "timeout");
        let chain = MiddlewareChain::new().with(TimeoutMiddleware::new(Duration::from_millis(50)));

        let err = chain.run(&Slow, &ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StepTimeout);
    }

    #[test]
    fn test_default_chain_names() {
        let chain = MiddlewareChain::with_defaults();
        assert_eq!(chain.len(), 4);
        assert_eq!(
            format!("{chain:?}"),
            r#"["panic_recovery", "logging", "timing", "validation"]"#
        );
    }
}
