//! A workflow orchestration engine for Rust.
//!
//! Workflows are ordered lists of [`Step`]s sharing one [`WorkflowContext`].
//! The [`WorkflowEngine`] runs them through a [`MiddlewareChain`], tracks
//! in-flight runs, persists [`WorkflowRecord`]s and emits lifecycle events.
//! Failed runs can be handed to a [`RecoveryManager`].
//!
//! # Example
//!
//! ```rust
//! use magicflow::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let engine = WorkflowEngine::builder().build()?;
//!
//! let request = WorkflowRequest::new("order-1", "order_processing")
//!     .data("amount", 150)
//!     .step(FunctionStep::new("validate", |ctx| {
//!         ctx.require("amount")?;
//!         Ok(None)
//!     }))
//!     .step(
//!         ConditionalStep::new("route", |ctx| Ok(ctx.get_as::<i64>("amount")? >= 100))
//!             .when_true("large")
//!             .when_false("small"),
//!     )
//!     .step(FunctionStep::new("large", |_| Ok(Some(StepName::new("confirm")))))
//!     .step(FunctionStep::new("small", |_| Ok(Some(StepName::new("confirm")))))
//!     .step(FunctionStep::new("confirm", |ctx| {
//!         ctx.set_step_result("confirm", "sent");
//!         Ok(None)
//!     }));
//!
//! let ctx = engine.execute(request).await?;
//! assert_eq!(ctx.status(), WorkflowStatus::Completed);
//! # Ok::<(), MagicFlowError>(())
//! # });
//! ```

mod config;
mod engine;
mod events;
mod middleware;
mod recovery;
mod storage;

// Re-export core types
pub use magicflow_core::*;

pub use config::{EngineConfig, FeatureFlags, MagicFlowConfig, RecoveryConfig};
pub use engine::{RunningWorkflow, WorkflowEngine, WorkflowEngineBuilder, WorkflowRequest};
pub use events::{EventDispatcher, EventHandler, EventKind, WorkflowEvent};
pub use middleware::{
    LoggingMiddleware, Middleware, MiddlewareChain, Next, PanicRecoveryMiddleware,
    TimeoutMiddleware, TimingMiddleware, ValidationMiddleware,
};
pub use recovery::{
    RecoveryAction, RecoveryAttempt, RecoveryHandler, RecoveryManager, RecoveryPolicy,
    RecoveryStrategy,
};
pub use storage::{InMemoryStorage, OrderBy, RecordFilter, StorageResult, WorkflowStorage};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        ConditionalStep, EventKind, FunctionStep, MagicFlowError, Middleware, MiddlewareChain,
        RecoveryManager, RecoveryPolicy, RecoveryStrategy, Step, StepName, StepResult,
        WorkflowContext, WorkflowEngine, WorkflowRequest, WorkflowStatus,
    };
}
