//! Core types for the magicflow workflow engine.
//!
//! This crate has no async runtime dependency. Library authors depend on it to
//! implement custom steps; the `magicflow` crate adds the engine, middleware,
//! events and recovery on top.
//!
//! # Core Types
//!
//! - [`Step`] - The core trait for workflow steps
//! - [`WorkflowContext`] - Shared, synchronized state of one run
//! - [`WorkflowStatus`] - Run lifecycle state machine
//! - [`WorkflowRecord`] - Durable shape persisted by storage backends
//! - [`MagicFlowError`] - Structured error with code, severity and cause chain
//!
//! # Step Variants
//!
//! - [`FunctionStep`] - delegates to a closure
//! - [`ConditionalStep`] - branches on a predicate
//! - [`WaitStep`] - suspends until an external trigger
//! - [`ParallelStep`] - records a fan-out directive
//! - [`RetryStep`] - re-invokes a wrapped step on failure

mod context;
mod error;
mod record;
mod status;
mod step;
mod steps;

pub use context::{WorkflowContext, WorkflowMetadata};
pub use error::{ErrorCategory, ErrorCode, MagicFlowError, Severity};
pub use record::WorkflowRecord;
pub use status::WorkflowStatus;
pub use step::{Step, StepName, StepResult};
pub use steps::{ConditionalStep, FunctionStep, ParallelStep, RetryStep, WaitStep};
