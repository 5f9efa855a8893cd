//! Error taxonomy shared by every magicflow component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::step::StepName;

/// How loudly an error should be reported.
///
/// Severity feeds log levels and alerting. It never drives control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected, self-healing conditions.
    Low,
    /// Failures of a single operation.
    Medium,
    /// Failures that stop a workflow.
    High,
    /// Crashes and conditions that need an operator.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Broad grouping of [`ErrorCode`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Workflow,
    Step,
    Storage,
    Messaging,
    Configuration,
    Validation,
    Security,
    System,
}

/// Closed set of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // workflow
    WorkflowNotFound,
    WorkflowInvalidState,
    WorkflowTimeout,
    WorkflowCancelled,
    WorkflowFailed,
    WorkflowExists,
    // step
    StepNotFound,
    StepFailed,
    StepTimeout,
    StepInvalidInput,
    StepInvalidOutput,
    StepPanic,
    // storage
    StorageConnection,
    StorageQuery,
    StorageTransaction,
    StorageNotFound,
    StorageConflict,
    // messaging
    MessagingConnection,
    MessagingPublish,
    MessagingSubscribe,
    MessagingTimeout,
    // configuration
    ConfigInvalid,
    ConfigMissing,
    ConfigLoad,
    ConfigSave,
    // validation
    Validation,
    // security
    Unauthorized,
    Forbidden,
    AuthFailed,
    // system
    Internal,
    NotSupported,
    RateLimit,
    ResourceLimit,
    EngineShutdown,
    RecoveryFailed,
}

impl ErrorCode {
    /// Returns the category this code belongs to.
    pub fn category(self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            WorkflowNotFound | WorkflowInvalidState | WorkflowTimeout | WorkflowCancelled
            | WorkflowFailed | WorkflowExists => ErrorCategory::Workflow,
            StepNotFound | StepFailed | StepTimeout | StepInvalidInput | StepInvalidOutput
            | StepPanic => ErrorCategory::Step,
            StorageConnection | StorageQuery | StorageTransaction | StorageNotFound
            | StorageConflict => ErrorCategory::Storage,
            MessagingConnection | MessagingPublish | MessagingSubscribe | MessagingTimeout => {
                ErrorCategory::Messaging
            }
            ConfigInvalid | ConfigMissing | ConfigLoad | ConfigSave => ErrorCategory::Configuration,
            Validation => ErrorCategory::Validation,
            Unauthorized | Forbidden | AuthFailed => ErrorCategory::Security,
            Internal | NotSupported | RateLimit | ResourceLimit | EngineShutdown
            | RecoveryFailed => ErrorCategory::System,
        }
    }

    /// Stable string form, e.g. `STEP_FAILED`.
    pub fn as_str(self) -> &'static str {
        use ErrorCode::*;
        match self {
            WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            WorkflowInvalidState => "WORKFLOW_INVALID_STATE",
            WorkflowTimeout => "WORKFLOW_TIMEOUT",
            WorkflowCancelled => "WORKFLOW_CANCELLED",
            WorkflowFailed => "WORKFLOW_FAILED",
            WorkflowExists => "WORKFLOW_EXISTS",
            StepNotFound => "STEP_NOT_FOUND",
            StepFailed => "STEP_FAILED",
            StepTimeout => "STEP_TIMEOUT",
            StepInvalidInput => "STEP_INVALID_INPUT",
            StepInvalidOutput => "STEP_INVALID_OUTPUT",
            StepPanic => "STEP_PANIC",
            StorageConnection => "STORAGE_CONNECTION",
            StorageQuery => "STORAGE_QUERY",
            StorageTransaction => "STORAGE_TRANSACTION",
            StorageNotFound => "STORAGE_NOT_FOUND",
            StorageConflict => "STORAGE_CONFLICT",
            MessagingConnection => "MESSAGING_CONNECTION",
            MessagingPublish => "MESSAGING_PUBLISH",
            MessagingSubscribe => "MESSAGING_SUBSCRIBE",
            MessagingTimeout => "MESSAGING_TIMEOUT",
            ConfigInvalid => "CONFIG_INVALID",
            ConfigMissing => "CONFIG_MISSING",
            ConfigLoad => "CONFIG_LOAD",
            ConfigSave => "CONFIG_SAVE",
            Validation => "VALIDATION",
            Unauthorized => "UNAUTHORIZED",
            Forbidden => "FORBIDDEN",
            AuthFailed => "AUTH_FAILED",
            Internal => "INTERNAL",
            NotSupported => "NOT_SUPPORTED",
            RateLimit => "RATE_LIMIT",
            ResourceLimit => "RESOURCE_LIMIT",
            EngineShutdown => "ENGINE_SHUTDOWN",
            RecoveryFailed => "RECOVERY_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, chainable error used across magicflow.
///
/// Every error carries a [`ErrorCode`], a human message and a [`Severity`].
/// Details are free-form JSON values keyed by name. An optional cause makes
/// the error chainable through [`std::error::Error::source`].
///
/// # Examples
///
/// ```
/// use magicflow_core::{ErrorCode, MagicFlowError, Severity};
///
/// let cause = MagicFlowError::validation("amount", "must be positive");
/// let error = MagicFlowError::step_failed("charge", cause);
///
/// assert_eq!(error.code(), ErrorCode::StepFailed);
/// assert_eq!(error.severity(), Severity::High);
/// assert_eq!(error.cause().map(|c| c.code()), Some(ErrorCode::Validation));
/// ```
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct MagicFlowError {
    code: ErrorCode,
    message: String,
    severity: Severity,
    details: BTreeMap<String, Value>,
    #[source]
    cause: Option<Box<MagicFlowError>>,
    stack: Option<String>,
    timestamp: DateTime<Utc>,
}

impl MagicFlowError {
    /// Creates an error with the default severity for `code`.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: default_severity(code),
            details: BTreeMap::new(),
            cause: None,
            stack: None,
            timestamp: Utc::now(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    /// Returns the directly wrapped error, if any.
    pub fn cause(&self) -> Option<&MagicFlowError> {
        self.cause.as_deref()
    }

    /// Returns the innermost error of the cause chain (or `self`).
    pub fn root_cause(&self) -> &MagicFlowError {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// Captured call stack, present for panics and explicitly attached stacks.
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: MagicFlowError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attaches the current call stack.
    pub fn with_stack(mut self) -> Self {
        self.stack = Some(Backtrace::force_capture().to_string());
        self
    }

    /// Whether retrying the failed operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::StepFailed
                | ErrorCode::StepTimeout
                | ErrorCode::WorkflowTimeout
                | ErrorCode::StorageConnection
                | ErrorCode::StorageTransaction
                | ErrorCode::MessagingConnection
                | ErrorCode::MessagingPublish
                | ErrorCode::MessagingTimeout
                | ErrorCode::RateLimit
        )
    }

    /// Whether this error reports a cancellation or shutdown.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::WorkflowCancelled | ErrorCode::EngineShutdown
        )
    }

    pub fn not_found(resource: &str, id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(ErrorCode::StorageNotFound, format!("{resource} not found: {id}"))
            .with_detail("resource", resource)
            .with_detail("id", id)
    }

    pub fn workflow_not_found(workflow_id: impl Into<String>) -> Self {
        let workflow_id = workflow_id.into();
        Self::new(
            ErrorCode::WorkflowNotFound,
            format!("workflow not found: {workflow_id}"),
        )
        .with_detail("workflow_id", workflow_id)
    }

    pub fn workflow_exists(workflow_id: impl Into<String>) -> Self {
        let workflow_id = workflow_id.into();
        Self::new(
            ErrorCode::WorkflowExists,
            format!("workflow is already running: {workflow_id}"),
        )
        .with_detail("workflow_id", workflow_id)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WorkflowInvalidState, message)
    }

    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::new(
            ErrorCode::WorkflowTimeout,
            format!("{operation} timed out after {}ms", after.as_millis()),
        )
        .with_detail("operation", operation)
        .with_detail("timeout_ms", after.as_millis() as u64)
    }

    pub fn workflow_timeout(workflow_id: &str, after: Duration) -> Self {
        Self::new(
            ErrorCode::WorkflowTimeout,
            format!(
                "workflow {workflow_id} exceeded its deadline of {}ms",
                after.as_millis()
            ),
        )
        .with_detail("workflow_id", workflow_id)
        .with_detail("timeout_ms", after.as_millis() as u64)
    }

    pub fn step_timeout(step_name: &StepName, after: Duration) -> Self {
        Self::new(
            ErrorCode::StepTimeout,
            format!("step {step_name} timed out after {}ms", after.as_millis()),
        )
        .with_detail("step", step_name.as_str())
        .with_detail("timeout_ms", after.as_millis() as u64)
    }

    pub fn cancelled(workflow_id: &str) -> Self {
        Self::new(
            ErrorCode::WorkflowCancelled,
            format!("workflow {workflow_id} was cancelled"),
        )
        .with_detail("workflow_id", workflow_id)
    }

    pub fn engine_shutdown() -> Self {
        Self::new(ErrorCode::EngineShutdown, "engine is shutting down")
    }

    /// Wraps `cause` as the failure of `step_name`.
    ///
    /// The severity is at least [`Severity::High`], keeping the cause's
    /// severity when it is higher (a wrapped panic stays critical).
    pub fn step_failed(step_name: impl Into<StepName>, cause: MagicFlowError) -> Self {
        let step_name = step_name.into();
        let severity = cause.severity().max(Severity::High);
        Self::new(
            ErrorCode::StepFailed,
            format!("step {step_name} failed: {}", cause.message()),
        )
        .with_detail("step", step_name.as_str())
        .with_severity(severity)
        .with_cause(cause)
    }

    /// A step-level failure that has no underlying error value.
    pub fn step_error(step_name: impl Into<StepName>, details: impl Into<String>) -> Self {
        let step_name = step_name.into();
        let details = details.into();
        Self::new(
            ErrorCode::StepFailed,
            format!("step {step_name} failed: {details}"),
        )
        .with_detail("step", step_name.as_str())
    }

    pub fn step_not_found(step_name: impl Into<StepName>) -> Self {
        let step_name = step_name.into();
        Self::new(ErrorCode::StepNotFound, format!("step not found: {step_name}"))
            .with_detail("step", step_name.as_str())
    }

    /// A panic converted into an error, with the stack captured at conversion.
    pub fn panic(step_name: impl Into<StepName>, payload: impl Into<String>) -> Self {
        let step_name = step_name.into();
        let payload = payload.into();
        Self::new(
            ErrorCode::StepPanic,
            format!("step {step_name} panicked: {payload}"),
        )
        .with_detail("step", step_name.as_str())
        .with_detail("panic", payload)
        .with_stack()
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            ErrorCode::Validation,
            format!("validation failed for {field}: {message}"),
        )
        .with_detail("field", field)
    }

    pub fn storage(operation: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            ErrorCode::StorageQuery,
            format!("storage {operation} failed: {message}"),
        )
        .with_detail("operation", operation)
    }

    pub fn messaging(topic: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            ErrorCode::MessagingPublish,
            format!("messaging on {topic} failed: {message}"),
        )
        .with_detail("topic", topic)
    }

    pub fn config(key: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            ErrorCode::ConfigInvalid,
            format!("invalid configuration {key}: {message}"),
        )
        .with_detail("key", key)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn rate_limit(resource: &str, retry_after: Duration) -> Self {
        Self::new(
            ErrorCode::RateLimit,
            format!("rate limit exceeded for {resource}"),
        )
        .with_detail("resource", resource)
        .with_detail("retry_after_ms", retry_after.as_millis() as u64)
    }

    pub fn resource_limit(resource: &str, limit: usize) -> Self {
        Self::new(
            ErrorCode::ResourceLimit,
            format!("{resource} limit of {limit} reached"),
        )
        .with_detail("resource", resource)
        .with_detail("limit", limit as u64)
    }

    pub fn recovery_failed(workflow_id: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(
            ErrorCode::RecoveryFailed,
            format!("recovery of {workflow_id} failed: {message}"),
        )
        .with_detail("workflow_id", workflow_id)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

fn default_severity(code: ErrorCode) -> Severity {
    use ErrorCode::*;
    match code {
        StepPanic | Internal => Severity::Critical,
        WorkflowFailed | StepFailed | WorkflowTimeout | StorageConnection
        | StorageTransaction | MessagingConnection | RecoveryFailed | AuthFailed => Severity::High,
        WorkflowCancelled | EngineShutdown | Validation | WorkflowExists | RateLimit => {
            Severity::Low
        }
        _ => Severity::Medium,
    }
}

impl From<serde_json::Error> for MagicFlowError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(ErrorCode::Validation, format!("serialization error: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let error = MagicFlowError::step_error("test_step", "test error");
        assert_eq!(
            error.to_string(),
            "[STEP_FAILED] step test_step failed: test error"
        );
    }

    #[test]
    fn test_default_severities() {
        assert_eq!(
            MagicFlowError::panic("s", "boom").severity(),
            Severity::Critical
        );
        assert_eq!(
            MagicFlowError::validation("id", "empty").severity(),
            Severity::Low
        );
        assert_eq!(
            MagicFlowError::workflow_not_found("wf").severity(),
            Severity::Medium
        );
    }

    #[test]
    fn test_step_failed_keeps_cause_chain() {
        let cause = MagicFlowError::panic("inner", "boom");
        let error = MagicFlowError::step_failed("outer", cause);

        assert_eq!(error.severity(), Severity::Critical);
        assert_eq!(error.detail("step"), Some(&Value::from("outer")));
        assert_eq!(error.root_cause().code(), ErrorCode::StepPanic);
        assert!(error.source().is_some());
        assert!(error.root_cause().stack().is_some());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::StepPanic.category(), ErrorCategory::Step);
        assert_eq!(ErrorCode::RateLimit.category(), ErrorCategory::System);
        assert_eq!(
            ErrorCode::StorageConflict.category(),
            ErrorCategory::Storage
        );
        assert_eq!(ErrorCode::Forbidden.category(), ErrorCategory::Security);
    }

    #[test]
    fn test_code_serializes_as_string() {
        let json = serde_json::to_string(&ErrorCode::WorkflowTimeout).unwrap();
        assert_eq!(json, "\"WORKFLOW_TIMEOUT\"");
        assert_eq!(ErrorCode::WorkflowTimeout.to_string(), "WORKFLOW_TIMEOUT");
    }

    #[test]
    fn test_retryable_and_cancellation() {
        assert!(MagicFlowError::step_error("s", "x").is_retryable());
        assert!(!MagicFlowError::validation("f", "x").is_retryable());
        assert!(MagicFlowError::cancelled("wf").is_cancellation());
        assert!(MagicFlowError::engine_shutdown().is_cancellation());
    }
}
