//! Step trait and step names.

use crate::context::WorkflowContext;
use crate::error::MagicFlowError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&StepName> for StepName {
    fn from(s: &StepName) -> Self {
        s.clone()
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Result of a single step: an optional hint naming the step to run next.
pub type StepResult = Result<Option<StepName>, MagicFlowError>;

/// A unit of work in a workflow.
///
/// Steps read and write the shared [`WorkflowContext`] through its
/// synchronized accessors and return the name of the step to jump to, or
/// `None` to let the engine advance to the next step in list order.
///
/// # Examples
///
/// ```
/// use magicflow_core::{MagicFlowError, Step, StepName, WorkflowContext};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct ReserveStock;
///
/// #[async_trait]
/// impl Step for ReserveStock {
///     async fn execute(&self, ctx: &WorkflowContext) -> Result<Option<StepName>, MagicFlowError> {
///         ctx.insert("reserved", true);
///         Ok(None)
///     }
///
///     fn name(&self) -> StepName {
///         StepName::new("reserve_stock")
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Executes the step logic.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(name))` - jump to the named step
    /// - `Ok(None)` - end of this chain segment, advance positionally
    /// - `Err(error)` - step failed
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult;

    /// Returns the step name.
    fn name(&self) -> StepName;

    fn description(&self) -> &str {
        ""
    }

    /// Per-step timeout. `None` uses the engine's configured step timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl<S: Step + ?Sized> Step for Arc<S> {
    async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
        (**self).execute(ctx).await
    }

    fn name(&self) -> StepName {
        (**self).name()
    }

    fn description(&self) -> &str {
        (**self).description()
    }

    fn timeout(&self) -> Option<Duration> {
        (**self).timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct EchoStep;

    #[async_trait]
    impl Step for EchoStep {
        async fn execute(&self, ctx: &WorkflowContext) -> StepResult {
            ctx.insert("echo", "executed");
            Ok(Some(StepName::new("next_step")))
        }

        fn name(&self) -> StepName {
            StepName::new("echo")
        }
    }

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");

        let name: StepName = "test".into();
        assert_eq!(name, "test");
        assert!(!name.is_empty());
    }

    #[tokio::test]
    async fn test_step_execution_through_arc() {
        let step: Arc<dyn Step> = Arc::new(EchoStep);
        let ctx = WorkflowContext::new("wf-1", "echo-flow");

        let next = step.execute(&ctx).await.unwrap();
        assert_eq!(next, Some(StepName::new("next_step")));
        assert_eq!(ctx.get_as::<String>("echo").unwrap(), "executed");
        assert_eq!(step.timeout(), None);
    }
}
