//! Lifecycle events and their dispatch.
//!
//! Every event goes two ways: to the handlers registered for its kind, each
//! spawned as its own task, and onto a broadcast bus that any number of
//! subscribers can read. Neither path can fail or slow down a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use magicflow_core::{MagicFlowError, StepName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowPaused,
    StepCompleted,
    StepFailed,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::WorkflowPaused => "workflow.paused",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::Custom(kind) => kind,
        }
    }

    pub fn custom(kind: impl Into<String>) -> Self {
        Self::from(kind.into())
    }
}

impl From<String> for EventKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "workflow.started" => Self::WorkflowStarted,
            "workflow.completed" => Self::WorkflowCompleted,
            "workflow.failed" => Self::WorkflowFailed,
            "workflow.cancelled" => Self::WorkflowCancelled,
            "workflow.paused" => Self::WorkflowPaused,
            "step.completed" => Self::StepCompleted,
            "step.failed" => Self::StepFailed,
            _ => Self::Custom(kind),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub workflow_id: String,
    pub workflow_name: String,
    pub step: Option<StepName>,
    #[serde(default)]
    pub data: Value,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(
        kind: EventKind,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            step: None,
            data: Value::Null,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<StepName>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_error(mut self, error: &MagicFlowError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receives events of the kinds it is registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WorkflowEvent) -> Result<(), MagicFlowError>;
}

type HandlerRegistry = HashMap<EventKind, Vec<Arc<dyn EventHandler>>>;

/// Fans events out to registered handlers and broadcast subscribers.
pub struct EventDispatcher {
    handlers: RwLock<HandlerRegistry>,
    sender: broadcast::Sender<WorkflowEvent>,
    runtime: Option<Handle>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventDispatcher")
            .field("kinds", &handlers.keys().collect::<Vec<_>>())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventDispatcher {
    /// Creates a dispatcher whose bus buffers `capacity` events per
    /// subscriber.
    ///
    /// When created inside a tokio runtime, handlers of events emitted from
    /// plain threads are spawned onto that runtime.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            sender,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, kind: &EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// A receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publishes `event` and spawns one task per registered handler.
    ///
    /// Handlers run on the current runtime, or on the one the dispatcher was
    /// created in. Without either, handlers are skipped with a warning and
    /// only broadcast subscribers see the event. Returns the number of
    /// handlers dispatched to.
    pub fn emit(&self, event: WorkflowEvent) -> usize {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        debug!(
            kind = %event.kind,
            workflow_id = %event.workflow_id,
            handlers = handlers.len(),
            "Emitting event"
        );

        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());

        if handlers.is_empty() {
            return 0;
        }
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.runtime.clone()) else {
            warn!(
                kind = %event.kind,
                workflow_id = %event.workflow_id,
                handlers = handlers.len(),
                "No tokio runtime available, event handlers skipped"
            );
            return 0;
        };

        let dispatched = handlers.len();
        let event = Arc::new(event);
        for handler in handlers {
            let event = Arc::clone(&event);
            runtime.spawn(async move {
                match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        kind = %event.kind,
                        workflow_id = %event.workflow_id,
                        error = %e,
                        "Event handler failed"
                    ),
                    Err(_) => error!(
                        kind = %event.kind,
                        workflow_id = %event.workflow_id,
                        "Event handler panicked"
                    ),
                }
            });
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<WorkflowEvent>);

    #[async_trait]
    impl EventHandler for Forward {
        async fn handle(&self, event: &WorkflowEvent) -> Result<(), MagicFlowError> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    struct Explodes;

    #[allow(clippy::panic)]
    #[async_trait]
    impl EventHandler for Explodes {
        async fn handle(&self, _event: &WorkflowEvent) -> Result<(), MagicFlowError> {
            panic!("handler bug");
        }
    }

    struct Fails;

    #[async_trait]
    impl EventHandler for Fails {
        async fn handle(&self, _event: &WorkflowEvent) -> Result<(), MagicFlowError> {
            Err(MagicFlowError::messaging("events", "downstream unavailable"))
        }
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in [
            EventKind::WorkflowStarted,
            EventKind::WorkflowPaused,
            EventKind::StepFailed,
            EventKind::custom("order.shipped"),
        ] {
            let name: String = kind.clone().into();
            assert_eq!(EventKind::from(name), kind);
        }
        assert_eq!(
            EventKind::custom("workflow.failed"),
            EventKind::WorkflowFailed
        );
        let json = serde_json::to_value(EventKind::StepCompleted).unwrap();
        assert_eq!(json, "step.completed");
    }

    #[tokio::test]
    async fn test_handlers_receive_only_their_kind() {
        let dispatcher = EventDispatcher::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(EventKind::WorkflowCompleted, Arc::new(Forward(tx)));

        assert_eq!(
            dispatcher.emit(WorkflowEvent::new(EventKind::WorkflowStarted, "w", "flow")),
            0
        );
        assert_eq!(
            dispatcher.emit(WorkflowEvent::new(EventKind::WorkflowCompleted, "w", "flow")),
            1
        );

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::WorkflowCompleted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_affect_others() {
        let dispatcher = EventDispatcher::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let kind = EventKind::custom("order.shipped");
        dispatcher.register(kind.clone(), Arc::new(Explodes));
        dispatcher.register(kind.clone(), Arc::new(Fails));
        dispatcher.register(kind.clone(), Arc::new(Forward(tx)));
        assert_eq!(dispatcher.handler_count(&kind), 3);

        dispatcher.emit(WorkflowEvent::new(kind, "w", "flow").with_data("parcel-1"));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.data, Value::from("parcel-1"));
    }

    #[tokio::test]
    async fn test_subscribers_see_every_event() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();

        dispatcher.emit(WorkflowEvent::new(EventKind::WorkflowStarted, "w", "flow"));
        dispatcher.emit(
            WorkflowEvent::new(EventKind::StepFailed, "w", "flow")
                .with_step("charge")
                .with_error(&MagicFlowError::step_error("charge", "declined")),
        );

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::WorkflowStarted);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.step.as_ref().map(StepName::as_str), Some("charge"));
        assert!(failed.error.unwrap().contains("declined"));
    }

    #[tokio::test]
    async fn test_emit_from_plain_thread_uses_creating_runtime() {
        let dispatcher = Arc::new(EventDispatcher::new(16));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(EventKind::WorkflowCancelled, Arc::new(Forward(tx)));

        let emitter = Arc::clone(&dispatcher);
        let dispatched = std::thread::spawn(move || {
            emitter.emit(WorkflowEvent::new(EventKind::WorkflowCancelled, "w", "flow"))
        })
        .join()
        .unwrap();
        assert_eq!(dispatched, 1);

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::WorkflowCancelled);
    }

    #[test]
    fn test_emit_without_runtime_still_broadcasts() {
        let dispatcher = EventDispatcher::new(16);
        let (tx, _rx) = mpsc::unbounded_channel();
        dispatcher.register(EventKind::WorkflowCancelled, Arc::new(Forward(tx)));
        let mut subscriber = dispatcher.subscribe();

        let dispatched =
            dispatcher.emit(WorkflowEvent::new(EventKind::WorkflowCancelled, "w", "flow"));

        assert_eq!(dispatched, 0);
        assert_eq!(
            subscriber.try_recv().unwrap().kind,
            EventKind::WorkflowCancelled
        );
    }
}
