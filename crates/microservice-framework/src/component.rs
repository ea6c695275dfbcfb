//! # Lifecycle Components
//!
//! The `LifecycleComponent` trait defines the contract every independently
//! initializable/startable/stoppable unit of a microservice satisfies: API demuxes,
//! API channels, broker consumer runtimes, and the microservice itself.
//!
//! # Architecture Note
//! The state machine is written *once*, in [`Lifecycle`], and embedded in every
//! component. Implementors only supply the `lifecycle()` accessor and override the
//! hooks they care about:
//! - [`LifecycleComponent::on_initialize`]
//! - [`LifecycleComponent::on_start`]
//! - [`LifecycleComponent::on_stop`]
//!
//! The default hook does nothing (`Ok(())`). The provided `initialize`, `start` and
//! `stop` methods guard the hooks with the transition table below, so a hook is never
//! re-run once its target state has been reached.
//!
//! # Transition Table
//!
//! | action       | runs hook from              | no-op when            | rejected when                      |
//! |--------------|-----------------------------|-----------------------|------------------------------------|
//! | `initialize` | Created, Stopped, Error     | Initialized, Started  | Initializing, Starting, Stopping   |
//! | `start`      | Initialized, Stopped        | Started               | Created, Error, any in-progress    |
//! | `stop`       | Initialized, Started, Error | Created, Stopped      | any in-progress                    |
//!
//! A failing hook moves the component to `Error`, records the error and returns it.
//! `Error` ends that lifecycle pass; the component stays addressable for diagnostics
//! and may be stopped or re-initialized.

use crate::error::{BoxError, LifecycleError};
use crate::monitor::ProgressMonitor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, Instrument, Span};
use uuid::Uuid;

/// Stable, process-unique component identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ComponentId(Uuid);

impl ComponentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ComponentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable state of a lifecycle component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Created,
    Initializing,
    Initialized,
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl LifecycleState {
    /// True while an operation is running against the component.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            LifecycleState::Initializing | LifecycleState::Starting | LifecycleState::Stopping
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        };
        f.write_str(s)
    }
}

/// The three lifecycle operations a step can bind to a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleAction {
    Initialize,
    Start,
    Stop,
}

impl LifecycleAction {
    fn in_progress_state(self) -> LifecycleState {
        match self {
            LifecycleAction::Initialize => LifecycleState::Initializing,
            LifecycleAction::Start => LifecycleState::Starting,
            LifecycleAction::Stop => LifecycleState::Stopping,
        }
    }

    fn completed_state(self) -> LifecycleState {
        match self {
            LifecycleAction::Initialize => LifecycleState::Initialized,
            LifecycleAction::Start => LifecycleState::Started,
            LifecycleAction::Stop => LifecycleState::Stopped,
        }
    }

    /// Capitalized verb used in step and operation names ("Initialize", "Start", "Stop").
    pub fn verb(self) -> &'static str {
        match self {
            LifecycleAction::Initialize => "Initialize",
            LifecycleAction::Start => "Start",
            LifecycleAction::Stop => "Stop",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleAction::Initialize => "initialize",
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
        };
        f.write_str(s)
    }
}

enum Plan {
    Run,
    Skip,
    Reject,
}

fn plan(action: LifecycleAction, state: LifecycleState) -> Plan {
    use LifecycleAction::*;
    use LifecycleState::*;

    if state.is_in_progress() {
        return Plan::Reject;
    }
    match (action, state) {
        (Initialize, Created | Stopped | Error) => Plan::Run,
        (Initialize, Initialized | Started) => Plan::Skip,
        (Start, Initialized | Stopped) => Plan::Run,
        (Start, Started) => Plan::Skip,
        (Start, Created | Error) => Plan::Reject,
        (Stop, Initialized | Started | Error) => Plan::Run,
        (Stop, Created | Stopped) => Plan::Skip,
        _ => Plan::Reject,
    }
}

struct LifecycleInner {
    state: LifecycleState,
    last_error: Option<LifecycleError>,
    parent: Option<Weak<dyn LifecycleComponent>>,
    children: Vec<Arc<dyn LifecycleComponent>>,
}

/// State-machine core embedded in every component.
///
/// Owns the id, display name, current state, last error, the weak parent
/// back-reference (for reporting only) and the ordered list of children.
/// The logger handle is a `tracing::Span` injected at construction; every event
/// the lifecycle emits is recorded inside it.
pub struct Lifecycle {
    id: ComponentId,
    name: String,
    logger: Span,
    inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
    /// Creates a lifecycle whose logger span is derived from the component name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = ComponentId::new();
        let logger = tracing::info_span!("component", name = %name, %id);
        Self::build(id, name, logger)
    }

    /// Creates a lifecycle that logs into the supplied span.
    pub fn with_logger(name: impl Into<String>, logger: Span) -> Self {
        Self::build(ComponentId::new(), name.into(), logger)
    }

    fn build(id: ComponentId, name: String, logger: Span) -> Self {
        Self {
            id,
            name,
            logger,
            inner: Mutex::new(LifecycleInner {
                state: LifecycleState::Created,
                last_error: None,
                parent: None,
                children: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The component's logger handle.
    pub fn logger(&self) -> &Span {
        &self.logger
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn last_error(&self) -> Option<LifecycleError> {
        self.inner.lock().last_error.clone()
    }

    /// Parent component, if one is attached and still alive.
    pub fn parent(&self) -> Option<Arc<dyn LifecycleComponent>> {
        let weak = self.inner.lock().parent.clone();
        weak.and_then(|p| p.upgrade())
    }

    pub fn set_parent(&self, parent: Weak<dyn LifecycleComponent>) {
        self.inner.lock().parent = Some(parent);
    }

    /// Children in attachment order.
    pub fn children(&self) -> Vec<Arc<dyn LifecycleComponent>> {
        self.inner.lock().children.clone()
    }

    /// Records `child` as owned by this component and points its parent back here.
    pub fn adopt(&self, me: Weak<dyn LifecycleComponent>, child: Arc<dyn LifecycleComponent>) {
        child.lifecycle().set_parent(me);
        self.inner.lock().children.push(child);
    }

    /// Drops the child with the given id. Returns true if it was attached.
    pub fn release_child(&self, id: ComponentId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.children.len();
        inner.children.retain(|c| c.id() != id);
        inner.children.len() != before
    }

    /// Runs `hook` as the body of `action`, applying the transition table.
    ///
    /// The state lock is only held while checking and updating the state, never
    /// while the hook runs.
    pub async fn transition<F>(&self, action: LifecycleAction, hook: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = Result<(), BoxError>> + Send,
    {
        {
            let mut inner = self.inner.lock();
            match plan(action, inner.state) {
                Plan::Skip => {
                    debug!(parent: &self.logger, %action, state = %inner.state, "Already reached, skipping");
                    return Ok(());
                }
                Plan::Reject => {
                    return Err(LifecycleError::InvalidState {
                        id: self.id,
                        name: self.name.clone(),
                        action,
                        state: inner.state,
                    });
                }
                Plan::Run => inner.state = action.in_progress_state(),
            }
        }

        debug!(parent: &self.logger, %action, "Transition started");
        match hook.instrument(self.logger.clone()).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                // Background work may have failed the component while the hook ran.
                if inner.state != action.in_progress_state() {
                    if let Some(err) = inner.last_error.clone() {
                        return Err(err);
                    }
                }
                inner.state = action.completed_state();
                drop(inner);
                info!(parent: &self.logger, %action, "Transition complete");
                Ok(())
            }
            Err(source) => Err(self.fail(action, source)),
        }
    }

    /// Moves the component to `Error` and records `source` as its last error.
    ///
    /// Used by transitions and by background work (such as a consumer receive loop)
    /// that fails outside of an explicit lifecycle call.
    pub fn fail(&self, action: LifecycleAction, source: BoxError) -> LifecycleError {
        let err = LifecycleError::Failed {
            id: self.id,
            name: self.name.clone(),
            action,
            source: Arc::from(source),
        };
        let mut inner = self.inner.lock();
        inner.state = LifecycleState::Error;
        inner.last_error = Some(err.clone());
        error!(parent: &self.logger, %action, error = %err, "Component failed");
        err
    }

    /// Diagnostic snapshot of this component and its children.
    pub fn status(&self) -> ComponentStatus {
        let (state, last_error, parent, children) = {
            let inner = self.inner.lock();
            (
                inner.state,
                inner.last_error.as_ref().map(|e| e.to_string()),
                inner.parent.clone(),
                inner.children.clone(),
            )
        };
        ComponentStatus {
            id: self.id,
            name: self.name.clone(),
            state,
            last_error,
            parent: parent
                .and_then(|p| p.upgrade())
                .map(|p| p.name().to_string()),
            children: children.iter().map(|c| c.status()).collect(),
        }
    }
}

/// Read-only diagnostic view of a component tree.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub id: ComponentId,
    pub name: String,
    pub state: LifecycleState,
    pub last_error: Option<String>,
    pub parent: Option<String>,
    pub children: Vec<ComponentStatus>,
}

/// Contract for every lifecycle-managed unit.
///
/// # Async & Object Safety
/// The trait is `#[async_trait]` so hooks can await other components, and so
/// heterogeneous components can be held as `Arc<dyn LifecycleComponent>` by steps
/// and parents.
#[async_trait]
pub trait LifecycleComponent: Send + Sync {
    /// Access the embedded state machine.
    fn lifecycle(&self) -> &Lifecycle;

    // --- Lifecycle Hooks (Async) ---

    /// Acquire resources. Anything acquired must be released again if a later part
    /// of this hook fails.
    async fn on_initialize(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        Ok(())
    }

    /// Begin serving.
    async fn on_start(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        Ok(())
    }

    /// Stop serving and release resources.
    async fn on_stop(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        Ok(())
    }

    // --- Provided Methods ---

    fn id(&self) -> ComponentId {
        self.lifecycle().id()
    }

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle().state()
    }

    fn last_error(&self) -> Option<LifecycleError> {
        self.lifecycle().last_error()
    }

    fn status(&self) -> ComponentStatus {
        self.lifecycle().status()
    }

    async fn initialize(&self, monitor: &ProgressMonitor) -> Result<(), LifecycleError> {
        self.lifecycle()
            .transition(LifecycleAction::Initialize, self.on_initialize(monitor))
            .await
    }

    async fn start(&self, monitor: &ProgressMonitor) -> Result<(), LifecycleError> {
        self.lifecycle()
            .transition(LifecycleAction::Start, self.on_start(monitor))
            .await
    }

    async fn stop(&self, monitor: &ProgressMonitor) -> Result<(), LifecycleError> {
        self.lifecycle()
            .transition(LifecycleAction::Stop, self.on_stop(monitor))
            .await
    }

    /// Dispatches `action` to the matching provided method.
    async fn perform(
        &self,
        action: LifecycleAction,
        monitor: &ProgressMonitor,
    ) -> Result<(), LifecycleError> {
        match action {
            LifecycleAction::Initialize => self.initialize(monitor).await,
            LifecycleAction::Start => self.start(monitor).await,
            LifecycleAction::Stop => self.stop(monitor).await,
        }
    }
}

/// Attaches `child` to `parent`: the parent owns the child, the child keeps a weak
/// back-reference for reporting.
pub fn attach_child<P>(parent: &Arc<P>, child: Arc<dyn LifecycleComponent>)
where
    P: LifecycleComponent + 'static,
{
    let me: Weak<P> = Arc::downgrade(parent);
    let me: Weak<dyn LifecycleComponent> = me;
    parent.lifecycle().adopt(me, child);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        lifecycle: Lifecycle,
        starts: AtomicUsize,
        fail_start: bool,
    }

    impl Counter {
        fn new(fail_start: bool) -> Self {
            Self {
                lifecycle: Lifecycle::new("counter"),
                starts: AtomicUsize::new(0),
                fail_start,
            }
        }
    }

    #[async_trait]
    impl LifecycleComponent for Counter {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }

        async fn on_start(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err("port already bound".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let monitor = ProgressMonitor::new("test");
        let c = Counter::new(false);
        c.initialize(&monitor).await.unwrap();
        c.start(&monitor).await.unwrap();
        c.start(&monitor).await.unwrap();
        assert_eq!(c.state(), LifecycleState::Started);
        assert_eq!(c.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_before_initialize_is_rejected() {
        let monitor = ProgressMonitor::new("test");
        let c = Counter::new(false);
        let err = c.start(&monitor).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState {
                state: LifecycleState::Created,
                action: LifecycleAction::Start,
                ..
            }
        ));
        assert_eq!(c.starts.load(Ordering::SeqCst), 0);
        assert_eq!(c.state(), LifecycleState::Created);
    }

    #[tokio::test]
    async fn test_failed_hook_sets_error_state() {
        let monitor = ProgressMonitor::new("test");
        let c = Counter::new(true);
        c.initialize(&monitor).await.unwrap();
        let err = c.start(&monitor).await.unwrap_err();
        assert_eq!(err.component_id(), c.id());
        assert_eq!(err.action(), LifecycleAction::Start);
        assert!(err.to_string().contains("port already bound"));
        assert_eq!(c.state(), LifecycleState::Error);
        assert!(c.last_error().is_some());

        // Error is terminal for the pass but the component can still be stopped.
        c.stop(&monitor).await.unwrap();
        assert_eq!(c.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let monitor = ProgressMonitor::new("test");
        let c = Counter::new(false);
        c.initialize(&monitor).await.unwrap();
        c.start(&monitor).await.unwrap();
        c.stop(&monitor).await.unwrap();
        c.stop(&monitor).await.unwrap();
        c.start(&monitor).await.unwrap();
        assert_eq!(c.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_children_report_parent() {
        let parent = Arc::new(Counter::new(false));
        let child: Arc<dyn LifecycleComponent> = Arc::new(Counter::new(false));
        attach_child(&parent, child.clone());

        let status = parent.status();
        assert_eq!(status.children.len(), 1);
        assert_eq!(status.children[0].parent.as_deref(), Some("counter"));
        assert_eq!(child.lifecycle().parent().map(|p| p.id()), Some(parent.id()));

        assert!(parent.lifecycle().release_child(child.id()));
        assert!(parent.lifecycle().children().is_empty());
    }
}
