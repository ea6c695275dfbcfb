//! # Lifecycle Steps
//!
//! A [`CompositeLifecycleStep`] is an ordered, possibly nested, collection of
//! lifecycle operations executed as a unit. Each entry carries a `require_succeed`
//! flag:
//!
//! - **required**: an error aborts the remaining entries of the step and propagates
//!   unchanged to the caller (fail-fast; nothing is started on top of a failed
//!   dependency).
//! - **best-effort**: the error is recorded in the [`ProgressMonitor`] and execution
//!   continues with the next entry.
//!
//! Execution is single-threaded and strictly in declaration order, depth-first
//! through nested composites. Before the first entry runs, the whole tree is walked
//! once to compute the operation total, so progress can be reported as "12 of 40".
//!
//! ```rust
//! use microservice_framework::{CompositeLifecycleStep, LifecycleComponent, LifecycleStep, ProgressMonitor};
//! use microservice_framework::mock::RecordingComponent;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let log = RecordingComponent::call_log();
//! let users: Arc<dyn LifecycleComponent> = Arc::new(RecordingComponent::new("users", &log));
//! let tenants: Arc<dyn LifecycleComponent> = Arc::new(RecordingComponent::new("tenants", &log));
//!
//! let mut init = CompositeLifecycleStep::new("Initialize Web/REST");
//! init.add_initialize_step(users, true)
//!     .add_initialize_step(tenants, true);
//!
//! let monitor = ProgressMonitor::new("boot");
//! init.execute(&monitor).await.unwrap();
//! assert_eq!(log.lock().as_slice(), ["initialize users", "initialize tenants"]);
//! # }
//! ```

use crate::component::{LifecycleAction, LifecycleComponent};
use crate::error::LifecycleError;
use crate::monitor::ProgressMonitor;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>>;

/// Anything that can be executed as part of a composite step.
#[async_trait]
pub trait LifecycleStep: Send + Sync {
    fn name(&self) -> &str;

    /// Number of operations this step accounts for in progress totals.
    fn operation_count(&self) -> usize {
        1
    }

    async fn execute(&self, monitor: &ProgressMonitor) -> Result<(), LifecycleError>;
}

/// One action bound to one component.
pub struct LifecycleOperation {
    name: String,
    component: Arc<dyn LifecycleComponent>,
    action: LifecycleAction,
}

impl LifecycleOperation {
    pub fn new(component: Arc<dyn LifecycleComponent>, action: LifecycleAction) -> Self {
        Self {
            name: format!("{} {}", action.verb(), component.name()),
            component,
            action,
        }
    }

    pub fn component(&self) -> &Arc<dyn LifecycleComponent> {
        &self.component
    }

    pub fn action(&self) -> LifecycleAction {
        self.action
    }
}

#[async_trait]
impl LifecycleStep for LifecycleOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, monitor: &ProgressMonitor) -> Result<(), LifecycleError> {
        self.component.perform(self.action, monitor).await
    }
}

enum StepKind {
    Operation(LifecycleOperation),
    Composite(CompositeLifecycleStep),
    Custom(Box<dyn LifecycleStep>),
}

struct StepEntry {
    kind: StepKind,
    require_succeed: bool,
}

impl StepEntry {
    fn name(&self) -> &str {
        match &self.kind {
            StepKind::Operation(op) => op.name(),
            StepKind::Composite(step) => &step.name,
            StepKind::Custom(step) => step.name(),
        }
    }

    fn operation_count(&self) -> usize {
        match &self.kind {
            StepKind::Operation(_) => 1,
            StepKind::Composite(step) => step.operation_count(),
            StepKind::Custom(step) => step.operation_count(),
        }
    }
}

/// Ordered tree of lifecycle operations.
pub struct CompositeLifecycleStep {
    name: String,
    entries: Vec<StepEntry>,
}

impl CompositeLifecycleStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_operation(&mut self, operation: LifecycleOperation, require_succeed: bool) -> &mut Self {
        self.entries.push(StepEntry {
            kind: StepKind::Operation(operation),
            require_succeed,
        });
        self
    }

    pub fn add_initialize_step(
        &mut self,
        component: Arc<dyn LifecycleComponent>,
        require_succeed: bool,
    ) -> &mut Self {
        self.add_operation(
            LifecycleOperation::new(component, LifecycleAction::Initialize),
            require_succeed,
        )
    }

    pub fn add_start_step(
        &mut self,
        component: Arc<dyn LifecycleComponent>,
        require_succeed: bool,
    ) -> &mut Self {
        self.add_operation(
            LifecycleOperation::new(component, LifecycleAction::Start),
            require_succeed,
        )
    }

    /// Stop operations are always best-effort so shutdown reaches every component.
    pub fn add_stop_step(&mut self, component: Arc<dyn LifecycleComponent>) -> &mut Self {
        self.add_operation(LifecycleOperation::new(component, LifecycleAction::Stop), false)
    }

    /// Nests another composite step.
    pub fn add_composite(&mut self, step: CompositeLifecycleStep, require_succeed: bool) -> &mut Self {
        self.entries.push(StepEntry {
            kind: StepKind::Composite(step),
            require_succeed,
        });
        self
    }

    /// Adds a custom step.
    pub fn add_step(&mut self, step: impl LifecycleStep + 'static, require_succeed: bool) -> &mut Self {
        self.entries.push(StepEntry {
            kind: StepKind::Custom(Box::new(step)),
            require_succeed,
        });
        self
    }

    /// Builds the mirrored stop sequence for `components`: one best-effort stop per
    /// component, in reverse order.
    pub fn stop_all(name: impl Into<String>, components: &[Arc<dyn LifecycleComponent>]) -> Self {
        let mut step = Self::new(name);
        for component in components.iter().rev() {
            step.add_stop_step(component.clone());
        }
        step
    }

    fn run<'a>(&'a self, monitor: &'a ProgressMonitor) -> StepFuture<'a> {
        Box::pin(async move {
            for entry in &self.entries {
                let name = entry.name();
                let count = entry.operation_count();
                let done_before = completed_so_far(monitor);
                let result = match &entry.kind {
                    StepKind::Operation(op) => {
                        monitor.begin_operation(name);
                        op.execute(monitor).await
                    }
                    // Nested composites share the enclosing progress context.
                    StepKind::Composite(step) => step.run(monitor).await,
                    StepKind::Custom(step) => {
                        monitor.begin_operation(name);
                        step.execute(monitor).await
                    }
                };

                match result {
                    Ok(()) => {
                        if !matches!(entry.kind, StepKind::Composite(_)) {
                            monitor.complete_operation(name, count);
                        }
                    }
                    Err(e) if entry.require_succeed => {
                        error!(step = %self.name, operation = name, error = %e, "Required operation failed, aborting step");
                        monitor.fail_operation(name, count, true, &e);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(step = %self.name, operation = name, error = %e, "Optional operation failed, continuing");
                        // A nested composite has already counted what it finished.
                        let remaining = match entry.kind {
                            StepKind::Composite(_) => {
                                count.saturating_sub(completed_so_far(monitor) - done_before)
                            }
                            _ => count,
                        };
                        monitor.fail_operation(name, remaining, false, &e);
                    }
                }
            }
            Ok(())
        })
    }
}

fn completed_so_far(monitor: &ProgressMonitor) -> usize {
    monitor.current_context().map_or(0, |c| c.completed)
}

#[async_trait]
impl LifecycleStep for CompositeLifecycleStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn operation_count(&self) -> usize {
        self.entries.iter().map(StepEntry::operation_count).sum()
    }

    async fn execute(&self, monitor: &ProgressMonitor) -> Result<(), LifecycleError> {
        let total = self.operation_count();
        let _context = monitor.enter_context(&self.name, total);
        info!(step = %self.name, total, "Executing lifecycle step");
        self.run(monitor).await?;
        info!(step = %self.name, "Lifecycle step complete");
        Ok(())
    }
}
