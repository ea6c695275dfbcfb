//! # Progress Monitor
//!
//! Accumulates progress for executing lifecycle steps: a stack of progress contexts
//! (one per executing composite step, outermost first), the ordered list of errors
//! recorded by best-effort operations, and a broadcast stream of [`ProgressEvent`]s
//! for dashboards.
//!
//! The monitor never touches component state; it is a read-only projection of what
//! the step engine reports.

use crate::error::LifecycleError;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 256;

/// Progress of one executing composite step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressContext {
    pub name: String,
    pub total: usize,
    pub completed: usize,
}

/// Event emitted while steps execute.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    OperationStarted {
        context: String,
        operation: String,
        index: usize,
        total: usize,
    },
    OperationCompleted {
        context: String,
        operation: String,
        index: usize,
        total: usize,
    },
    OperationFailed {
        context: String,
        operation: String,
        required: bool,
        error: LifecycleError,
    },
}

/// Serializable point-in-time view of a monitor.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub monitor: String,
    pub contexts: Vec<ProgressContext>,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct MonitorState {
    contexts: Vec<ProgressContext>,
    errors: Vec<LifecycleError>,
}

/// Observes lifecycle step execution.
pub struct ProgressMonitor {
    name: String,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressMonitor {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            name: name.into(),
            state: Mutex::new(MonitorState::default()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribes to progress events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Errors recorded by best-effort operations, in the order they occurred.
    pub fn errors(&self) -> Vec<LifecycleError> {
        self.state.lock().errors.clone()
    }

    pub fn error_count(&self) -> usize {
        self.state.lock().errors.len()
    }

    /// The innermost executing context, if any.
    pub fn current_context(&self) -> Option<ProgressContext> {
        self.state.lock().contexts.last().cloned()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            monitor: self.name.clone(),
            contexts: state.contexts.clone(),
            errors: state.errors.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Pushes a context that is popped again when the guard drops.
    pub(crate) fn enter_context(&self, name: &str, total: usize) -> ContextGuard<'_> {
        debug!(monitor = %self.name, context = name, total, "Entering progress context");
        self.state.lock().contexts.push(ProgressContext {
            name: name.to_string(),
            total,
            completed: 0,
        });
        ContextGuard { monitor: self }
    }

    pub(crate) fn begin_operation(&self, operation: &str) {
        let (context, index, total) = {
            let state = self.state.lock();
            match state.contexts.last() {
                Some(c) => (c.name.clone(), c.completed + 1, c.total),
                None => (String::new(), 1, 1),
            }
        };
        debug!(monitor = %self.name, %context, operation, index, total, "Operation started");
        let _ = self.events.send(ProgressEvent::OperationStarted {
            context,
            operation: operation.to_string(),
            index,
            total,
        });
    }

    /// Marks `count` operations of the current context as done.
    pub(crate) fn complete_operation(&self, operation: &str, count: usize) {
        let (context, index, total) = {
            let mut state = self.state.lock();
            match state.contexts.last_mut() {
                Some(c) => {
                    c.completed += count;
                    (c.name.clone(), c.completed, c.total)
                }
                None => (String::new(), count, count),
            }
        };
        let _ = self.events.send(ProgressEvent::OperationCompleted {
            context,
            operation: operation.to_string(),
            index,
            total,
        });
    }

    /// Reports a failed operation. Best-effort failures are recorded in the error
    /// list and counted as done; required failures are only broadcast, since they
    /// propagate to the caller.
    pub(crate) fn fail_operation(
        &self,
        operation: &str,
        count: usize,
        required: bool,
        error: &LifecycleError,
    ) {
        let context = {
            let mut state = self.state.lock();
            if !required {
                state.errors.push(error.clone());
            }
            match state.contexts.last_mut() {
                Some(c) => {
                    if !required {
                        c.completed += count;
                    }
                    c.name.clone()
                }
                None => String::new(),
            }
        };
        let _ = self.events.send(ProgressEvent::OperationFailed {
            context,
            operation: operation.to_string(),
            required,
            error: error.clone(),
        });
    }
}

/// Pops its progress context on drop, including when the executing future is
/// cancelled.
pub(crate) struct ContextGuard<'a> {
    monitor: &'a ProgressMonitor,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.monitor.state.lock().contexts.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_nest_and_pop() {
        let monitor = ProgressMonitor::new("boot");
        {
            let _outer = monitor.enter_context("Initialize service", 3);
            monitor.complete_operation("Initialize a", 1);
            {
                let _inner = monitor.enter_context("Initialize channels", 2);
                assert_eq!(monitor.snapshot().contexts.len(), 2);
                monitor.complete_operation("Initialize channel", 1);
                assert_eq!(monitor.current_context().unwrap().completed, 1);
            }
            let outer = monitor.current_context().unwrap();
            assert_eq!(outer.name, "Initialize service");
            assert_eq!((outer.completed, outer.total), (1, 3));
        }
        assert!(monitor.current_context().is_none());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let monitor = ProgressMonitor::new("boot");
        let mut events = monitor.subscribe();
        let _ctx = monitor.enter_context("Start service", 1);
        monitor.begin_operation("Start a");
        monitor.complete_operation("Start a", 1);

        match events.recv().await.unwrap() {
            ProgressEvent::OperationStarted { index, total, .. } => assert_eq!((index, total), (1, 1)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            ProgressEvent::OperationCompleted { index: 1, .. }
        ));
    }
}
