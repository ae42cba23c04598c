//! Synchronous callbacks for plan lifecycle events.
//!
//! Callbacks run on the scheduler task; they must not block, or the plan
//! stalls.

use std::fmt;
use std::sync::Arc;

use super::plan::{PlanStatus, ToolCall};

/// Type alias for a boxed callback function.
pub type BoxedExecCallback = Box<dyn Fn(&ExecEvent) + Send + Sync>;

/// Lifecycle notifications emitted by the plan scheduler.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    /// A call entered `Executing`.
    StepStart(ToolCall),
    /// A call completed successfully.
    StepComplete(ToolCall),
    /// A call failed or was cancelled.
    StepFailed(ToolCall),
    /// The plan reached a terminal status.
    PlanComplete {
        /// Id of the finished plan.
        plan_id: String,
        /// Terminal status.
        status: PlanStatus,
    },
}

impl fmt::Display for ExecEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepStart(call) => write!(f, "step {} started", call.id),
            Self::StepComplete(call) => write!(f, "step {} completed", call.id),
            Self::StepFailed(call) => write!(f, "step {} failed", call.id),
            Self::PlanComplete { plan_id, status } => {
                write!(f, "plan {plan_id} finished: {status:?}")
            }
        }
    }
}

/// A collection of plan lifecycle callbacks.
#[derive(Default)]
pub struct ExecCallbacks {
    callbacks: Vec<Arc<BoxedExecCallback>>,
}

impl ExecCallbacks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback.
    pub fn add<F>(&mut self, callback: F)
    where
        F: Fn(&ExecEvent) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(Box::new(callback)));
    }

    /// Emit an event to every callback.
    pub fn emit(&self, event: &ExecEvent) {
        for callback in &self.callbacks {
            callback(event);
        }
    }

    /// Whether any callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }
}

impl fmt::Debug for ExecCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecCallbacks")
            .field("callback_count", &self.callbacks.len())
            .finish()
    }
}
