//! Execution plans: DAGs of tool calls with scheduling options.
//!
//! A plan owns a set of [`ToolCall`] steps related by `depends_on` edges.
//! Validation rejects cycles, dangling references and duplicate ids before
//! the scheduler ever sees the plan.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::provider::ToolCallProposal;

/// Lifecycle state of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Waiting for dependencies.
    Pending,
    /// Parked awaiting a user decision.
    Approving,
    /// Ready to run, waiting for capacity.
    Queued,
    /// Running.
    Executing,
    /// A pausable handler is holding at a checkpoint.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before or during execution.
    Cancelled,
}

impl CallState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a call failed or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The approval gateway blocked or the user denied the call.
    Policy,
    /// The per-step timeout fired.
    Timeout,
    /// The handler returned an error.
    Execution,
    /// A dependency failed or was cancelled.
    Dependency,
}

/// One tool call within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id within the plan.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments.
    pub arguments: Value,
    /// Current lifecycle state.
    pub state: CallState,
    /// Progress in `[0, 1]`; `1.0` once terminal.
    pub progress: f64,
    /// Result value once `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message once `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the call failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    /// Ids of calls that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Whether the handler honors cancellation mid-run.
    pub cancelable: bool,
    /// Whether the handler holds at pause checkpoints.
    pub pausable: bool,
    /// Higher runs first within a ready set; FIFO within a band.
    pub priority: i32,
    /// Wall-clock start, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    /// Wall-clock end, milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

impl ToolCall {
    /// Create a call with a fresh id and default flags.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            arguments,
            state: CallState::Pending,
            progress: 0.0,
            result: None,
            error: None,
            cause: None,
            depends_on: Vec::new(),
            cancelable: true,
            pausable: false,
            priority: 0,
            started_at: None,
            ended_at: None,
        }
    }

    /// Build a call from a model proposal, keeping the provider's id.
    #[must_use]
    pub fn from_proposal(proposal: ToolCallProposal) -> Self {
        let mut call = Self::new(proposal.name, proposal.arguments);
        call.id = proposal.id;
        call
    }

    /// Set the call id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add dependency edges.
    #[must_use]
    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Set the scheduling priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Overall status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Under construction.
    Draft,
    /// Waiting for plan-level approval.
    PendingApproval,
    /// Approved, not yet started.
    Approved,
    /// The scheduler is running it.
    Executing,
    /// Every call completed.
    Completed,
    /// A call failed and `stop_on_error` was set.
    Failed,
    /// Plan-level cancel was issued.
    Cancelled,
}

/// Scheduling options for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Route calls through the approval gateway.
    pub require_approval: bool,
    /// A failed call fails the whole plan.
    pub stop_on_error: bool,
    /// Allow independent calls to run concurrently.
    pub allow_parallel: bool,
    /// Cap on concurrently executing calls.
    pub max_parallel_steps: usize,
    /// Per-step timeout in milliseconds; `0` disables it.
    pub step_timeout_ms: u64,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            require_approval: true,
            stop_on_error: true,
            allow_parallel: true,
            max_parallel_steps: 4,
            step_timeout_ms: 60_000,
        }
    }
}

impl ExecOptions {
    /// Effective parallelism cap, folding in `allow_parallel`.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        if !self.allow_parallel {
            return 1;
        }
        if self.max_parallel_steps == 0 {
            1
        } else {
            self.max_parallel_steps
        }
    }
}

/// A DAG of tool calls with execution options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unique plan id.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Overall status.
    pub status: PlanStatus,
    /// The calls, in insertion order.
    pub steps: Vec<ToolCall>,
    /// Scheduling options.
    pub options: ExecOptions,
}

impl ExecutionPlan {
    /// Create an empty draft plan.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            description: description.into(),
            status: PlanStatus::Draft,
            steps: Vec::new(),
            options: ExecOptions::default(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn with_step(mut self, step: ToolCall) -> Self {
        self.steps.push(step);
        self
    }

    /// Replace the options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    /// Check the plan is well-formed: unique ids, named tools, a closed
    /// reference set, and an acyclic dependency graph.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::validation("plan has no steps"));
        }

        let mut ids = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(Error::validation(format!(
                    "step '{}' has an empty tool name",
                    step.id
                )));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(Error::validation(format!("duplicate step id '{}'", step.id)));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(Error::validation(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(Error::validation(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.id
                    )));
                }
            }
        }

        // Kahn's algorithm; leftovers mean a cycle.
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(children) = dependents.get(id) {
                for &child in children {
                    let d = indegree
                        .get_mut(child)
                        .ok_or_else(|| Error::internal("indegree map out of sync"))?;
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
        if visited != self.steps.len() {
            return Err(Error::validation("plan dependency graph has a cycle"));
        }
        Ok(())
    }

    /// Look up a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&ToolCall> {
        self.steps.iter().find(|s| s.id == id)
    }
}
