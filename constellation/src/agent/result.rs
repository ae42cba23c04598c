//! Run results with usage and timing.

use crate::provider::Usage;

/// How an agent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RunState {
    /// The model stopped naturally.
    Completed,
    /// The iteration cap was reached without a natural stop.
    MaxSteps,
    /// The run was cancelled.
    Interrupted,
    /// The run failed; details were published on the monitor channel.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::MaxSteps => write!(f, "max_steps"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one `Agent::send`.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Final assistant text, when the run completed.
    pub output: Option<String>,
    /// How the run ended.
    pub state: RunState,
    /// Token usage accumulated across iterations.
    pub usage: Usage,
    /// Iterations taken.
    pub steps_taken: usize,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Error message for `Failed` runs.
    pub error: Option<String>,
}

impl RunResult {
    /// Whether the run completed naturally.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.state, RunState::Completed)
    }
}
