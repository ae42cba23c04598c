//! Agent configuration.

use crate::executor::ExecOptions;

/// Configuration for a single agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Unique agent id within a pool.
    pub id: String,
    /// Optional template this agent was instantiated from.
    pub template_id: Option<String>,
    /// Maximum model iterations per `send` (default: 10).
    pub max_iterations: usize,
    /// Options applied to the tool plan built each iteration.
    pub exec: ExecOptions,
}

impl AgentConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template_id: None,
            max_iterations: 10,
            exec: ExecOptions::default(),
        }
    }

    /// Set the template id.
    #[must_use]
    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    /// Set the iteration cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the per-iteration tool execution options.
    #[must_use]
    pub const fn with_exec(mut self, exec: ExecOptions) -> Self {
        self.exec = exec;
        self
    }
}
