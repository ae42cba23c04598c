//! Agent builder for constructing standalone agents with a fluent API.
//!
//! Agents in a pool share their bus, registry, and executor through
//! [`AgentPool`](crate::pool::AgentPool); the builder wires the same pieces
//! for an agent used on its own.

use std::sync::Arc;

use crate::approval::{ApprovalGateway, BusApprovalTransport, RiskPolicy, RiskRules};
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::executor::{ExecOptions, ToolExecutor};
use crate::provider::ModelProvider;
use crate::tool::{ToolHandler, ToolRegistry};

use super::{Agent, AgentConfig};

/// Builder for [`Agent`].
///
/// # Example
///
/// ```rust,ignore
/// let agent = Agent::builder()
///     .id("a1")
///     .provider(my_provider)
///     .tool(ListTool)
///     .risk_policy(RiskPolicy::Strict)
///     .build()?;
/// ```
#[derive(Default)]
pub struct AgentBuilder {
    id: Option<String>,
    template_id: Option<String>,
    max_iterations: Option<usize>,
    exec: Option<ExecOptions>,
    bus: Option<Arc<EventBus>>,
    provider: Option<Arc<dyn ModelProvider>>,
    tools: ToolRegistry,
    policy: RiskPolicy,
    rules: Option<RiskRules>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("id", &self.id)
            .field("has_provider", &self.provider.is_some())
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent id (default: a fresh UUID).
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the template id.
    #[must_use]
    pub fn template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    /// Set the iteration cap.
    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Set the per-iteration tool execution options.
    #[must_use]
    pub const fn exec_options(mut self, exec: ExecOptions) -> Self {
        self.exec = Some(exec);
        self
    }

    /// Use an existing bus instead of a private one.
    #[must_use]
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the model provider.
    #[must_use]
    pub fn provider(mut self, provider: impl ModelProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Set a shared model provider.
    #[must_use]
    pub fn provider_arc(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a tool.
    #[must_use]
    pub fn tool(mut self, tool: impl ToolHandler + 'static) -> Self {
        self.tools.add(tool);
        self
    }

    /// Replace the tool registry.
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Set the risk policy for the approval gateway.
    #[must_use]
    pub const fn risk_policy(mut self, policy: RiskPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the default risk rules.
    #[must_use]
    pub fn risk_rules(mut self, rules: RiskRules) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Build the agent.
    ///
    /// Fails with a validation error when no provider was set.
    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| Error::validation("agent requires a model provider"))?;
        let bus = self.bus.unwrap_or_default();
        let tools = Arc::new(self.tools);
        let gateway = Arc::new(ApprovalGateway::new(
            self.rules.unwrap_or_default(),
            self.policy,
            Arc::new(BusApprovalTransport::new(Arc::clone(&bus))),
        ));
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&bus),
            Arc::clone(&tools),
            gateway,
        ));

        let mut config = AgentConfig::new(
            self.id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        );
        config.template_id = self.template_id;
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if let Some(exec) = self.exec {
            config.exec = exec;
        }

        Ok(Agent::from_parts(config, bus, provider, tools, executor))
    }
}
