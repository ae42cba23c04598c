//! The agent pool: owns agent lifecycles under a capacity cap.
//!
//! Agents created by one pool share its bus, tool registry, approval
//! gateway, and tool executor. The pool is the exclusive owner: an agent's
//! lifetime is its membership, and `shutdown` leaves nothing running.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentConfig};
use crate::approval::{ApprovalGateway, BusApprovalTransport, RiskPolicy, RiskRules};
use crate::error::{Error, Result};
use crate::event::{BusConfig, EventBus};
use crate::executor::ToolExecutor;
use crate::provider::ModelProvider;
use crate::tool::{ToolHandler, ToolRegistry};

/// Pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Hard cap on concurrently registered agents.
    pub max_agents: usize,
    /// Event bus configuration.
    pub bus: BusConfig,
    /// Risk policy for the shared approval gateway.
    pub risk_policy: RiskPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_agents: 32,
            bus: BusConfig::default(),
            risk_policy: RiskPolicy::default(),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    bus: Arc<EventBus>,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    gateway: Arc<ApprovalGateway>,
    agents: RwLock<HashMap<String, Agent>>,
}

/// Owns agents and the dependencies they share. Cheap to clone.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("max_agents", &self.inner.config.max_agents)
            .finish_non_exhaustive()
    }
}

impl AgentPool {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Create and register an agent.
    ///
    /// Atomic: on [`Error::AtCapacity`] or [`Error::DuplicateId`] no partial
    /// registration remains.
    pub async fn create(&self, config: AgentConfig) -> Result<Agent> {
        let mut agents = self.inner.agents.write().await;
        if agents.len() >= self.inner.config.max_agents {
            return Err(Error::AtCapacity {
                resource: "agents",
                limit: self.inner.config.max_agents,
            });
        }
        if agents.contains_key(&config.id) {
            return Err(Error::DuplicateId(config.id));
        }
        let agent = Agent::from_parts(
            config,
            Arc::clone(&self.inner.bus),
            Arc::clone(&self.inner.provider),
            Arc::clone(&self.inner.tools),
            Arc::clone(&self.inner.executor),
        );
        agents.insert(agent.id().to_string(), agent.clone());
        debug!(agent = agent.id(), count = agents.len(), "agent created");
        Ok(agent)
    }

    /// Look up an agent by id.
    pub async fn get(&self, id: &str) -> Option<Agent> {
        self.inner.agents.read().await.get(id).cloned()
    }

    /// List registered agent ids, optionally filtered by prefix, sorted.
    pub async fn list(&self, prefix: Option<&str>) -> Vec<String> {
        let agents = self.inner.agents.read().await;
        let mut ids: Vec<String> = agents
            .keys()
            .filter(|id| prefix.is_none_or(|p| id.starts_with(p)))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.inner.agents.read().await.len()
    }

    /// Whether the pool is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.agents.read().await.is_empty()
    }

    /// Remove an agent and close it.
    ///
    /// Closing unblocks its subscribers, cancels its run loop, and removes
    /// its stream from the bus.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let agent = self
            .inner
            .agents
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        agent.close().await;
        debug!(agent = id, "agent removed");
        Ok(())
    }

    /// Close every agent concurrently and wait for each to finish.
    ///
    /// Honors `ctx` as a deadline: if it is cancelled first, remaining
    /// closes are abandoned after cancellation has been signalled to every
    /// agent. After `shutdown` returns, the pool is empty and no task it
    /// spawned is running.
    pub async fn shutdown(&self, ctx: &CancellationToken) {
        let agents: Vec<Agent> = {
            let mut map = self.inner.agents.write().await;
            map.drain().map(|(_, agent)| agent).collect()
        };
        info!(count = agents.len(), "pool shutdown");
        let closes = futures::future::join_all(agents.iter().map(|agent| agent.close()));
        tokio::select! {
            _ = closes => {}
            () = ctx.cancelled() => {
                warn!("shutdown deadline reached before all agents closed");
            }
        }
    }

    /// The shared event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// The shared tool executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.inner.executor
    }

    /// The shared approval gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<ApprovalGateway> {
        &self.inner.gateway
    }
}

/// Builder for [`AgentPool`].
#[derive(Default)]
pub struct PoolBuilder {
    config: PoolConfig,
    provider: Option<Arc<dyn ModelProvider>>,
    tools: ToolRegistry,
    rules: Option<RiskRules>,
}

impl std::fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .field("has_provider", &self.provider.is_some())
            .finish_non_exhaustive()
    }
}

impl PoolBuilder {
    /// Set the agent cap.
    #[must_use]
    pub const fn max_agents(mut self, max: usize) -> Self {
        self.config.max_agents = max;
        self
    }

    /// Set the bus configuration.
    #[must_use]
    pub const fn bus_config(mut self, bus: BusConfig) -> Self {
        self.config.bus = bus;
        self
    }

    /// Set the risk policy.
    #[must_use]
    pub const fn risk_policy(mut self, policy: RiskPolicy) -> Self {
        self.config.risk_policy = policy;
        self
    }

    /// Replace the default risk rules.
    #[must_use]
    pub fn risk_rules(mut self, rules: RiskRules) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Set the model provider shared by every agent.
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

    /// Register a tool shared by every agent.
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

    /// Build the pool.
    ///
    /// Fails with a validation error when no provider was set.
    pub fn build(self) -> Result<AgentPool> {
        let provider = self
            .provider
            .ok_or_else(|| Error::validation("pool requires a model provider"))?;
        let bus = Arc::new(EventBus::new(self.config.bus));
        let tools = Arc::new(self.tools);
        let gateway = Arc::new(ApprovalGateway::new(
            self.rules.unwrap_or_default(),
            self.config.risk_policy,
            Arc::new(BusApprovalTransport::new(Arc::clone(&bus))),
        ));
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&bus),
            Arc::clone(&tools),
            Arc::clone(&gateway),
        ));
        Ok(AgentPool {
            inner: Arc::new(PoolInner {
                config: self.config,
                bus,
                provider,
                tools,
                executor,
                gateway,
                agents: RwLock::new(HashMap::new()),
            }),
        })
    }
}
