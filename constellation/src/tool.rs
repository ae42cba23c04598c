//! Tool traits and the handler registry.
//!
//! Tools are the only way agents touch the world. Implementations live
//! outside the core; the executor drives them through the object-safe
//! [`ToolHandler`] trait. The typed [`Tool`] trait is the ergonomic way to
//! define one — arguments deserialize from JSON, output serializes back,
//! and a blanket impl erases the types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::approval::RiskTier;
use crate::error::ToolError;
use crate::event::{AgentEvent, EventBus};

/// Definition of a tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, snake_case.
    pub name: String,
    /// What the tool does; helps the model decide when to call it.
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Static capabilities a handler declares to the executor and the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCapabilities {
    /// The handler observes its cancellation token mid-run.
    pub cancelable: bool,
    /// The handler holds at [`ProgressSink::pause_point`] checkpoints.
    pub pausable: bool,
    /// Fixed risk tier, overriding the gateway's rule tables.
    pub risk: Option<RiskTier>,
    /// Allow argument values to appear in monitor snapshots and error
    /// detail. Off by default so telemetry never leaks inputs.
    pub expose_arguments: bool,
}

impl Default for ToolCapabilities {
    fn default() -> Self {
        Self {
            cancelable: true,
            pausable: false,
            risk: None,
            expose_arguments: false,
        }
    }
}

/// Sink for progress a running tool reports back to its agent's stream.
///
/// Also carries the pause gate: pausable handlers call
/// [`pause_point`](Self::pause_point) at safe checkpoints.
pub struct ProgressSink {
    bus: Arc<EventBus>,
    agent_id: String,
    call_id: String,
    pause: Option<watch::Receiver<bool>>,
    pause_hook: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("agent_id", &self.agent_id)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl ProgressSink {
    /// Create a sink bound to one call on one agent's stream.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, agent_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            bus,
            agent_id: agent_id.into(),
            call_id: call_id.into(),
            pause: None,
            pause_hook: None,
        }
    }

    /// Attach the pause gate and a state hook invoked on pause/resume.
    #[must_use]
    pub(crate) fn with_pause(
        mut self,
        pause: watch::Receiver<bool>,
        hook: Arc<dyn Fn(bool) + Send + Sync>,
    ) -> Self {
        self.pause = Some(pause);
        self.pause_hook = Some(hook);
        self
    }

    /// Report fractional progress; `frac` is clamped to `[0, 1]`.
    pub async fn progress(&self, frac: f64, msg: impl Into<String>) {
        self.bus
            .publish(
                &self.agent_id,
                AgentEvent::ToolProgress {
                    id: self.call_id.clone(),
                    frac: frac.clamp(0.0, 1.0),
                    msg: msg.into(),
                },
            )
            .await;
    }

    /// Publish a labelled intermediate artifact.
    pub async fn intermediate(&self, label: impl Into<String>, data: Value) {
        self.bus
            .publish(
                &self.agent_id,
                AgentEvent::ToolIntermediate {
                    id: self.call_id.clone(),
                    label: label.into(),
                    data,
                },
            )
            .await;
    }

    /// Hold here while the plan is paused.
    ///
    /// Pausable handlers call this at checkpoints; the call's state flips to
    /// `Paused` for the duration and back to `Executing` on resume. Handlers
    /// without a pause gate return immediately.
    pub async fn pause_point(&self) {
        let Some(rx) = &self.pause else { return };
        if !*rx.borrow() {
            return;
        }
        if let Some(hook) = &self.pause_hook {
            hook(true);
        }
        let mut rx = rx.clone();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        if let Some(hook) = &self.pause_hook {
            hook(false);
        }
    }
}

/// Object-safe tool seam the executor drives.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tool name, unique within a registry.
    fn name(&self) -> &str;

    /// What the tool does.
    fn description(&self) -> String {
        String::new()
    }

    /// JSON schema for the arguments.
    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    /// Declared capabilities.
    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default()
    }

    /// Run the tool.
    ///
    /// `ctx` is cancelled when the call, its plan, or its agent is
    /// cancelled; handlers that declared `cancelable` should return
    /// promptly with [`ToolError::Cancelled`].
    async fn execute(
        &self,
        ctx: CancellationToken,
        args: Value,
        progress: &ProgressSink,
    ) -> Result<Value, ToolError>;

    /// The model-facing definition.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters_schema())
    }
}

/// A boxed dynamic tool handler.
pub type BoxedToolHandler = Box<dyn ToolHandler>;

/// Typed tool trait; a blanket impl erases it into [`ToolHandler`].
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    /// Unique tool name.
    const NAME: &'static str;

    /// Deserialized argument type.
    type Args: DeserializeOwned + Send;
    /// Serialized result type.
    type Output: Serialize;

    /// What the tool does.
    fn description(&self) -> String;

    /// JSON schema for [`Self::Args`].
    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    /// Declared capabilities.
    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default()
    }

    /// Run the tool with typed arguments.
    async fn call(
        &self,
        ctx: CancellationToken,
        args: Self::Args,
        progress: &ProgressSink,
    ) -> Result<Self::Output, ToolError>;
}

#[async_trait]
impl<T: Tool> ToolHandler for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> String {
        Tool::description(self)
    }

    fn parameters_schema(&self) -> Value {
        Tool::parameters_schema(self)
    }

    fn capabilities(&self) -> ToolCapabilities {
        Tool::capabilities(self)
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        args: Value,
        progress: &ProgressSink,
    ) -> Result<Value, ToolError> {
        let parsed: T::Args = serde_json::from_value(args)?;
        let output = Tool::call(self, ctx, parsed, progress).await?;
        serde_json::to_value(output).map_err(|e| ToolError::Execution(e.to_string()))
    }
}

/// A named collection of tool handlers.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any existing tool with the same name.
    pub fn add(&mut self, tool: impl ToolHandler + 'static) {
        self.add_arc(Arc::new(tool));
    }

    /// Register a shared tool handler.
    pub fn add_arc(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a handler by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(Arc::clone)
    }

    /// Whether a tool with the given name is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions for every registered tool.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Registered tool names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
