//! A single-conversation agent actor.
//!
//! An [`Agent`] drives one conversation: it sends the history to the model,
//! streams deltas out as progress events, routes proposed tool calls through
//! the approval gateway and the tool executor, folds results back, and
//! repeats until the model stops, the iteration cap is hit, or the run is
//! cancelled.
//!
//! State machine: `Idle → Working → (Suspended ↔ Working) → Idle`.
//! `Disabled` is terminal; a disabled agent rejects `send` with a typed
//! error. Suspension happens only at iteration boundaries, never mid-token.

mod builder;
mod config;
mod result;
mod runner;

pub use builder::AgentBuilder;
pub use config::AgentConfig;
pub use result::{RunResult, RunState};

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{EventBus, SubscribeOptions, Subscription};
use crate::executor::ToolExecutor;
use crate::provider::{Message, ModelProvider};
use crate::tool::ToolRegistry;

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No run in progress.
    Idle,
    /// A run is in progress.
    Working,
    /// Paused at an iteration boundary.
    Suspended,
    /// Closed; rejects further input. Terminal.
    Disabled,
}

/// Control signals an agent accepts while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Cancel the current run and every tool call it owns.
    Cancel,
    /// Suspend at the next iteration boundary.
    Pause,
    /// Leave suspension.
    Resume,
}

pub(crate) struct AgentInner {
    pub(crate) config: AgentConfig,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) provider: Arc<dyn ModelProvider>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) state: std::sync::RwLock<AgentState>,
    /// Serializes runs: one in-flight model request per agent.
    pub(crate) run_lock: tokio::sync::Mutex<()>,
    /// Token of the run currently holding `run_lock`, for `Cancel`.
    pub(crate) current_run: std::sync::Mutex<Option<CancellationToken>>,
    pub(crate) pause: watch::Sender<bool>,
    /// Cancelled on `close`; parents every run token.
    pub(crate) close_token: CancellationToken,
    pub(crate) history: tokio::sync::Mutex<Vec<Message>>,
}

/// A single-conversation actor. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.config.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create a builder for a standalone agent.
    #[must_use]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub(crate) fn from_parts(
        config: AgentConfig,
        bus: Arc<EventBus>,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
    ) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            inner: Arc::new(AgentInner {
                config,
                bus,
                provider,
                tools,
                executor,
                state: std::sync::RwLock::new(AgentState::Idle),
                run_lock: tokio::sync::Mutex::new(()),
                current_run: std::sync::Mutex::new(None),
                pause,
                close_token: CancellationToken::new(),
                history: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// The agent's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// The template this agent was instantiated from, if any.
    #[must_use]
    pub fn template_id(&self) -> Option<&str> {
        self.inner.config.template_id.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AgentState {
        *self.inner.state.read().expect("agent state poisoned")
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        let mut guard = self.inner.state.write().expect("agent state poisoned");
        // Disabled is terminal.
        if *guard != AgentState::Disabled {
            *guard = state;
        }
    }

    /// Subscribe to this agent's event stream.
    pub async fn subscribe(&self, opts: SubscribeOptions) -> Subscription {
        self.inner.bus.subscribe(self.id(), opts).await
    }

    /// Deliver a control signal.
    ///
    /// Signals are advisory and never fail: cancelling an idle agent or
    /// resuming a running one is a no-op.
    pub fn control(&self, signal: ControlSignal) {
        match signal {
            ControlSignal::Cancel => {
                let current = self
                    .inner
                    .current_run
                    .lock()
                    .expect("run slot poisoned")
                    .clone();
                if let Some(token) = current {
                    debug!(agent = self.id(), "cancel requested");
                    token.cancel();
                }
            }
            ControlSignal::Pause => {
                self.inner.pause.send_replace(true);
            }
            ControlSignal::Resume => {
                self.inner.pause.send_replace(false);
            }
        }
    }

    /// Close the agent: cancel the run loop, unblock subscribers, and
    /// reject further input.
    ///
    /// Idempotent. After `close` returns, the agent is `Disabled` and its
    /// stream is removed from the bus.
    pub async fn close(&self) {
        {
            let mut guard = self.inner.state.write().expect("agent state poisoned");
            *guard = AgentState::Disabled;
        }
        self.inner.close_token.cancel();
        // Wait for an in-flight run to observe cancellation and release the
        // lock, so no task of ours outlives close.
        let _guard = self.inner.run_lock.lock().await;
        self.inner.bus.remove_agent(self.id()).await;
        debug!(agent = self.id(), "closed");
    }

    /// Snapshot of the conversation history.
    pub async fn history(&self) -> Vec<Message> {
        self.inner.history.lock().await.clone()
    }
}
