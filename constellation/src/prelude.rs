//! Convenience re-exports for common usage.
//!
//! ```rust,ignore
//! use constellation::prelude::*;
//! ```

pub use crate::agent::{Agent, AgentBuilder, AgentConfig, AgentState, ControlSignal, RunResult, RunState};
pub use crate::approval::{
    ApprovalGateway, ApprovalRequest, ApprovalTransport, Decision, Gate, RiskPolicy, RiskRules,
    RiskTier,
};
pub use crate::error::{Error, ErrorKind, Result, ToolError};
pub use crate::event::{
    AgentEvent, Bookmark, BusConfig, BusItem, Channel, DoneReason, Envelope, EventBus, EventKind,
    OverflowPolicy, SubscribeOptions, Subscription,
};
pub use crate::executor::{
    CallState, ExecCallbacks, ExecEvent, ExecOptions, ExecutionPlan, FailureCause, PlanReport,
    PlanStatus, ToolCall, ToolContext, ToolExecutor,
};
pub use crate::pool::{AgentPool, PoolConfig};
pub use crate::provider::{
    ChatRequest, FinishReason, Message, ModelChunk, ModelProvider, ModelStream, Role,
    ToolCallProposal, Usage,
};
pub use crate::session::{
    CreateSession, EventFilter, InMemorySessionStore, SessionEvent, SessionFilter, SessionRecord,
    SessionStore,
};
pub use crate::stars::{
    Member, RunStream, StarRole, Stars, StarsEvent, StarsEventKind, StarsMessage,
};
pub use crate::tool::{
    BoxedToolHandler, ProgressSink, Tool, ToolCapabilities, ToolDefinition, ToolHandler,
    ToolRegistry,
};
