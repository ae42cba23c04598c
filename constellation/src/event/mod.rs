//! Typed event envelopes and the subscription fabric.
//!
//! Every observable action in the framework is published as an [`Envelope`]:
//! a cursor-stamped, timestamped event on one of three logical channels.
//! Cursors are assigned per agent at publish time and are dense and strictly
//! increasing, so any subscriber can totally order the stream of a single
//! agent and resume from a [`Bookmark`].
//!
//! The wire format is JSON:
//!
//! ```json
//! {"cursor": 42, "timestamp": 1722470400000, "channel": "progress",
//!  "type": "text_chunk_delta", "payload": {"delta": "hello"}}
//! ```

mod bus;

pub use bus::{BusConfig, BusItem, EventBus, OverflowPolicy, SubscribeOptions, Subscription};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::ToolCall;
use crate::provider::Usage;

/// Logical event stream a subscriber can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// User-visible output: text, thinking, tool lifecycle, completion.
    Progress,
    /// Approval requests and decisions.
    Control,
    /// Telemetry: token usage, step timing, tool snapshots, errors.
    Monitor,
}

/// Why an agent run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The model stopped naturally.
    Stop,
    /// The configured iteration cap was reached.
    MaxSteps,
    /// The run was cancelled cooperatively.
    Cancelled,
    /// The run ended because of an error already reported on monitor.
    Error,
}

impl DoneReason {
    /// Stable string form used in event payloads and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::MaxSteps => "max_steps",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// Severity of a monitor error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recoverable; the run continues.
    Warning,
    /// The current step or call failed.
    Error,
    /// An internal invariant was violated; the plan fails.
    Fatal,
}

/// Which phase of execution produced a monitor error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    /// Talking to the model provider.
    Model,
    /// Executing a tool handler.
    Tool,
    /// Scheduling a plan.
    Plan,
    /// Anything else inside the framework.
    Internal,
}

/// The closed set of events the framework publishes.
///
/// The variant tag is the wire `type`; variant fields are the wire `payload`.
/// Clients must tolerate types they do not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
#[non_exhaustive]
pub enum AgentEvent {
    /// A contiguous run of assistant text is starting.
    TextChunkStart,
    /// Incremental assistant text.
    TextChunkDelta {
        /// The text fragment.
        delta: String,
    },
    /// The text run ended.
    TextChunkEnd,
    /// A contiguous run of thinking output is starting.
    ThinkChunkStart,
    /// Incremental thinking output.
    ThinkChunkDelta {
        /// The thinking fragment.
        delta: String,
    },
    /// The thinking run ended.
    ThinkChunkEnd,
    /// A tool call entered `Executing`.
    ToolStart {
        /// Snapshot of the call at start.
        call: ToolCall,
    },
    /// Fractional progress reported by a running tool.
    ToolProgress {
        /// Id of the call.
        id: String,
        /// Progress in `[0, 1]`.
        frac: f64,
        /// Short human-readable status.
        msg: String,
    },
    /// A labelled intermediate artifact from a running tool.
    ToolIntermediate {
        /// Id of the call.
        id: String,
        /// Label for the artifact.
        label: String,
        /// Arbitrary payload.
        data: Value,
    },
    /// A tool call reached a terminal state.
    ToolEnd {
        /// Snapshot of the call at its terminal state.
        call: ToolCall,
    },
    /// The run finished.
    Done {
        /// Why it finished.
        reason: DoneReason,
    },

    /// A tool call needs a user decision before it may run.
    PermissionRequired {
        /// Fresh id to pass back to `decide`.
        request_id: String,
        /// The call awaiting approval.
        call: ToolCall,
        /// Why approval is required.
        reason: String,
        /// Non-binding hints for the decider.
        recommendations: Vec<String>,
    },
    /// A pending approval was resolved.
    PermissionDecided {
        /// Id of the resolved request.
        request_id: String,
        /// Whether the call may proceed.
        approved: bool,
        /// Optional reason given by the decider.
        reason: Option<String>,
    },

    /// Token usage for the most recent model call.
    TokenUsage(Usage),
    /// An agent iteration completed.
    StepComplete {
        /// 1-based iteration number.
        step: usize,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },
    /// Terminal snapshot of an executed tool call.
    ToolExecuted {
        /// The call as it ended.
        call: ToolCall,
    },
    /// A failure that did not abort the process.
    Error {
        /// How bad it was.
        severity: Severity,
        /// Where it happened.
        phase: ErrorPhase,
        /// Human-readable message.
        message: String,
        /// Optional structured detail.
        detail: Option<Value>,
    },
}

/// Fieldless mirror of [`AgentEvent`] used for subscription type filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventKind {
    /// See [`AgentEvent::TextChunkStart`].
    TextChunkStart,
    /// See [`AgentEvent::TextChunkDelta`].
    TextChunkDelta,
    /// See [`AgentEvent::TextChunkEnd`].
    TextChunkEnd,
    /// See [`AgentEvent::ThinkChunkStart`].
    ThinkChunkStart,
    /// See [`AgentEvent::ThinkChunkDelta`].
    ThinkChunkDelta,
    /// See [`AgentEvent::ThinkChunkEnd`].
    ThinkChunkEnd,
    /// See [`AgentEvent::ToolStart`].
    ToolStart,
    /// See [`AgentEvent::ToolProgress`].
    ToolProgress,
    /// See [`AgentEvent::ToolIntermediate`].
    ToolIntermediate,
    /// See [`AgentEvent::ToolEnd`].
    ToolEnd,
    /// See [`AgentEvent::Done`].
    Done,
    /// See [`AgentEvent::PermissionRequired`].
    PermissionRequired,
    /// See [`AgentEvent::PermissionDecided`].
    PermissionDecided,
    /// See [`AgentEvent::TokenUsage`].
    TokenUsage,
    /// See [`AgentEvent::StepComplete`].
    StepComplete,
    /// See [`AgentEvent::ToolExecuted`].
    ToolExecuted,
    /// See [`AgentEvent::Error`].
    Error,
}

impl AgentEvent {
    /// The channel this event is published on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::TextChunkStart
            | Self::TextChunkDelta { .. }
            | Self::TextChunkEnd
            | Self::ThinkChunkStart
            | Self::ThinkChunkDelta { .. }
            | Self::ThinkChunkEnd
            | Self::ToolStart { .. }
            | Self::ToolProgress { .. }
            | Self::ToolIntermediate { .. }
            | Self::ToolEnd { .. }
            | Self::Done { .. } => Channel::Progress,
            Self::PermissionRequired { .. } | Self::PermissionDecided { .. } => Channel::Control,
            Self::TokenUsage(_)
            | Self::StepComplete { .. }
            | Self::ToolExecuted { .. }
            | Self::Error { .. } => Channel::Monitor,
        }
    }

    /// The filterable kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TextChunkStart => EventKind::TextChunkStart,
            Self::TextChunkDelta { .. } => EventKind::TextChunkDelta,
            Self::TextChunkEnd => EventKind::TextChunkEnd,
            Self::ThinkChunkStart => EventKind::ThinkChunkStart,
            Self::ThinkChunkDelta { .. } => EventKind::ThinkChunkDelta,
            Self::ThinkChunkEnd => EventKind::ThinkChunkEnd,
            Self::ToolStart { .. } => EventKind::ToolStart,
            Self::ToolProgress { .. } => EventKind::ToolProgress,
            Self::ToolIntermediate { .. } => EventKind::ToolIntermediate,
            Self::ToolEnd { .. } => EventKind::ToolEnd,
            Self::Done { .. } => EventKind::Done,
            Self::PermissionRequired { .. } => EventKind::PermissionRequired,
            Self::PermissionDecided { .. } => EventKind::PermissionDecided,
            Self::TokenUsage(_) => EventKind::TokenUsage,
            Self::StepComplete { .. } => EventKind::StepComplete,
            Self::ToolExecuted { .. } => EventKind::ToolExecuted,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// A cursor-stamped event on one agent's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dense, strictly increasing per-agent sequence number.
    pub cursor: u64,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The channel the event belongs to.
    pub channel: Channel,
    /// The typed event.
    #[serde(flatten)]
    pub event: AgentEvent,
}

impl Envelope {
    /// The bookmark identifying this envelope's position.
    #[must_use]
    pub const fn bookmark(&self) -> Bookmark {
        Bookmark {
            cursor: self.cursor,
            timestamp: self.timestamp,
        }
    }
}

/// A resumable position in an agent's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Cursor of the last observed envelope.
    pub cursor: u64,
    /// Timestamp of the last observed envelope.
    pub timestamp: i64,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
