//! Error types for the constellation framework.
//!
//! Errors are grouped by kind rather than by origin: validation problems are
//! reported synchronously before any work starts, policy and cancellation
//! outcomes surface as terminal call states, and transient model failures
//! appear on the monitor channel instead of failing the caller.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for framework operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The input was rejected before any work started.
    #[error("validation error: {0}")]
    Validation(String),

    /// A capacity limit was hit (pool cap, queue overflow under `Block`).
    #[error("at capacity: {resource} limit of {limit} reached")]
    AtCapacity {
        /// The resource that is full.
        resource: &'static str,
        /// The configured limit.
        limit: usize,
    },

    /// An id is already registered.
    #[error("duplicate id '{0}'")]
    DuplicateId(String),

    /// No agent with the given id exists.
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    /// No tool with the given name is registered.
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    /// No pending approval with the given request id exists.
    #[error("approval request '{0}' not found")]
    RequestNotFound(String),

    /// No plan with the given id is running.
    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    /// The approval request was already resolved.
    #[error("approval request '{0}' already decided")]
    AlreadyDecided(String),

    /// The agent is disabled and rejects further input.
    #[error("agent '{0}' is disabled")]
    AgentDisabled(String),

    /// A tool call was blocked by the risk policy.
    #[error("policy blocked tool '{tool}': {reason}")]
    PolicyBlocked {
        /// Name of the blocked tool.
        tool: String,
        /// Why the policy blocked it.
        reason: String,
    },

    /// A transient model/provider failure.
    #[error("model error: {0}")]
    Model(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// An unrecoverable internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classification used for reporting and event emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad input, rejected synchronously.
    Validation,
    /// A configured limit was reached.
    Capacity,
    /// A referenced entity does not exist.
    NotFound,
    /// Approval policy blocked or denied the action.
    Policy,
    /// A provider-side failure that may succeed on retry.
    Transient,
    /// Cooperative cancellation; never a failure.
    Cancelled,
    /// Unrecoverable invariant violation.
    Fatal,
}

impl Error {
    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a policy-blocked error.
    #[must_use]
    pub fn policy_blocked(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyBlocked {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create a model error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AtCapacity { .. } => ErrorKind::Capacity,
            Self::DuplicateId(_)
            | Self::AgentNotFound(_)
            | Self::ToolNotFound(_)
            | Self::RequestNotFound(_)
            | Self::PlanNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyDecided(_) | Self::AgentDisabled(_) => ErrorKind::Validation,
            Self::PolicyBlocked { .. } => ErrorKind::Policy,
            Self::Model(_) => ErrorKind::Transient,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether this error stands for cooperative cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors produced by tool handlers.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The arguments did not match the tool's schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The tool started but failed while executing.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The tool observed cancellation and stopped early.
    #[error("tool cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}
