#![cfg_attr(docsrs, feature(doc_cfg))]
//! Constellation is a concurrent agent-execution substrate: an agent pool,
//! a typed event bus with per-subscriber filtering, a DAG tool executor
//! with approval gates, and a multi-agent collaboration layer (stars).
//!
//! The core stays free of I/O: model providers, tool implementations, and
//! durable session stores plug in through the traits in [`provider`],
//! [`tool`], and [`session`].
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = AgentPool::builder()
//!     .max_agents(10)
//!     .provider(my_provider)
//!     .tool(ListFilesTool)
//!     .risk_policy(RiskPolicy::Strict)
//!     .build()?;
//!
//! let agent = pool.create(AgentConfig::new("a1")).await?;
//! let sub = agent.subscribe(SubscribeOptions::all()).await;
//! let result = agent.send(&CancellationToken::new(), "list files").await?;
//! ```

// Core modules
pub mod error;
pub mod event;

// Seams for external collaborators
pub mod provider;
pub mod session;
pub mod tool;

// Execution
pub mod agent;
pub mod approval;
pub mod executor;
pub mod pool;
pub mod stars;

pub mod prelude;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result, ToolError};
pub use event::{
    AgentEvent, Bookmark, BusConfig, BusItem, Channel, DoneReason, Envelope, EventBus, EventKind,
    OverflowPolicy, SubscribeOptions, Subscription,
};
pub use agent::{Agent, AgentConfig, AgentState, ControlSignal, RunResult, RunState};
pub use pool::{AgentPool, PoolConfig};
