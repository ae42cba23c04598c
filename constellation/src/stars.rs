//! Stars: named collectives of agents with Leader/Worker roles.
//!
//! A star routes messages between member agents and drives Leader-run
//! tasks. `send` and `broadcast` are fire-and-forget: the caller is
//! unblocked as soon as the message is recorded to history; delivery to
//! each recipient happens concurrently and per-recipient failures are
//! logged, never returned. `run` forwards a task to the unique Leader and
//! yields its progress as a lazy, finite sequence.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{AgentEvent, BusItem, Channel, EventKind, SubscribeOptions, now_ms};
use crate::pool::AgentPool;

/// History ring capacity.
const HISTORY_CAP: usize = 100;

/// Role of a member within a star.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StarRole {
    /// Receives tasks and coordinates.
    Leader,
    /// Executes work handed out by the leader.
    Worker,
}

/// A member of a star.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's role.
    pub role: StarRole,
    /// Free-form tags for routing and display.
    pub tags: Vec<String>,
}

impl Member {
    /// Create a member with no tags.
    #[must_use]
    pub const fn new(role: StarRole) -> Self {
        Self {
            role,
            tags: Vec::new(),
        }
    }

    /// Attach tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// One message recorded in a star's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarsMessage {
    /// Sender, when the message came from a member.
    pub from: Option<String>,
    /// Recipient; `None` for broadcasts.
    pub to: Option<String>,
    /// Message text.
    pub text: String,
    /// Wall-clock milliseconds.
    pub time: i64,
}

/// Kind of a mapped run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarsEventKind {
    /// Assistant text delta.
    Text,
    /// Thinking delta.
    Think,
    /// A tool call started.
    ToolStart,
    /// Tool progress.
    ToolProgress,
    /// A tool call ended.
    ToolEnd,
    /// The run finished; last item of the sequence.
    Done,
    /// The run could not start or failed.
    Error,
}

/// One item yielded by [`Stars::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarsEvent {
    /// Agent the event originated from; empty for star-level errors.
    pub agent_id: String,
    /// Event kind.
    pub kind: StarsEventKind,
    /// Kind-specific payload.
    pub content: Value,
    /// Wall-clock milliseconds.
    pub time: i64,
}

struct StarsInner {
    id: String,
    name: String,
    pool: AgentPool,
    members: RwLock<HashMap<String, Member>>,
    history: std::sync::Mutex<VecDeque<StarsMessage>>,
}

/// A named collective of agents. Cheap to clone.
#[derive(Clone)]
pub struct Stars {
    inner: Arc<StarsInner>,
}

impl std::fmt::Debug for Stars {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stars")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Stars {
    /// Create a star over a pool.
    #[must_use]
    pub fn new(name: impl Into<String>, pool: AgentPool) -> Self {
        Self {
            inner: Arc::new(StarsInner {
                id: Uuid::new_v4().simple().to_string(),
                name: name.into(),
                pool,
                members: RwLock::new(HashMap::new()),
                history: std::sync::Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            }),
        }
    }

    /// The star's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The star's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a pool agent as a member.
    ///
    /// Fails when the agent is unknown to the pool, already a member, or a
    /// second Leader would be introduced.
    pub async fn join(&self, agent_id: &str, member: Member) -> Result<()> {
        if self.inner.pool.get(agent_id).await.is_none() {
            return Err(Error::AgentNotFound(agent_id.to_string()));
        }
        let mut members = self.inner.members.write().await;
        if members.contains_key(agent_id) {
            return Err(Error::DuplicateId(agent_id.to_string()));
        }
        if member.role == StarRole::Leader
            && members.values().any(|m| m.role == StarRole::Leader)
        {
            return Err(Error::validation("star already has a leader"));
        }
        members.insert(agent_id.to_string(), member);
        debug!(star = %self.inner.name, agent = agent_id, "member joined");
        Ok(())
    }

    /// Remove a member.
    pub async fn leave(&self, agent_id: &str) -> Result<()> {
        self.inner
            .members
            .write()
            .await
            .remove(agent_id)
            .map(|_| ())
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    /// Snapshot of the membership.
    pub async fn members(&self) -> HashMap<String, Member> {
        self.inner.members.read().await.clone()
    }

    /// The current leader, if any.
    pub async fn leader(&self) -> Option<String> {
        self.inner
            .members
            .read()
            .await
            .iter()
            .find(|(_, m)| m.role == StarRole::Leader)
            .map(|(id, _)| id.clone())
    }

    /// Snapshot of the history ring (oldest first).
    pub fn history(&self) -> Vec<StarsMessage> {
        self.inner
            .history
            .lock()
            .expect("history ring poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn record(&self, message: StarsMessage) {
        let mut history = self.inner.history.lock().expect("history ring poisoned");
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(message);
    }

    /// Send a message from one member to another.
    ///
    /// Fire-and-forget: returns once the message is recorded; delivery runs
    /// concurrently and a failure is logged against the recipient only.
    pub async fn send(
        &self,
        ctx: &CancellationToken,
        from: &str,
        to: &str,
        text: impl Into<String>,
    ) -> Result<()> {
        let members = self.inner.members.read().await;
        if !members.contains_key(from) {
            return Err(Error::AgentNotFound(from.to_string()));
        }
        if !members.contains_key(to) {
            return Err(Error::AgentNotFound(to.to_string()));
        }
        drop(members);

        let text = text.into();
        self.record(StarsMessage {
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            text: text.clone(),
            time: now_ms(),
        });
        self.deliver(ctx.clone(), to.to_string(), text);
        Ok(())
    }

    /// Broadcast a message to every member.
    ///
    /// Fire-and-forget with per-recipient delivery tasks; a recipient
    /// failure is logged against that recipient only.
    pub async fn broadcast(&self, ctx: &CancellationToken, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.record(StarsMessage {
            from: None,
            to: None,
            text: text.clone(),
            time: now_ms(),
        });
        let recipients: Vec<String> = self.inner.members.read().await.keys().cloned().collect();
        for recipient in recipients {
            self.deliver(ctx.clone(), recipient, text.clone());
        }
        Ok(())
    }

    fn deliver(&self, ctx: CancellationToken, recipient: String, text: String) {
        let pool = self.inner.pool.clone();
        let star = self.inner.name.clone();
        tokio::spawn(async move {
            let Some(agent) = pool.get(&recipient).await else {
                warn!(star = %star, recipient = %recipient, "recipient not in pool");
                return;
            };
            if let Err(err) = agent.send(&ctx, text).await {
                warn!(star = %star, recipient = %recipient, error = %err, "delivery failed");
            }
        });
    }

    /// Forward a task to the Leader and stream its progress.
    ///
    /// The returned sequence is lazy, finite, and non-restartable; its last
    /// item is a `done` event. With no leader, or a leader missing from the
    /// pool, the sequence yields a single `error` item. Dropping the stream
    /// unsubscribes; leader work stops only if `ctx` is also cancelled.
    pub async fn run(&self, ctx: &CancellationToken, task: impl Into<String>) -> RunStream {
        let (tx, rx) = mpsc::channel(64);

        let Some(leader_id) = self.leader().await else {
            let _ = tx
                .send(star_error("", "star has no leader"))
                .await;
            return RunStream { rx };
        };
        let Some(leader) = self.inner.pool.get(&leader_id).await else {
            let _ = tx
                .send(star_error(&leader_id, "leader is not in the pool"))
                .await;
            return RunStream { rx };
        };

        let task = task.into();
        self.record(StarsMessage {
            from: None,
            to: Some(leader_id.clone()),
            text: task.clone(),
            time: now_ms(),
        });

        // Subscribe before sending so no progress is missed.
        let subscription = leader
            .subscribe(SubscribeOptions::channels([Channel::Progress]))
            .await;

        let run_ctx = ctx.clone();
        let driver = leader.clone();
        tokio::spawn(async move {
            if let Err(err) = driver.send(&run_ctx, task).await {
                warn!(leader = driver.id(), error = %err, "leader task failed");
            }
        });

        let forward_leader = leader_id.clone();
        tokio::spawn(async move {
            while let Some(item) = subscription.recv().await {
                let BusItem::Event(env) = item else { continue };
                let is_done = env.event.kind() == EventKind::Done;
                if let Some(event) = map_event(&forward_leader, &env.event, env.timestamp) {
                    if tx.send(event).await.is_err() {
                        // Consumer dropped the stream; stop forwarding.
                        return;
                    }
                }
                if is_done {
                    return;
                }
            }
        });

        RunStream { rx }
    }
}

fn star_error(agent_id: &str, message: &str) -> StarsEvent {
    StarsEvent {
        agent_id: agent_id.to_string(),
        kind: StarsEventKind::Error,
        content: json!(message),
        time: now_ms(),
    }
}

/// Map a progress event into a run-stream item.
fn map_event(agent_id: &str, event: &AgentEvent, time: i64) -> Option<StarsEvent> {
    let (kind, content) = match event {
        AgentEvent::TextChunkDelta { delta } => (StarsEventKind::Text, json!(delta)),
        AgentEvent::ThinkChunkDelta { delta } => (StarsEventKind::Think, json!(delta)),
        AgentEvent::ToolStart { call } => (
            StarsEventKind::ToolStart,
            json!({ "id": call.id, "name": call.name }),
        ),
        AgentEvent::ToolProgress { id, frac, msg } => (
            StarsEventKind::ToolProgress,
            json!({ "id": id, "frac": frac, "msg": msg }),
        ),
        AgentEvent::ToolEnd { call } => (
            StarsEventKind::ToolEnd,
            json!({ "id": call.id, "name": call.name, "state": call.state }),
        ),
        AgentEvent::Done { reason } => (StarsEventKind::Done, json!(reason.as_str())),
        _ => return None,
    };
    Some(StarsEvent {
        agent_id: agent_id.to_string(),
        kind,
        content,
        time,
    })
}

/// Lazy, finite sequence of [`StarsEvent`]s from one leader run.
#[derive(Debug)]
pub struct RunStream {
    rx: mpsc::Receiver<StarsEvent>,
}

impl RunStream {
    /// Receive the next event, or `None` at end of sequence.
    pub async fn recv(&mut self) -> Option<StarsEvent> {
        self.rx.recv().await
    }
}

impl Stream for RunStream {
    type Item = StarsEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
