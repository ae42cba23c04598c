//! Many-writer, many-reader event bus with per-subscriber filtering.
//!
//! Each agent gets its own cursor sequence and a bounded history ring used
//! for bookmark resumption. Subscribers own bounded queues; a slow
//! subscriber under [`OverflowPolicy::DropOldest`] loses the oldest items
//! and observes a [`BusItem::Gap`] marker, never stalling other subscribers.
//! [`OverflowPolicy::Block`] back-pressures the publisher instead and is
//! meant for trusted in-process consumers only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::trace;

use super::{AgentEvent, Bookmark, Channel, Envelope, EventKind, now_ms};

/// Event bus configuration.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Default subscriber queue capacity.
    pub default_buffer: usize,
    /// Per-agent history ring size used for bookmark resumption.
    pub history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_buffer: 256,
            history: 1024,
        }
    }
}

/// What happens when a subscriber queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// The publisher waits for space. Trusted in-process subscribers only.
    Block,
    /// The oldest queued item is discarded; a gap marker records the loss.
    #[default]
    DropOldest,
}

/// One item received from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum BusItem {
    /// A delivered envelope.
    Event(Envelope),
    /// Marker for events this subscriber did not receive.
    Gap {
        /// How many envelopes were skipped.
        dropped: u64,
        /// Cursor of the next envelope that will be delivered.
        resume_cursor: u64,
    },
}

impl BusItem {
    /// The envelope, if this item is one.
    #[must_use]
    pub const fn as_event(&self) -> Option<&Envelope> {
        match self {
            Self::Event(env) => Some(env),
            Self::Gap { .. } => None,
        }
    }
}

/// How to subscribe to an agent's stream.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Channels to receive.
    pub channels: HashSet<Channel>,
    /// Event kinds to receive; `None` means all on the selected channels.
    pub kinds: Option<HashSet<EventKind>>,
    /// Queue capacity; `None` uses the bus default.
    pub buffer: Option<usize>,
    /// Overflow behavior.
    pub policy: OverflowPolicy,
    /// Resume delivery after this bookmark, replaying retained history.
    pub after: Option<Bookmark>,
}

impl SubscribeOptions {
    /// Subscribe to the given channels, all kinds.
    #[must_use]
    pub fn channels<I: IntoIterator<Item = Channel>>(channels: I) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            kinds: None,
            buffer: None,
            policy: OverflowPolicy::default(),
            after: None,
        }
    }

    /// Subscribe to every channel.
    #[must_use]
    pub fn all() -> Self {
        Self::channels([Channel::Progress, Channel::Control, Channel::Monitor])
    }

    /// Restrict to specific event kinds.
    #[must_use]
    pub fn with_kinds<I: IntoIterator<Item = EventKind>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub const fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resume after a bookmark.
    #[must_use]
    pub const fn with_after(mut self, bookmark: Bookmark) -> Self {
        self.after = Some(bookmark);
        self
    }
}

struct QueueState {
    items: VecDeque<Envelope>,
    /// Envelopes lost since the last delivered gap marker.
    dropped: u64,
}

struct SubscriberQueue {
    channels: HashSet<Channel>,
    kinds: Option<HashSet<EventKind>>,
    capacity: usize,
    policy: OverflowPolicy,
    state: std::sync::Mutex<QueueState>,
    recv_notify: Notify,
    send_notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn matches(&self, env: &Envelope) -> bool {
        self.channels.contains(&env.channel)
            && self
                .kinds
                .as_ref()
                .is_none_or(|kinds| kinds.contains(&env.event.kind()))
    }

    /// Enqueue one envelope, honoring the overflow policy.
    async fn push(&self, env: Envelope) {
        match self.policy {
            OverflowPolicy::DropOldest => {
                let mut state = self.state.lock().expect("subscriber queue poisoned");
                if state.items.len() >= self.capacity {
                    state.items.pop_front();
                    state.dropped += 1;
                }
                state.items.push_back(env);
                drop(state);
                self.recv_notify.notify_one();
            }
            OverflowPolicy::Block => loop {
                if self.closed.load(Ordering::Acquire) {
                    return;
                }
                let notified = self.send_notify.notified();
                {
                    let mut state = self.state.lock().expect("subscriber queue poisoned");
                    if state.items.len() < self.capacity {
                        state.items.push_back(env);
                        drop(state);
                        self.recv_notify.notify_one();
                        return;
                    }
                }
                notified.await;
            },
        }
    }

    /// Record `count` evicted envelopes without enqueuing anything.
    fn record_gap(&self, count: u64) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock().expect("subscriber queue poisoned");
        state.dropped += count;
    }

    async fn recv(&self) -> Option<BusItem> {
        loop {
            let notified = self.recv_notify.notified();
            {
                let mut state = self.state.lock().expect("subscriber queue poisoned");
                if state.dropped > 0
                    && let Some(resume_cursor) = state.items.front().map(|front| front.cursor)
                {
                    let dropped = std::mem::take(&mut state.dropped);
                    return Some(BusItem::Gap {
                        dropped,
                        resume_cursor,
                    });
                }
                if let Some(env) = state.items.pop_front() {
                    drop(state);
                    self.send_notify.notify_one();
                    return Some(BusItem::Event(env));
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.recv_notify.notify_waiters();
        self.send_notify.notify_waiters();
    }
}

struct ChannelInner {
    next_cursor: u64,
    last_timestamp: i64,
    history: VecDeque<Envelope>,
    subscribers: Vec<Arc<SubscriberQueue>>,
}

/// One agent's stream: cursor counter, history ring, subscriber table.
struct AgentChannel {
    inner: Mutex<ChannelInner>,
}

impl AgentChannel {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                next_cursor: 0,
                last_timestamp: 0,
                history: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }
}

/// Typed pub/sub fabric multiplexing per-agent event streams.
pub struct EventBus {
    config: BusConfig,
    agents: RwLock<HashMap<String, Arc<AgentChannel>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Create a bus with the given configuration.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
        }
    }

    async fn channel(&self, agent_id: &str) -> Arc<AgentChannel> {
        if let Some(ch) = self.agents.read().await.get(agent_id) {
            return Arc::clone(ch);
        }
        let mut agents = self.agents.write().await;
        Arc::clone(
            agents
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(AgentChannel::new())),
        )
    }

    /// Publish an event on an agent's stream.
    ///
    /// Never fails. Assigns the next cursor, stamps a non-decreasing
    /// timestamp, appends to the history ring, and delivers to every
    /// matching subscriber. Publications from one task to one agent are
    /// delivered FIFO, and every subscriber observes the same order.
    pub async fn publish(&self, agent_id: &str, event: AgentEvent) {
        let channel = self.channel(agent_id).await;
        let mut inner = channel.inner.lock().await;

        let cursor = inner.next_cursor;
        inner.next_cursor += 1;
        let timestamp = now_ms().max(inner.last_timestamp);
        inner.last_timestamp = timestamp;

        let env = Envelope {
            cursor,
            timestamp,
            channel: event.channel(),
            event,
        };
        trace!(agent = agent_id, cursor, "publish");

        inner.history.push_back(env.clone());
        while inner.history.len() > self.config.history {
            inner.history.pop_front();
        }

        inner.subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        for sub in &inner.subscribers {
            if sub.matches(&env) {
                sub.push(env.clone()).await;
            }
        }
    }

    /// Subscribe to an agent's stream.
    ///
    /// Returns a bounded [`Subscription`]; dropping it unsubscribes. When
    /// `opts.after` names a cursor that has been evicted from the history
    /// ring, the subscription starts with one gap marker and continues from
    /// the retained head.
    pub async fn subscribe(&self, agent_id: &str, opts: SubscribeOptions) -> Subscription {
        let channel = self.channel(agent_id).await;
        let queue = Arc::new(SubscriberQueue {
            channels: opts.channels,
            kinds: opts.kinds,
            capacity: opts.buffer.unwrap_or(self.config.default_buffer).max(1),
            policy: opts.policy,
            state: std::sync::Mutex::new(QueueState {
                items: VecDeque::new(),
                dropped: 0,
            }),
            recv_notify: Notify::new(),
            send_notify: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let mut inner = channel.inner.lock().await;
        if let Some(bookmark) = opts.after {
            let earliest = inner.history.front().map(|e| e.cursor);
            if let Some(earliest) = earliest
                && earliest > bookmark.cursor + 1
            {
                queue.record_gap(earliest - bookmark.cursor - 1);
            } else if inner.history.is_empty() && inner.next_cursor > bookmark.cursor + 1 {
                queue.record_gap(inner.next_cursor - bookmark.cursor - 1);
            }
            // Replay at most one queue's worth; the queue is empty, so these
            // pushes can never block a Block-policy subscriber.
            let matching: Vec<Envelope> = inner
                .history
                .iter()
                .filter(|env| env.cursor > bookmark.cursor && queue.matches(env))
                .cloned()
                .collect();
            let skip = matching.len().saturating_sub(queue.capacity);
            queue.record_gap(u64::try_from(skip).unwrap_or(u64::MAX));
            for env in matching.into_iter().skip(skip) {
                queue.push(env).await;
            }
        }
        inner.subscribers.push(Arc::clone(&queue));
        drop(inner);

        Subscription { queue }
    }

    /// Drop an agent's stream: close every subscriber and forget history.
    ///
    /// Pending receivers are unblocked with end-of-stream.
    pub async fn remove_agent(&self, agent_id: &str) {
        let removed = self.agents.write().await.remove(agent_id);
        if let Some(channel) = removed {
            let inner = channel.inner.lock().await;
            for sub in &inner.subscribers {
                sub.close();
            }
        }
    }

    /// Number of live subscribers across every agent stream.
    pub async fn subscriber_count(&self) -> usize {
        let agents = self.agents.read().await;
        let mut count = 0;
        for channel in agents.values() {
            let inner = channel.inner.lock().await;
            count += inner
                .subscribers
                .iter()
                .filter(|s| !s.closed.load(Ordering::Acquire))
                .count();
        }
        count
    }
}

/// The receive end of one bus subscription.
///
/// Dropping the subscription unsubscribes; the bus prunes it on the next
/// publish.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.queue.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Receive the next item, or `None` once closed and drained.
    pub async fn recv(&self) -> Option<BusItem> {
        self.queue.recv().await
    }

    /// Explicitly unsubscribe; queued items are discarded.
    pub fn unsubscribe(self) {
        self.queue.close();
    }

    /// Adapt the subscription into a [`Stream`] of items.
    #[allow(tail_expr_drop_order)]
    pub fn into_stream(self) -> impl Stream<Item = BusItem> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}
