//! The tool execution engine: a DAG scheduler for tool calls.
//!
//! A plan's steps run as concurrent tasks under a parallelism cap, in
//! dependency order, each gated by the approval gateway and bounded by a
//! per-step timeout. Cancellation is cooperative: the plan's token fans out
//! to one child token per step. Pause is advisory — it stops new dispatches
//! but never preempts a running call; pausable handlers additionally hold at
//! their progress-sink checkpoints.

mod callback;
mod plan;

pub use callback::{BoxedExecCallback, ExecCallbacks, ExecEvent};
pub use plan::{
    CallState, ExecOptions, ExecutionPlan, FailureCause, PlanStatus, ToolCall,
};

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::approval::{ApprovalGateway, Decision, Gate};
use crate::error::{Error, Result};
use crate::event::{AgentEvent, ErrorPhase, EventBus, Severity, now_ms};
use crate::tool::{ProgressSink, ToolRegistry};

/// Execution context a plan borrows from its owning agent.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Agent whose stream receives the plan's events.
    pub agent_id: String,
    /// Cancelled when the agent or the caller cancels.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Create a context for an agent.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            agent_id: agent_id.into(),
            cancel,
        }
    }
}

/// Aggregate outcome of one plan execution.
#[derive(Debug, Clone)]
pub struct PlanReport {
    /// Id of the executed plan.
    pub plan_id: String,
    /// Terminal status.
    pub status: PlanStatus,
    /// Every call in insertion order, with terminal states and results.
    pub calls: Vec<ToolCall>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl PlanReport {
    /// Look up a call by id.
    #[must_use]
    pub fn call(&self, id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|c| c.id == id)
    }

    /// Per-step errors as `(id, message)` pairs.
    #[must_use]
    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.calls
            .iter()
            .filter_map(|c| c.error.as_deref().map(|e| (c.id.as_str(), e)))
            .collect()
    }
}

struct PlanHandle {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

/// Schedules plans of tool calls against a registry, gated by approvals.
pub struct ToolExecutor {
    bus: Arc<EventBus>,
    tools: Arc<ToolRegistry>,
    gateway: Arc<ApprovalGateway>,
    plans: std::sync::Mutex<HashMap<String, PlanHandle>>,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ToolExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, tools: Arc<ToolRegistry>, gateway: Arc<ApprovalGateway>) -> Self {
        Self {
            bus,
            tools,
            gateway,
            plans: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The gateway this executor consults.
    #[must_use]
    pub fn gateway(&self) -> &Arc<ApprovalGateway> {
        &self.gateway
    }

    /// Resolve a pending approval request.
    ///
    /// Forwards to the gateway; deciding twice returns
    /// [`Error::AlreadyDecided`].
    pub async fn decide(&self, request_id: &str, approved: bool, reason: Option<String>) -> Result<()> {
        self.gateway.decide(request_id, approved, reason).await
    }

    /// Cancel a running plan.
    pub fn cancel(&self, plan_id: &str) -> Result<()> {
        let plans = self.plans.lock().expect("plan table poisoned");
        let handle = plans
            .get(plan_id)
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))?;
        handle.cancel.cancel();
        Ok(())
    }

    /// Stop issuing new executing transitions for a plan.
    pub fn pause(&self, plan_id: &str) -> Result<()> {
        self.set_paused(plan_id, true)
    }

    /// Resume a paused plan.
    pub fn resume(&self, plan_id: &str) -> Result<()> {
        self.set_paused(plan_id, false)
    }

    fn set_paused(&self, plan_id: &str, paused: bool) -> Result<()> {
        let plans = self.plans.lock().expect("plan table poisoned");
        let handle = plans
            .get(plan_id)
            .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))?;
        handle.pause.send_replace(paused);
        Ok(())
    }

    /// Execute a plan to completion.
    ///
    /// Validates the DAG and tool references synchronously, then schedules
    /// steps until every call is terminal. Returns the aggregate report;
    /// plan-level cancellation is reported as a `Cancelled` status, never as
    /// an error.
    pub async fn execute(
        &self,
        mut plan: ExecutionPlan,
        ctx: &ToolContext,
        callbacks: &ExecCallbacks,
    ) -> Result<PlanReport> {
        plan.validate()?;
        for step in &plan.steps {
            if !self.tools.contains(&step.name) {
                return Err(Error::ToolNotFound(step.name.clone()));
            }
        }

        let cancel = ctx.cancel.child_token();
        let (pause_tx, pause_rx) = watch::channel(false);
        {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            if plans.contains_key(&plan.id) {
                return Err(Error::DuplicateId(plan.id.clone()));
            }
            plans.insert(
                plan.id.clone(),
                PlanHandle {
                    cancel: cancel.clone(),
                    pause: pause_tx,
                },
            );
        }

        plan.status = PlanStatus::Executing;
        let started = now_ms();
        debug!(plan = %plan.id, steps = plan.steps.len(), "executing plan");

        let report = self
            .run_plan(&plan, ctx, callbacks, cancel, pause_rx, started)
            .await;

        self.plans
            .lock()
            .expect("plan table poisoned")
            .remove(&plan.id);
        callbacks.emit(&ExecEvent::PlanComplete {
            plan_id: report.plan_id.clone(),
            status: report.status,
        });
        Ok(report)
    }

    async fn run_plan(
        &self,
        plan: &ExecutionPlan,
        ctx: &ToolContext,
        callbacks: &ExecCallbacks,
        cancel: CancellationToken,
        mut pause_rx: watch::Receiver<bool>,
        started: i64,
    ) -> PlanReport {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let mut run = PlanRun::new(self, plan, ctx, callbacks, cancel.clone(), pause_rx.clone(), tx);

        let watch_cancel = cancel;
        loop {
            if !run.paused && !run.cancelling {
                run.dispatch().await;
            }
            if run.terminal == run.total {
                break;
            }
            let cancelling = run.cancelling;
            tokio::select! {
                () = watch_cancel.cancelled(), if !cancelling => {
                    run.handle_plan_cancel().await;
                }
                changed = pause_rx.changed() => {
                    if changed.is_ok() {
                        run.paused = *pause_rx.borrow_and_update();
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => run.handle(msg).await,
                        None => break,
                    }
                }
            }
        }

        let status = if run.cancelling {
            PlanStatus::Cancelled
        } else if run.any_failed && plan.options.stop_on_error {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };
        let calls = run.into_calls();
        PlanReport {
            plan_id: plan.id.clone(),
            status,
            calls,
            duration_ms: u64::try_from(now_ms().saturating_sub(started)).unwrap_or(0),
        }
    }
}

enum StepOutcome {
    Completed(Value),
    Failed { error: String, cause: FailureCause },
    Cancelled,
}

enum Msg {
    Approval {
        id: String,
        result: Result<Decision>,
    },
    Finished {
        id: String,
        outcome: StepOutcome,
    },
}

/// Heap entry; higher priority first, FIFO within a priority band.
struct ReadyEntry {
    priority: i32,
    seq: usize,
    id: String,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for ReadyEntry {}
impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct PlanRun<'a> {
    executor: &'a ToolExecutor,
    agent_id: String,
    options: ExecOptions,
    state: Arc<std::sync::Mutex<HashMap<String, ToolCall>>>,
    order: Vec<String>,
    seq: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    unmet: HashMap<String, usize>,
    ready: BinaryHeap<ReadyEntry>,
    launchable: VecDeque<String>,
    in_flight: usize,
    terminal: usize,
    total: usize,
    cancel: CancellationToken,
    pause_rx: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<Msg>,
    callbacks: &'a ExecCallbacks,
    paused: bool,
    cancelling: bool,
    any_failed: bool,
}

impl<'a> PlanRun<'a> {
    fn new(
        executor: &'a ToolExecutor,
        plan: &ExecutionPlan,
        ctx: &ToolContext,
        callbacks: &'a ExecCallbacks,
        cancel: CancellationToken,
        pause_rx: watch::Receiver<bool>,
        tx: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        let mut state = HashMap::with_capacity(plan.steps.len());
        let mut order = Vec::with_capacity(plan.steps.len());
        let mut seq = HashMap::with_capacity(plan.steps.len());
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut unmet = HashMap::with_capacity(plan.steps.len());
        let mut ready = BinaryHeap::new();

        for (i, step) in plan.steps.iter().enumerate() {
            order.push(step.id.clone());
            seq.insert(step.id.clone(), i);
            unmet.insert(step.id.clone(), step.depends_on.len());
            for dep in &step.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
            if step.depends_on.is_empty() {
                ready.push(ReadyEntry {
                    priority: step.priority,
                    seq: i,
                    id: step.id.clone(),
                });
            }
            state.insert(step.id.clone(), step.clone());
        }

        Self {
            executor,
            agent_id: ctx.agent_id.clone(),
            options: plan.options,
            state: Arc::new(std::sync::Mutex::new(state)),
            order,
            seq,
            dependents,
            unmet,
            ready,
            launchable: VecDeque::new(),
            in_flight: 0,
            terminal: 0,
            total: plan.steps.len(),
            cancel,
            pause_rx,
            tx,
            callbacks,
            paused: false,
            cancelling: false,
            any_failed: false,
        }
    }

    fn update<F: FnOnce(&mut ToolCall)>(&self, id: &str, f: F) -> ToolCall {
        let mut map = self.state.lock().expect("plan state poisoned");
        let call = map.get_mut(id).expect("call id out of sync");
        f(call);
        call.clone()
    }

    fn snapshot(&self, id: &str) -> ToolCall {
        let map = self.state.lock().expect("plan state poisoned");
        map.get(id).cloned().expect("call id out of sync")
    }

    fn call_state(&self, id: &str) -> CallState {
        let map = self.state.lock().expect("plan state poisoned");
        map.get(id).map_or(CallState::Cancelled, |c| c.state)
    }

    fn into_calls(self) -> Vec<ToolCall> {
        let map = self.state.lock().expect("plan state poisoned");
        self.order
            .iter()
            .filter_map(|id| map.get(id).cloned())
            .collect()
    }

    /// Launch queued and ready calls while capacity allows.
    async fn dispatch(&mut self) {
        let cap = self.options.parallelism();
        loop {
            if self.in_flight >= cap {
                return;
            }
            if let Some(id) = self.launchable.pop_front() {
                self.launch(id).await;
                continue;
            }
            let Some(entry) = self.ready.pop() else { return };
            self.admit(entry.id).await;
        }
    }

    /// Move a dependency-free call past the approval gate.
    async fn admit(&mut self, id: String) {
        let snapshot = self.snapshot(&id);
        let declared = self
            .executor
            .tools
            .get(&snapshot.name)
            .and_then(|h| h.capabilities().risk);
        let gate = if self.options.require_approval {
            self.executor.gateway.assess(&snapshot, declared)
        } else {
            Gate::Allow
        };
        match gate {
            Gate::Allow => {
                self.update(&id, |c| c.state = CallState::Queued);
                self.launch(id).await;
            }
            Gate::RequireUser => {
                let parked = self.update(&id, |c| c.state = CallState::Approving);
                let gateway = Arc::clone(&self.executor.gateway);
                let agent_id = self.agent_id.clone();
                let cancel = self.cancel.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = gateway
                        .request_approval(&agent_id, &parked, declared, &cancel)
                        .await;
                    let _ = tx.send(Msg::Approval {
                        id: parked.id.clone(),
                        result,
                    });
                });
            }
            Gate::Block(reason) => {
                let call = self.update(&id, |c| {
                    c.state = CallState::Failed;
                    c.error = Some(reason.clone());
                    c.cause = Some(FailureCause::Policy);
                    c.ended_at = Some(now_ms());
                });
                self.terminal += 1;
                self.any_failed = true;
                self.emit_terminal(&call).await;
                self.callbacks.emit(&ExecEvent::StepFailed(call));
                self.cascade_cancel(&id).await;
            }
        }
    }

    /// Transition a queued call to executing and spawn its task.
    async fn launch(&mut self, id: String) {
        let name = self.snapshot(&id).name;
        let Some(handler) = self.executor.tools.get(&name) else {
            // Registry checked before execution; a miss here is an invariant
            // violation, surfaced as a failed call rather than a crash.
            let call = self.update(&id, |c| {
                c.state = CallState::Failed;
                c.error = Some("tool vanished from registry".into());
                c.cause = Some(FailureCause::Execution);
                c.ended_at = Some(now_ms());
            });
            self.terminal += 1;
            self.any_failed = true;
            self.emit_terminal(&call).await;
            self.callbacks.emit(&ExecEvent::StepFailed(call));
            self.cascade_cancel(&id).await;
            return;
        };

        let call = self.update(&id, |c| {
            c.state = CallState::Executing;
            c.started_at = Some(now_ms());
        });
        self.in_flight += 1;
        self.executor
            .bus
            .publish(&self.agent_id, AgentEvent::ToolStart { call: call.clone() })
            .await;
        self.callbacks.emit(&ExecEvent::StepStart(call.clone()));

        let caps = handler.capabilities();
        let step_token = self.cancel.child_token();
        let mut sink = ProgressSink::new(
            Arc::clone(&self.executor.bus),
            self.agent_id.clone(),
            id.clone(),
        );
        if caps.pausable {
            let state = Arc::clone(&self.state);
            let call_id = id.clone();
            let hook: Arc<dyn Fn(bool) + Send + Sync> = Arc::new(move |paused| {
                let mut map = state.lock().expect("plan state poisoned");
                if let Some(call) = map.get_mut(&call_id) {
                    if paused && call.state == CallState::Executing {
                        call.state = CallState::Paused;
                    } else if !paused && call.state == CallState::Paused {
                        call.state = CallState::Executing;
                    }
                }
            });
            sink = sink.with_pause(self.pause_rx.clone(), hook);
        }

        let tx = self.tx.clone();
        let timeout_ms = self.options.step_timeout_ms;
        let arguments = call.arguments.clone();
        tokio::spawn(async move {
            let fut = handler.execute(step_token.clone(), arguments, &sink);
            let outcome = if timeout_ms > 0 {
                tokio::select! {
                    () = step_token.cancelled() => StepOutcome::Cancelled,
                    res = tokio::time::timeout(Duration::from_millis(timeout_ms), fut) => {
                        match res {
                            Err(_) => StepOutcome::Failed {
                                error: format!("step timed out after {timeout_ms}ms"),
                                cause: FailureCause::Timeout,
                            },
                            Ok(out) => StepOutcome::from(out),
                        }
                    }
                }
            } else {
                tokio::select! {
                    () = step_token.cancelled() => StepOutcome::Cancelled,
                    out = fut => StepOutcome::from(out),
                }
            };
            let _ = tx.send(Msg::Finished { id, outcome });
        });
    }

    async fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Approval { id, result } => self.handle_approval(id, result).await,
            Msg::Finished { id, outcome } => self.handle_finished(id, outcome).await,
        }
    }

    async fn handle_approval(&mut self, id: String, result: Result<Decision>) {
        if self.call_state(&id).is_terminal() {
            return;
        }
        if self.cancelling {
            self.finish_cancelled(&id, None).await;
            return;
        }
        match result {
            Ok(decision) if decision.approved => {
                self.update(&id, |c| c.state = CallState::Queued);
                self.launchable.push_back(id);
            }
            Ok(decision) => {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "denied by user".to_string());
                let call = self.update(&id, |c| {
                    c.state = CallState::Failed;
                    c.error = Some(reason);
                    c.cause = Some(FailureCause::Policy);
                    c.ended_at = Some(now_ms());
                });
                self.terminal += 1;
                self.any_failed = true;
                self.emit_terminal(&call).await;
                self.callbacks.emit(&ExecEvent::StepFailed(call));
                self.cascade_cancel(&id).await;
            }
            Err(_) => self.finish_cancelled(&id, None).await,
        }
    }

    async fn handle_finished(&mut self, id: String, outcome: StepOutcome) {
        let state = self.call_state(&id);
        if state.is_terminal() {
            return;
        }
        if matches!(state, CallState::Executing | CallState::Paused) {
            self.in_flight -= 1;
        }
        match outcome {
            StepOutcome::Completed(result) => {
                let call = self.update(&id, |c| {
                    c.state = CallState::Completed;
                    c.progress = 1.0;
                    c.result = Some(result);
                    c.ended_at = Some(now_ms());
                });
                self.terminal += 1;
                self.emit_terminal(&call).await;
                self.callbacks.emit(&ExecEvent::StepComplete(call));
                self.promote_dependents(&id);
            }
            StepOutcome::Failed { error, cause } => {
                warn!(call = %id, error = %error, "step failed");
                let call = self.update(&id, |c| {
                    c.state = CallState::Failed;
                    c.error = Some(error.clone());
                    c.cause = Some(cause);
                    c.ended_at = Some(now_ms());
                });
                self.terminal += 1;
                self.any_failed = true;
                self.executor
                    .bus
                    .publish(
                        &self.agent_id,
                        AgentEvent::Error {
                            severity: Severity::Error,
                            phase: ErrorPhase::Tool,
                            message: error,
                            detail: None,
                        },
                    )
                    .await;
                self.emit_terminal(&call).await;
                self.callbacks.emit(&ExecEvent::StepFailed(call));
                self.cascade_cancel(&id).await;
            }
            StepOutcome::Cancelled => {
                self.finish_cancelled(&id, None).await;
                self.cascade_cancel(&id).await;
            }
        }
    }

    /// Mark a non-terminal call cancelled and emit its terminal events.
    async fn finish_cancelled(&mut self, id: &str, cause: Option<FailureCause>) {
        let call = self.update(id, |c| {
            c.state = CallState::Cancelled;
            c.cause = cause;
            c.ended_at = Some(now_ms());
        });
        self.terminal += 1;
        self.emit_terminal(&call).await;
    }

    /// A completed call releases its dependents into the ready set.
    fn promote_dependents(&mut self, id: &str) {
        let Some(children) = self.dependents.get(id).cloned() else {
            return;
        };
        for child in children {
            if let Some(count) = self.unmet.get_mut(&child) {
                *count = count.saturating_sub(1);
                if *count == 0 && self.call_state(&child) == CallState::Pending {
                    let seq = self.seq.get(&child).copied().unwrap_or(usize::MAX);
                    let priority = {
                        let map = self.state.lock().expect("plan state poisoned");
                        map.get(&child).map_or(0, |c| c.priority)
                    };
                    self.ready.push(ReadyEntry {
                        priority,
                        seq,
                        id: child,
                    });
                }
            }
        }
    }

    /// Failed or cancelled parents never yield ready children: every
    /// transitive dependent that has not started is cancelled.
    async fn cascade_cancel(&mut self, id: &str) {
        let mut work: Vec<String> = self.dependents.get(id).cloned().unwrap_or_default();
        while let Some(child) = work.pop() {
            if self.call_state(&child).is_terminal() {
                continue;
            }
            self.finish_cancelled(&child, Some(FailureCause::Dependency))
                .await;
            if let Some(grandchildren) = self.dependents.get(&child) {
                work.extend(grandchildren.iter().cloned());
            }
        }
    }

    /// Plan-level cancel: everything not yet executing stops immediately;
    /// executing calls finish through their cancelled tokens.
    async fn handle_plan_cancel(&mut self) {
        self.cancelling = true;
        self.launchable.clear();
        let waiting: Vec<String> = {
            let map = self.state.lock().expect("plan state poisoned");
            map.values()
                .filter(|c| matches!(c.state, CallState::Pending | CallState::Queued))
                .map(|c| c.id.clone())
                .collect()
        };
        for id in waiting {
            self.finish_cancelled(&id, None).await;
        }
        self.ready.clear();
        // Approving and Executing calls resolve through their tokens; the
        // scheduler keeps draining messages until every call is terminal.
    }

    /// ToolEnd on the agent's progress channel, snapshot on monitor.
    ///
    /// The monitor snapshot redacts argument values unless the handler
    /// opted in with `expose_arguments`.
    async fn emit_terminal(&self, call: &ToolCall) {
        self.executor
            .bus
            .publish(&self.agent_id, AgentEvent::ToolEnd { call: call.clone() })
            .await;
        let expose = self
            .executor
            .tools
            .get(&call.name)
            .is_some_and(|h| h.capabilities().expose_arguments);
        let mut snapshot = call.clone();
        if !expose {
            snapshot.arguments = Value::Null;
        }
        self.executor
            .bus
            .publish(&self.agent_id, AgentEvent::ToolExecuted { call: snapshot })
            .await;
    }
}

impl From<std::result::Result<Value, crate::error::ToolError>> for StepOutcome {
    fn from(res: std::result::Result<Value, crate::error::ToolError>) -> Self {
        match res {
            Ok(value) => Self::Completed(value),
            Err(crate::error::ToolError::Cancelled) => Self::Cancelled,
            Err(err) => Self::Failed {
                error: err.to_string(),
                cause: FailureCause::Execution,
            },
        }
    }
}
