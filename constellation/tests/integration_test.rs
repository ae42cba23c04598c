//! End-to-end scenarios for the constellation substrate.

#![allow(clippy::unwrap_used, clippy::panic, clippy::clone_on_ref_ptr)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use constellation::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Best-effort tracing setup; later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

/// Provider that replays scripted chunk sequences, one per chat call.
/// Falls back to a plain "ok"/stop response once the script runs dry.
#[derive(Default)]
struct ScriptedProvider {
    scripts: std::sync::Mutex<VecDeque<Vec<ModelChunk>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<ModelChunk>>) -> Self {
        Self {
            scripts: std::sync::Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat(&self, _ctx: CancellationToken, _request: ChatRequest) -> Result<ModelStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![
                ModelChunk::TextDelta("ok".into()),
                ModelChunk::Finish(FinishReason::Stop),
            ]
        });
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

fn usage(input: u64, output: u64) -> ModelChunk {
    ModelChunk::Usage(Usage {
        input,
        output,
        total: input + output,
    })
}

fn proposal(id: &str, name: &str, args: Value) -> ModelChunk {
    ModelChunk::ToolCall(ToolCallProposal {
        id: id.into(),
        name: name.into(),
        arguments: args,
    })
}

/// Directory listing stub; classified through the filesystem table.
#[derive(Debug, Clone, Copy, Default)]
struct ListTool;

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[allow(dead_code)]
    dir: String,
}

#[async_trait]
impl Tool for ListTool {
    const NAME: &'static str = "list";
    type Args = ListArgs;
    type Output = Vec<String>;

    fn description(&self) -> String {
        "List directory entries.".to_string()
    }

    async fn call(
        &self,
        _ctx: CancellationToken,
        _args: Self::Args,
        _progress: &ProgressSink,
    ) -> std::result::Result<Self::Output, ToolError> {
        Ok(vec!["a".to_string(), "b".to_string()])
    }
}

/// Shell stub that records whether it actually ran.
#[derive(Debug, Clone, Default)]
struct ShellTool {
    executed: Arc<AtomicBool>,
}

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
}

#[async_trait]
impl Tool for ShellTool {
    const NAME: &'static str = "shell";
    type Args = ShellArgs;
    type Output = String;

    fn description(&self) -> String {
        "Run a shell command.".to_string()
    }

    async fn call(
        &self,
        _ctx: CancellationToken,
        args: Self::Args,
        _progress: &ProgressSink,
    ) -> std::result::Result<Self::Output, ToolError> {
        self.executed.store(true, Ordering::SeqCst);
        Ok(format!("ran: {}", args.command))
    }
}

/// Sleeps for the requested duration, honoring cancellation.
#[derive(Debug, Clone, Copy, Default)]
struct SleepTool;

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
}

#[async_trait]
impl Tool for SleepTool {
    const NAME: &'static str = "sleep";
    type Args = SleepArgs;
    type Output = String;

    fn description(&self) -> String {
        "Sleep for a number of milliseconds.".to_string()
    }

    async fn call(
        &self,
        ctx: CancellationToken,
        args: Self::Args,
        _progress: &ProgressSink,
    ) -> std::result::Result<Self::Output, ToolError> {
        tokio::select! {
            () = ctx.cancelled() => Err(ToolError::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(args.ms)) => Ok("slept".to_string()),
        }
    }
}

/// Records wall-clock start/end per invocation and the peak concurrency.
#[derive(Debug, Clone, Default)]
struct TrackTool {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    spans: Arc<std::sync::Mutex<Vec<(String, std::time::Instant, std::time::Instant)>>>,
}

#[derive(Debug, Deserialize)]
struct TrackArgs {
    label: String,
}

#[async_trait]
impl Tool for TrackTool {
    const NAME: &'static str = "track";
    type Args = TrackArgs;
    type Output = String;

    fn description(&self) -> String {
        "Track invocation timing.".to_string()
    }

    async fn call(
        &self,
        _ctx: CancellationToken,
        args: Self::Args,
        _progress: &ProgressSink,
    ) -> std::result::Result<Self::Output, ToolError> {
        let started = std::time::Instant::now();
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.spans
            .lock()
            .unwrap()
            .push((args.label.clone(), started, std::time::Instant::now()));
        Ok(args.label)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Drain a subscription until a `Done` event, returning every envelope seen.
async fn collect_until_done(sub: &Subscription) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    loop {
        let item = timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for events")
            .expect("stream closed before done");
        if let BusItem::Event(env) = item {
            let done = env.event.kind() == EventKind::Done;
            envelopes.push(env);
            if done {
                return envelopes;
            }
        }
    }
}

fn kinds(envelopes: &[Envelope]) -> Vec<EventKind> {
    envelopes.iter().map(|e| e.event.kind()).collect()
}

/// Assert `needle` appears within `haystack` in order (not necessarily
/// contiguously).
fn assert_subsequence(haystack: &[EventKind], needle: &[EventKind]) {
    let mut iter = haystack.iter();
    for expected in needle {
        assert!(
            iter.any(|k| k == expected),
            "expected {expected:?} in order within {haystack:?}"
        );
    }
}

// ---------------------------------------------------------------------------
// S1 — approval allow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_low_risk_tool_runs_without_permission_prompt() {
    init_tracing();
    let provider = ScriptedProvider::new(vec![vec![
        proposal("call_1", "list", json!({ "dir": "/tmp" })),
        usage(12, 3),
        ModelChunk::Finish(FinishReason::Stop),
    ]]);
    let pool = AgentPool::builder()
        .max_agents(10)
        .provider(provider)
        .tool(ListTool)
        .risk_policy(RiskPolicy::Strict)
        .build()
        .unwrap();
    let agent = pool.create(AgentConfig::new("a1")).await.unwrap();
    let sub = agent.subscribe(SubscribeOptions::all()).await;

    let result = agent
        .send(&CancellationToken::new(), "list files")
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Completed);

    let envelopes = collect_until_done(&sub).await;
    let seen = kinds(&envelopes);
    assert_subsequence(
        &seen,
        &[
            EventKind::ToolStart,
            EventKind::ToolEnd,
            EventKind::TokenUsage,
            EventKind::StepComplete,
            EventKind::Done,
        ],
    );
    assert!(
        !seen.contains(&EventKind::PermissionRequired),
        "low-risk call must not prompt"
    );

    let tool_end = envelopes
        .iter()
        .find_map(|e| match &e.event {
            AgentEvent::ToolEnd { call } => Some(call.clone()),
            _ => None,
        })
        .expect("tool end event");
    assert_eq!(tool_end.state, CallState::Completed);
    assert_eq!(tool_end.result, Some(json!(["a", "b"])));

    match envelopes.last().map(|e| &e.event) {
        Some(AgentEvent::Done { reason }) => assert_eq!(*reason, DoneReason::Stop),
        other => panic!("expected done, got {other:?}"),
    }

    // The monitor snapshot redacts arguments unless the tool opts in.
    let executed = envelopes
        .iter()
        .find_map(|e| match &e.event {
            AgentEvent::ToolExecuted { call } => Some(call.clone()),
            _ => None,
        })
        .expect("tool executed snapshot");
    assert_eq!(executed.arguments, Value::Null);
}

// ---------------------------------------------------------------------------
// S2 — approval deny
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_denied_critical_tool_fails_with_policy_cause() {
    init_tracing();
    let shell = ShellTool::default();
    let executed = shell.executed.clone();
    let provider = ScriptedProvider::new(vec![vec![
        proposal("call_1", "shell", json!({ "command": "rm -rf /tmp/x" })),
        usage(20, 5),
        ModelChunk::Finish(FinishReason::Stop),
    ]]);
    let pool = AgentPool::builder()
        .max_agents(10)
        .provider(provider)
        .tool(shell)
        .risk_policy(RiskPolicy::Strict)
        .build()
        .unwrap();
    let agent = pool.create(AgentConfig::new("a1")).await.unwrap();
    let sub = agent.subscribe(SubscribeOptions::all()).await;

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.send(&CancellationToken::new(), "clean up").await })
    };

    // Wait for the permission request, then deny it.
    let request_id = loop {
        let item = timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for permission request")
            .expect("stream open");
        if let BusItem::Event(env) = item
            && let AgentEvent::PermissionRequired { request_id, call, .. } = env.event
        {
            assert_eq!(call.state, CallState::Approving);
            break request_id;
        }
    };
    pool.executor()
        .decide(&request_id, false, Some("no".into()))
        .await
        .unwrap();

    let envelopes = collect_until_done(&sub).await;
    let seen = kinds(&envelopes);
    assert_subsequence(
        &seen,
        &[EventKind::PermissionDecided, EventKind::ToolEnd, EventKind::Done],
    );

    let tool_end = envelopes
        .iter()
        .find_map(|e| match &e.event {
            AgentEvent::ToolEnd { call } => Some(call.clone()),
            _ => None,
        })
        .expect("tool end event");
    assert_eq!(tool_end.state, CallState::Failed);
    assert_eq!(tool_end.cause, Some(FailureCause::Policy));

    match envelopes.last().map(|e| &e.event) {
        Some(AgentEvent::Done { reason }) => assert_eq!(*reason, DoneReason::Error),
        other => panic!("expected done, got {other:?}"),
    }

    let result = runner.await.unwrap().unwrap();
    assert_eq!(result.state, RunState::Failed);
    assert!(!executed.load(Ordering::SeqCst), "no filesystem call may run");
}

// ---------------------------------------------------------------------------
// S3 — DAG with parallelism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_dag_respects_dependencies_and_parallel_cap() {
    init_tracing();
    let track = TrackTool::default();
    let spans = track.spans.clone();
    let peak = track.peak.clone();

    let pool = AgentPool::builder()
        .provider(ScriptedProvider::default())
        .tool(track)
        .build()
        .unwrap();
    pool.create(AgentConfig::new("a1")).await.unwrap();

    let step = |id: &str, deps: &[&str]| {
        ToolCall::new("track", json!({ "label": id }))
            .with_id(id)
            .with_depends_on(deps.iter().copied())
    };
    let options = ExecOptions {
        max_parallel_steps: 2,
        require_approval: false,
        ..ExecOptions::default()
    };
    let plan = ExecutionPlan::new("diamond")
        .with_step(step("s1", &[]))
        .with_step(step("s2", &[]))
        .with_step(step("s3", &["s1", "s2"]))
        .with_step(step("s4", &["s3"]))
        .with_options(options);

    let plan_completes = Arc::new(AtomicUsize::new(0));
    let mut callbacks = ExecCallbacks::new();
    {
        let plan_completes = plan_completes.clone();
        callbacks.add(move |event| {
            if matches!(event, ExecEvent::PlanComplete { .. }) {
                plan_completes.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let ctx = ToolContext::new("a1", CancellationToken::new());
    let report = pool
        .executor()
        .execute(plan, &ctx, &callbacks)
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert!(report.calls.iter().all(|c| c.state == CallState::Completed));
    assert_eq!(plan_completes.load(Ordering::SeqCst), 1);
    assert!(peak.load(Ordering::SeqCst) <= 2, "parallel cap respected");

    let spans = spans.lock().unwrap();
    let span = |label: &str| {
        spans
            .iter()
            .find(|(l, _, _)| l == label)
            .map(|(_, s, e)| (*s, *e))
            .expect("span recorded")
    };
    let (s1_start, s1_end) = span("s1");
    let (s2_start, s2_end) = span("s2");
    let (s3_start, s3_end) = span("s3");
    let (s4_start, _) = span("s4");

    // s1 and s2 overlap; s3 starts after both; s4 after s3.
    assert!(s1_start < s2_end && s2_start < s1_end, "s1 and s2 run concurrently");
    assert!(s3_start >= s1_end && s3_start >= s2_end, "s3 waits for s1 and s2");
    assert!(s4_start >= s3_end, "s4 waits for s3");
}

// ---------------------------------------------------------------------------
// S4 — cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_plan_cancel_stops_executing_step() {
    init_tracing();
    let pool = AgentPool::builder()
        .provider(ScriptedProvider::default())
        .tool(SleepTool)
        .build()
        .unwrap();
    pool.create(AgentConfig::new("a1")).await.unwrap();
    let sub = pool
        .get("a1")
        .await
        .unwrap()
        .subscribe(SubscribeOptions::channels([Channel::Progress]))
        .await;

    let options = ExecOptions {
        require_approval: false,
        step_timeout_ms: 30_000,
        ..ExecOptions::default()
    };
    let plan = ExecutionPlan::new("long")
        .with_step(ToolCall::new("sleep", json!({ "ms": 20_000 })).with_id("slow"))
        .with_options(options);
    let plan_id = plan.id.clone();

    let executor = pool.executor().clone();
    let ctx = ToolContext::new("a1", CancellationToken::new());
    let runner = tokio::spawn(async move {
        executor
            .execute(plan, &ctx, &ExecCallbacks::new())
            .await
    });

    // Wait for the step to start, then cancel the plan.
    loop {
        let item = timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for tool start")
            .expect("stream open");
        if let BusItem::Event(env) = item
            && env.event.kind() == EventKind::ToolStart
        {
            break;
        }
    }
    pool.executor().cancel(&plan_id).unwrap();

    let report = timeout(WAIT, runner).await.expect("cancel is prompt").unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Cancelled);
    assert_eq!(report.calls[0].state, CallState::Cancelled);

    // A ToolEnd for the cancelled step is published; no further ToolStart.
    let mut saw_end = false;
    while let Ok(Some(item)) = timeout(Duration::from_millis(200), sub.recv()).await {
        if let BusItem::Event(env) = item {
            match env.event.kind() {
                EventKind::ToolEnd => saw_end = true,
                EventKind::ToolStart => panic!("no step may start after plan cancel"),
                _ => {}
            }
        }
    }
    assert!(saw_end, "cancelled step still emits ToolEnd");
}

// ---------------------------------------------------------------------------
// S5 — slow subscriber drop-oldest
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_slow_subscriber_drops_oldest_but_keeps_newest() {
    init_tracing();
    let bus = EventBus::default();
    let slow = bus
        .subscribe(
            "a1",
            SubscribeOptions::channels([Channel::Progress]).with_buffer(16),
        )
        .await;
    let fast = bus
        .subscribe(
            "a1",
            SubscribeOptions::channels([Channel::Progress]).with_buffer(1024),
        )
        .await;

    for i in 0..1000 {
        bus.publish(
            "a1",
            AgentEvent::TextChunkDelta {
                delta: i.to_string(),
            },
        )
        .await;
    }

    // Fast subscriber receives all 1000 in order.
    for expect in 0..1000u64 {
        let item = timeout(WAIT, fast.recv()).await.unwrap().unwrap();
        assert_eq!(item.as_event().unwrap().cursor, expect);
    }

    // Slow subscriber sees at least one gap and still ends at the head.
    let mut saw_gap = false;
    let mut last_cursor = None;
    let mut prev = None::<u64>;
    while let Ok(Some(item)) = timeout(Duration::from_millis(200), slow.recv()).await {
        match item {
            BusItem::Gap { dropped, .. } => {
                assert!(dropped > 0);
                saw_gap = true;
            }
            BusItem::Event(env) => {
                if let Some(prev) = prev {
                    assert!(env.cursor > prev, "cursors strictly increase");
                }
                prev = Some(env.cursor);
                last_cursor = Some(env.cursor);
            }
        }
    }
    assert!(saw_gap, "at least one gap marker is observed");
    assert_eq!(last_cursor, Some(999), "newest event is always delivered");
}

// ---------------------------------------------------------------------------
// S6 — stars leader run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_stars_run_yields_leader_events_ending_with_done() {
    init_tracing();
    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        ModelChunk::TextDelta("splitting work".into()),
        usage(8, 2),
        ModelChunk::Finish(FinishReason::Stop),
    ]]));
    let pool = AgentPool::builder()
        .provider_arc(provider.clone())
        .build()
        .unwrap();
    for id in ["leader", "w1", "w2"] {
        pool.create(AgentConfig::new(id)).await.unwrap();
    }

    let stars = Stars::new("team", pool);
    stars
        .join("leader", Member::new(StarRole::Leader))
        .await
        .unwrap();
    stars.join("w1", Member::new(StarRole::Worker)).await.unwrap();
    stars.join("w2", Member::new(StarRole::Worker)).await.unwrap();

    let ctx = CancellationToken::new();
    let mut stream = stars.run(&ctx, "summarize the repo").await;
    let mut events = Vec::new();
    while let Some(event) = timeout(WAIT, stream.recv()).await.expect("run stream stalls") {
        events.push(event);
    }

    assert!(!events.is_empty());
    assert!(
        events.iter().all(|e| e.agent_id == "leader"),
        "run yields only leader-sourced events"
    );
    assert_eq!(
        events.last().unwrap().kind,
        StarsEventKind::Done,
        "sequence ends with done"
    );
    assert_eq!(provider.calls(), 1, "the leader receives exactly one send");
}

// ---------------------------------------------------------------------------
// Supporting invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_step_cancels_dependents_but_not_independents() {
    #[derive(Debug, Clone, Copy, Default)]
    struct FailTool;

    #[derive(Debug, Deserialize)]
    struct FailArgs {}

    #[async_trait]
    impl Tool for FailTool {
        const NAME: &'static str = "fail";
        type Args = FailArgs;
        type Output = String;

        fn description(&self) -> String {
            "Always fails.".to_string()
        }

        async fn call(
            &self,
            _ctx: CancellationToken,
            _args: Self::Args,
            _progress: &ProgressSink,
        ) -> std::result::Result<Self::Output, ToolError> {
            Err(ToolError::Execution("boom".into()))
        }
    }

    let pool = AgentPool::builder()
        .provider(ScriptedProvider::default())
        .tool(FailTool)
        .tool(TrackTool::default())
        .build()
        .unwrap();
    pool.create(AgentConfig::new("a1")).await.unwrap();

    let options = ExecOptions {
        require_approval: false,
        stop_on_error: true,
        ..ExecOptions::default()
    };
    let plan = ExecutionPlan::new("partial failure")
        .with_step(ToolCall::new("fail", json!({})).with_id("bad"))
        .with_step(
            ToolCall::new("track", json!({ "label": "child" }))
                .with_id("child")
                .with_depends_on(["bad"]),
        )
        .with_step(ToolCall::new("track", json!({ "label": "free" })).with_id("free"))
        .with_options(options);

    let ctx = ToolContext::new("a1", CancellationToken::new());
    let report = pool
        .executor()
        .execute(plan, &ctx, &ExecCallbacks::new())
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.call("bad").unwrap().state, CallState::Failed);
    let child = report.call("child").unwrap();
    assert_eq!(child.state, CallState::Cancelled);
    assert_eq!(child.cause, Some(FailureCause::Dependency));
    assert_eq!(
        report.call("free").unwrap().state,
        CallState::Completed,
        "independent step may still complete"
    );
}

#[tokio::test]
async fn step_timeout_fails_the_call() {
    let pool = AgentPool::builder()
        .provider(ScriptedProvider::default())
        .tool(SleepTool)
        .build()
        .unwrap();
    pool.create(AgentConfig::new("a1")).await.unwrap();

    let options = ExecOptions {
        require_approval: false,
        step_timeout_ms: 50,
        ..ExecOptions::default()
    };
    let plan = ExecutionPlan::new("timeout")
        .with_step(ToolCall::new("sleep", json!({ "ms": 10_000 })).with_id("slow"))
        .with_options(options);

    let ctx = ToolContext::new("a1", CancellationToken::new());
    let report = pool
        .executor()
        .execute(plan, &ctx, &ExecCallbacks::new())
        .await
        .unwrap();
    let call = report.call("slow").unwrap();
    assert_eq!(call.state, CallState::Failed);
    assert_eq!(call.cause, Some(FailureCause::Timeout));
}

#[tokio::test]
async fn plan_pause_gates_new_dispatches() {
    let track = TrackTool::default();
    let pool = AgentPool::builder()
        .provider(ScriptedProvider::default())
        .tool(track)
        .build()
        .unwrap();
    pool.create(AgentConfig::new("a1")).await.unwrap();
    let sub = pool
        .get("a1")
        .await
        .unwrap()
        .subscribe(SubscribeOptions::channels([Channel::Progress]))
        .await;

    let options = ExecOptions {
        require_approval: false,
        max_parallel_steps: 1,
        ..ExecOptions::default()
    };
    let plan = ExecutionPlan::new("paused")
        .with_step(ToolCall::new("track", json!({ "label": "one" })).with_id("one"))
        .with_step(
            ToolCall::new("track", json!({ "label": "two" }))
                .with_id("two")
                .with_depends_on(["one"]),
        )
        .with_options(options);
    let plan_id = plan.id.clone();

    let executor = pool.executor().clone();
    let ctx = ToolContext::new("a1", CancellationToken::new());
    let runner = tokio::spawn(async move {
        executor.execute(plan, &ctx, &ExecCallbacks::new()).await
    });

    // Pause once the first step is running.
    loop {
        let item = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        if let BusItem::Event(env) = item
            && env.event.kind() == EventKind::ToolStart
        {
            break;
        }
    }
    pool.executor().pause(&plan_id).unwrap();

    // The first step ends, but the second must not start while paused.
    let mut saw_second_start = false;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(BusItem::Event(env))) =
            timeout(Duration::from_millis(50), sub.recv()).await
            && env.event.kind() == EventKind::ToolStart
        {
            saw_second_start = true;
        }
    }
    assert!(!saw_second_start, "pause must gate new executing transitions");

    pool.executor().resume(&plan_id).unwrap();
    let report = timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
}

#[tokio::test]
async fn agent_pause_suspends_at_iteration_boundary() {
    let provider = ScriptedProvider::new(vec![vec![
        ModelChunk::TextDelta("hi".into()),
        ModelChunk::Finish(FinishReason::Stop),
    ]]);
    let pool = AgentPool::builder().provider(provider).build().unwrap();
    let agent = pool.create(AgentConfig::new("a1")).await.unwrap();

    agent.control(ControlSignal::Pause);
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.send(&CancellationToken::new(), "hello").await })
    };

    // The run suspends before its first iteration.
    timeout(WAIT, async {
        while agent.state() != AgentState::Suspended {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("agent suspends");

    agent.control(ControlSignal::Resume);
    let result = timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.output.as_deref(), Some("hi"));
}

#[tokio::test]
async fn agent_cancel_emits_done_cancelled_and_returns_to_idle() {
    let pool = AgentPool::builder()
        .provider(ScriptedProvider::new(vec![vec![
            proposal("call_1", "sleep", json!({ "ms": 20_000 })),
            ModelChunk::Finish(FinishReason::ToolCalls),
        ]]))
        .tool(SleepTool)
        .build()
        .unwrap();
    let agent = pool.create(AgentConfig::new("a1")).await.unwrap();
    let sub = agent
        .subscribe(SubscribeOptions::channels([Channel::Progress]))
        .await;

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.send(&CancellationToken::new(), "wait").await })
    };

    loop {
        let item = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        if let BusItem::Event(env) = item
            && env.event.kind() == EventKind::ToolStart
        {
            break;
        }
    }
    agent.control(ControlSignal::Cancel);

    let envelopes = collect_until_done(&sub).await;
    match envelopes.last().map(|e| &e.event) {
        Some(AgentEvent::Done { reason }) => assert_eq!(*reason, DoneReason::Cancelled),
        other => panic!("expected done, got {other:?}"),
    }

    let result = timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(result.state, RunState::Interrupted);
    assert_eq!(agent.state(), AgentState::Idle);
}

#[tokio::test]
async fn tool_progress_events_stay_between_start_and_end() {
    #[derive(Debug, Clone, Copy, Default)]
    struct ProgressTool;

    #[derive(Debug, Deserialize)]
    struct ProgressArgs {}

    #[async_trait]
    impl Tool for ProgressTool {
        const NAME: &'static str = "progress";
        type Args = ProgressArgs;
        type Output = String;

        fn description(&self) -> String {
            "Reports progress in thirds.".to_string()
        }

        async fn call(
            &self,
            _ctx: CancellationToken,
            _args: Self::Args,
            progress: &ProgressSink,
        ) -> std::result::Result<Self::Output, ToolError> {
            progress.progress(0.33, "one third").await;
            progress.intermediate("partial", json!({ "n": 1 })).await;
            progress.progress(0.66, "two thirds").await;
            Ok("done".to_string())
        }
    }

    let pool = AgentPool::builder()
        .provider(ScriptedProvider::default())
        .tool(ProgressTool)
        .build()
        .unwrap();
    pool.create(AgentConfig::new("a1")).await.unwrap();
    let sub = pool
        .get("a1")
        .await
        .unwrap()
        .subscribe(SubscribeOptions::channels([Channel::Progress]))
        .await;

    let options = ExecOptions {
        require_approval: false,
        ..ExecOptions::default()
    };
    let plan = ExecutionPlan::new("progress")
        .with_step(ToolCall::new("progress", json!({})).with_id("p"))
        .with_options(options);
    let ctx = ToolContext::new("a1", CancellationToken::new());
    pool.executor()
        .execute(plan, &ctx, &ExecCallbacks::new())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(Some(BusItem::Event(env))) =
        timeout(Duration::from_millis(200), sub.recv()).await
    {
        seen.push(env.event.kind());
    }
    let start = seen.iter().position(|k| *k == EventKind::ToolStart).unwrap();
    let end = seen.iter().position(|k| *k == EventKind::ToolEnd).unwrap();
    for (i, kind) in seen.iter().enumerate() {
        if matches!(kind, EventKind::ToolProgress | EventKind::ToolIntermediate) {
            assert!(i > start && i < end, "progress stays between start and end");
        }
    }
}

#[tokio::test]
async fn approved_call_proceeds_after_decide() {
    let shell = ShellTool::default();
    let executed = shell.executed.clone();
    let provider = ScriptedProvider::new(vec![vec![
        proposal("call_1", "shell", json!({ "command": "mkdir /tmp/demo" })),
        ModelChunk::Finish(FinishReason::Stop),
    ]]);
    let pool = AgentPool::builder()
        .provider(provider)
        .tool(shell)
        .risk_policy(RiskPolicy::Strict)
        .build()
        .unwrap();
    let agent = pool.create(AgentConfig::new("a1")).await.unwrap();
    let sub = agent.subscribe(SubscribeOptions::all()).await;

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.send(&CancellationToken::new(), "make a dir").await })
    };

    let request_id = loop {
        let item = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        if let BusItem::Event(env) = item
            && let AgentEvent::PermissionRequired { request_id, .. } = env.event
        {
            break request_id;
        }
    };
    pool.executor().decide(&request_id, true, None).await.unwrap();

    let result = timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(result.state, RunState::Completed);
    assert!(executed.load(Ordering::SeqCst), "approved call executes");
}
