//! The agent run loop.
//!
//! One iteration: snapshot the history, call the model, stream deltas out
//! as progress events, execute any proposed tool calls as a plan, fold the
//! results back into the history, and emit step telemetry. The loop ends on
//! a natural stop, the iteration cap, or cancellation.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::event::{AgentEvent, DoneReason, ErrorPhase, Severity, now_ms};
use crate::executor::{CallState, ExecutionPlan, PlanStatus, ToolCall, ToolContext};
use crate::executor::ExecCallbacks;
use crate::provider::{
    ChatRequest, FinishReason, Message, ModelStream, ToolCallProposal, Usage,
};

use super::{Agent, AgentState, RunResult, RunState};

/// Everything folded out of one model response stream.
#[derive(Default)]
struct FoldedResponse {
    text: String,
    proposals: Vec<ToolCallProposal>,
    usage: Usage,
    finish: Option<FinishReason>,
}

impl Agent {
    /// Run one conversation turn.
    ///
    /// Returns a typed error only for problems detected before work starts
    /// (empty input, disabled agent). Once streaming has begun, failures
    /// surface as monitor events plus a terminal `Done`, and the returned
    /// [`RunResult`] carries the outcome. Cancellation — through `ctx`,
    /// [`ControlSignal::Cancel`](super::ControlSignal::Cancel), or `close`
    /// — ends the run with `Done(cancelled)` and is never an error.
    #[instrument(skip_all, fields(agent = %self.id()))]
    pub async fn send(&self, ctx: &CancellationToken, input: impl Into<String>) -> Result<RunResult> {
        let input = input.into();
        if input.trim().is_empty() {
            return Err(Error::validation("empty input"));
        }
        if self.state() == AgentState::Disabled {
            return Err(Error::AgentDisabled(self.id().to_string()));
        }

        let _guard = self.inner.run_lock.lock().await;
        if self.state() == AgentState::Disabled {
            return Err(Error::AgentDisabled(self.id().to_string()));
        }

        // The run token trips on caller cancel, control(Cancel), or close.
        let run = CancellationToken::new();
        let _run_guard = run.clone().drop_guard();
        {
            let caller = ctx.clone();
            let close = self.inner.close_token.clone();
            let run = run.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = caller.cancelled() => run.cancel(),
                    () = close.cancelled() => run.cancel(),
                    () = run.cancelled() => {}
                }
            });
        }
        *self
            .inner
            .current_run
            .lock()
            .expect("run slot poisoned") = Some(run.clone());
        self.set_state(AgentState::Working);
        debug!("run started");

        let started = now_ms();
        self.inner.history.lock().await.push(Message::user(input));

        let max = self.inner.config.max_iterations;
        let mut total_usage = Usage::default();
        let mut steps = 0usize;
        let mut output = None;
        let mut end = (DoneReason::MaxSteps, RunState::MaxSteps, None::<String>);

        'run: while steps < max {
            self.wait_if_paused(&run).await;
            if run.is_cancelled() {
                end = (DoneReason::Cancelled, RunState::Interrupted, None);
                break 'run;
            }

            steps += 1;
            let step_started = now_ms();
            let request = ChatRequest {
                messages: self.inner.history.lock().await.clone(),
                tools: self.inner.tools.definitions(),
            };

            let stream = match self.inner.provider.chat(run.clone(), request).await {
                Ok(stream) => stream,
                Err(err) => {
                    end = self.model_failure(err).await;
                    break 'run;
                }
            };
            let folded = match self.consume_stream(stream).await {
                Ok(folded) => folded,
                Err(err) => {
                    end = self.model_failure(err).await;
                    break 'run;
                }
            };

            let mut assistant = Message::assistant(folded.text.clone());
            assistant.tool_calls = folded.proposals.clone();
            self.inner.history.lock().await.push(assistant);

            if !folded.proposals.is_empty() {
                match self.run_tools(&run, &folded.proposals).await {
                    ToolRound::Continue => {}
                    ToolRound::Cancelled => {
                        end = (DoneReason::Cancelled, RunState::Interrupted, None);
                        break 'run;
                    }
                    ToolRound::Failed(message) => {
                        end = (DoneReason::Error, RunState::Failed, Some(message));
                        break 'run;
                    }
                }
            }

            total_usage += folded.usage;
            self.publish(AgentEvent::TokenUsage(folded.usage)).await;
            self.publish(AgentEvent::StepComplete {
                step: steps,
                duration_ms: u64::try_from(now_ms().saturating_sub(step_started)).unwrap_or(0),
            })
            .await;

            // The model asks for another round only via a tool-calls finish.
            if !matches!(folded.finish, Some(FinishReason::ToolCalls)) {
                output = Some(folded.text);
                end = (DoneReason::Stop, RunState::Completed, None);
                break 'run;
            }
        }

        self.publish(AgentEvent::Done { reason: end.0 }).await;
        self.inner
            .current_run
            .lock()
            .expect("run slot poisoned")
            .take();
        self.set_state(AgentState::Idle);
        debug!(state = %end.1, steps, "run finished");

        Ok(RunResult {
            output,
            state: end.1,
            usage: total_usage,
            steps_taken: steps,
            duration_ms: u64::try_from(now_ms().saturating_sub(started)).unwrap_or(0),
            error: end.2,
        })
    }

    /// Suspend at an iteration boundary while the pause flag is set.
    async fn wait_if_paused(&self, run: &CancellationToken) {
        let mut rx = self.inner.pause.subscribe();
        if !*rx.borrow_and_update() {
            return;
        }
        self.set_state(AgentState::Suspended);
        debug!("suspended at iteration boundary");
        loop {
            tokio::select! {
                () = run.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() || !*rx.borrow_and_update() {
                        break;
                    }
                }
            }
        }
        self.set_state(AgentState::Working);
    }

    async fn model_failure(&self, err: Error) -> (DoneReason, RunState, Option<String>) {
        if err.is_cancelled() {
            return (DoneReason::Cancelled, RunState::Interrupted, None);
        }
        warn!(error = %err, "model call failed");
        self.publish(AgentEvent::Error {
            severity: Severity::Error,
            phase: ErrorPhase::Model,
            message: err.to_string(),
            detail: None,
        })
        .await;
        (DoneReason::Error, RunState::Failed, Some(err.to_string()))
    }

    /// Drain one model stream, forwarding deltas as progress events.
    async fn consume_stream(&self, mut stream: ModelStream) -> Result<FoldedResponse> {
        let mut folded = FoldedResponse::default();
        let mut text_open = false;
        let mut think_open = false;

        while let Some(item) = stream.next().await {
            match item? {
                crate::provider::ModelChunk::TextDelta(delta) => {
                    if think_open {
                        self.publish(AgentEvent::ThinkChunkEnd).await;
                        think_open = false;
                    }
                    if !text_open {
                        self.publish(AgentEvent::TextChunkStart).await;
                        text_open = true;
                    }
                    folded.text.push_str(&delta);
                    self.publish(AgentEvent::TextChunkDelta { delta }).await;
                }
                crate::provider::ModelChunk::ThinkDelta(delta) => {
                    if text_open {
                        self.publish(AgentEvent::TextChunkEnd).await;
                        text_open = false;
                    }
                    if !think_open {
                        self.publish(AgentEvent::ThinkChunkStart).await;
                        think_open = true;
                    }
                    self.publish(AgentEvent::ThinkChunkDelta { delta }).await;
                }
                crate::provider::ModelChunk::ToolCall(proposal) => {
                    folded.proposals.push(proposal);
                }
                crate::provider::ModelChunk::Usage(usage) => {
                    folded.usage = usage;
                }
                crate::provider::ModelChunk::Finish(reason) => {
                    folded.finish = Some(reason);
                }
            }
        }
        if think_open {
            self.publish(AgentEvent::ThinkChunkEnd).await;
        }
        if text_open {
            self.publish(AgentEvent::TextChunkEnd).await;
        }
        Ok(folded)
    }

    /// Execute one round of proposed tool calls as a plan.
    async fn run_tools(
        &self,
        run: &CancellationToken,
        proposals: &[ToolCallProposal],
    ) -> ToolRound {
        let mut plan = ExecutionPlan::new("model tool calls")
            .with_options(self.inner.config.exec);
        let mut unknown = Vec::new();
        for proposal in proposals {
            if self.inner.tools.contains(&proposal.name) {
                plan = plan.with_step(ToolCall::from_proposal(proposal.clone()));
            } else {
                unknown.push(proposal.clone());
            }
        }
        {
            let mut history = self.inner.history.lock().await;
            for proposal in unknown {
                history.push(Message::tool_result(
                    proposal.id,
                    format!("Tool '{}' is not available", proposal.name),
                ));
            }
        }
        if plan.steps.is_empty() {
            return ToolRound::Continue;
        }

        let ctx = ToolContext::new(self.id(), run.clone());
        let report = match self
            .inner
            .executor
            .execute(plan, &ctx, &ExecCallbacks::new())
            .await
        {
            Ok(report) => report,
            Err(err) => {
                if err.is_cancelled() {
                    return ToolRound::Cancelled;
                }
                self.publish(AgentEvent::Error {
                    severity: Severity::Error,
                    phase: ErrorPhase::Plan,
                    message: err.to_string(),
                    detail: None,
                })
                .await;
                return ToolRound::Failed(err.to_string());
            }
        };

        {
            let mut history = self.inner.history.lock().await;
            for call in &report.calls {
                history.push(Message::tool_result(call.id.clone(), render_result(call)));
            }
        }

        match report.status {
            PlanStatus::Cancelled => ToolRound::Cancelled,
            PlanStatus::Failed => {
                let message = report
                    .errors()
                    .first()
                    .map_or_else(|| "tool plan failed".to_string(), |(_, e)| (*e).to_string());
                ToolRound::Failed(message)
            }
            _ => ToolRound::Continue,
        }
    }

    pub(crate) async fn publish(&self, event: AgentEvent) {
        self.inner.bus.publish(self.id(), event).await;
    }
}

enum ToolRound {
    Continue,
    Cancelled,
    Failed(String),
}

/// Render a terminal call as the observation fed back to the model.
fn render_result(call: &ToolCall) -> String {
    match call.state {
        CallState::Completed => {
            let value = call
                .result
                .as_ref()
                .map_or_else(String::new, ToString::to_string);
            format!("Tool '{}' returned: {value}", call.name)
        }
        CallState::Cancelled => format!("Tool '{}' was cancelled", call.name),
        _ => format!(
            "Tool '{}' failed: {}",
            call.name,
            call.error.as_deref().unwrap_or("unknown error")
        ),
    }
}
