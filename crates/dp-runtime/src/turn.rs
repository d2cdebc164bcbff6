//! One turn of the ReAct loop.
//!
//! Phases: load + compress + assemble → streaming model call → delta
//! consumption → tool dispatch → iterate until the model stops calling
//! tools, the iteration cap is hit, the turn is cancelled, or a fatal
//! error fires. Events carry a strict `(turn, seq)` order; the turn
//! log is persisted as the loop goes, never rewritten.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use dp_context::{CompressionEngine, CompressionStore};
use dp_domain::config::Config;
use dp_domain::error::Error;
use dp_domain::event::EventBody;
use dp_domain::message::{Message, ToolCall, Usage};
use dp_domain::plan::StepStatus;
use dp_domain::stream::{Purpose, StreamDelta};
use dp_providers::{ChatRequest, ModelRouter};
use dp_sandbox::SandboxExecutor;
use dp_sessions::{SessionStore, TurnLog, TurnStatus};
use dp_skills::{ToolKind, ToolRegistry};
use dp_workspace::SessionWorkspace;

use crate::bus::EventBus;
use crate::cancel::CancelToken;
use crate::plan::{self, PlanTracker};
use crate::prompt;
use crate::tools::{self, ToolContext, ToolOutput};

/// Shared services the loop needs (the dependency-injected context).
pub(crate) struct TurnDeps {
    pub config: Arc<Config>,
    pub router: Arc<ModelRouter>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<SandboxExecutor>,
    pub sessions: Arc<SessionStore>,
    pub compression: Arc<CompressionEngine>,
}

/// Per-session handles owned by the runtime and shared across turns.
pub(crate) struct SessionHandles {
    pub workspace: Arc<SessionWorkspace>,
    pub comp_store: Arc<CompressionStore>,
    pub turn_log: Arc<TurnLog>,
    /// Skills already injected this session (read-before-execute).
    pub skills_read: Mutex<HashSet<String>>,
    /// Active allowed-tools constraint from the last skill read.
    pub skill_constraint: Mutex<Option<Vec<String>>>,
    /// Next turn id to allocate (monotone within the session).
    pub next_turn: std::sync::atomic::AtomicU64,
    /// The bus of the in-flight turn; the workspace-update forwarder
    /// publishes through it.
    pub current_bus: Mutex<Option<EventBus>>,
}

pub(crate) async fn run_turn(
    deps: Arc<TurnDeps>,
    handles: Arc<SessionHandles>,
    session_id: String,
    turn_id: u64,
    user_message: Message,
    bus: EventBus,
    cancel: CancelToken,
) {
    bus.emit(EventBody::Session {
        session_id: session_id.clone(),
    });

    match run_turn_inner(&deps, &handles, &session_id, turn_id, user_message, &bus, &cancel).await
    {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(session_id = %session_id, turn_id, error = %e, "turn failed");
            bus.emit(EventBody::Error {
                kind: e.kind(),
                message: dp_domain::redact::redact(&e.to_string()),
            });
            let _ = handles.turn_log.append(&[TurnLog::turn_end(
                turn_id,
                TurnStatus::Failed,
                Usage::default(),
                0,
            )]);
        }
    }
}

async fn run_turn_inner(
    deps: &TurnDeps,
    handles: &SessionHandles,
    session_id: &str,
    turn_id: u64,
    user_message: Message,
    bus: &EventBus,
    cancel: &CancelToken,
) -> Result<(), Error> {
    // ── Phase 1: load, compress, assemble ──────────────────────────
    let meta = deps
        .sessions
        .get(session_id)
        .ok_or_else(|| Error::Validation(format!("no such session: {session_id}")))?;

    let (mut history, _) = handles.turn_log.replay_messages()?;
    let mut summary = handles.comp_store.read_summary()?;

    if deps.compression.needs_compression(&history, &summary) {
        match deps.router.resolve(Purpose::Summarization, None) {
            Ok(provider) => {
                let last_turn = handles.turn_log.last_turn_id()?;
                let outcome = deps
                    .compression
                    .compress(
                        &history,
                        &summary,
                        (1, last_turn),
                        provider.as_ref(),
                        &handles.comp_store,
                    )
                    .await?;
                if outcome.lossy {
                    bus.emit(EventBody::CompressionLossy {
                        reason: "auxiliary summarization unavailable or capped".into(),
                    });
                }
                handles.turn_log.append(&[TurnLog::compression_marker(
                    last_turn,
                    outcome.summary.len(),
                    outcome.kept.len(),
                )])?;
                summary = outcome.summary;
                history = outcome.kept;
            }
            Err(e) => {
                tracing::warn!(error = %e, "no summarizer available; skipping compression");
            }
        }
    }

    let mut messages = prompt::assemble(
        &meta,
        &deps.registry.snapshot(),
        &summary,
        history,
        Some(user_message.clone()),
    );

    handles.turn_log.append(&[
        TurnLog::turn_start(turn_id),
        TurnLog::line(turn_id, user_message),
    ])?;

    // ── Phase 2: the loop ──────────────────────────────────────────
    let mut tracker = PlanTracker::new(deps.config.runtime.max_step_attempts);
    let mut total_usage = Usage::default();
    let max_iterations = deps.config.runtime.max_iterations;

    for iteration in 0..max_iterations {
        if cancel.is_cancelled() {
            return finalize_stopped(handles, bus, turn_id, &total_usage, iteration, "stop requested");
        }
        bus.emit(EventBody::IterationStart { iteration });

        // Tool catalog, possibly constrained by an active skill.
        let constraint = handles.skill_constraint.lock().clone();
        let tool_defs = deps.registry.definitions(constraint.as_deref());

        let request = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs,
            temperature: Some(0.2),
            max_tokens: None,
            model: None,
        };

        let (_provider_id, mut stream) = deps
            .router
            .stream_chat(Purpose::General, None, &request)
            .await?;

        // ── Consume deltas ─────────────────────────────────────────
        let mut text_buf = String::new();
        let mut pending_calls: Vec<ToolCall> = Vec::new();
        // call_id → (name, args buffer), for providers that never send
        // a finished delta.
        let mut partial_calls: Vec<(String, String, String)> = Vec::new();
        let mut was_cancelled = false;

        loop {
            let delta = tokio::select! {
                delta = stream.next() => delta,
                _ = cancel.cancelled() => {
                    was_cancelled = true;
                    break;
                }
            };
            let Some(delta) = delta else { break };

            match delta? {
                StreamDelta::Text { text } => {
                    bus.emit(EventBody::Text { data: text.clone() });
                    text_buf.push_str(&text);
                }
                StreamDelta::Reasoning { text } => {
                    // Surfaced only; never fed back into the prompt.
                    bus.emit(EventBody::Reasoning { data: text });
                }
                StreamDelta::ToolCallStarted { call_id, tool_name } => {
                    partial_calls.push((call_id, tool_name, String::new()));
                }
                StreamDelta::ToolCallDelta { call_id, delta } => {
                    if let Some((_, _, buf)) =
                        partial_calls.iter_mut().find(|(id, _, _)| *id == call_id)
                    {
                        buf.push_str(&delta);
                    }
                }
                StreamDelta::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    partial_calls.retain(|(id, _, _)| *id != call_id);
                    pending_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamDelta::Finish { usage, .. } => {
                    if let Some(usage) = usage {
                        total_usage.add(&usage);
                    }
                }
            }
        }

        if was_cancelled {
            return finalize_stopped(handles, bus, turn_id, &total_usage, iteration, "stop requested");
        }

        // Assemble calls that streamed start/delta but never finished.
        for (call_id, tool_name, buf) in partial_calls.drain(..) {
            let arguments: Value = if buf.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&buf).unwrap_or_else(|e| {
                    tracing::warn!(call_id = %call_id, error = %e, "unfinished tool call had invalid JSON");
                    Value::Object(Default::default())
                })
            };
            pending_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        // ── Plan announcement ──────────────────────────────────────
        if !tracker.has_plan() && !text_buf.is_empty() {
            if let Some((raw, steps)) = plan::parse_plan(&text_buf) {
                bus.emit(tracker.install(raw, steps));
            }
        }

        // ── Final answer? ──────────────────────────────────────────
        if pending_calls.is_empty() {
            if !text_buf.is_empty() {
                handles
                    .turn_log
                    .append(&[TurnLog::line(turn_id, Message::assistant(&text_buf))])?;
            }
            return finalize_done(deps, handles, session_id, bus, turn_id, &total_usage, iteration + 1);
        }

        // ── Tool dispatch (one at a time, in call order) ───────────
        messages.push(Message::assistant_with_calls(&text_buf, &pending_calls));
        handles.turn_log.append(&[TurnLog::line(
            turn_id,
            Message::assistant_with_calls(&text_buf, &pending_calls),
        )])?;

        for call in &pending_calls {
            if cancel.is_cancelled() {
                return finalize_stopped(
                    handles,
                    bus,
                    turn_id,
                    &total_usage,
                    iteration,
                    "stop requested during tool dispatch",
                );
            }

            for event in tracker.begin_next_step().into_iter().flatten() {
                bus.emit(event);
            }

            let (result_message, success) =
                run_one_tool(deps, handles, session_id, bus, cancel, call).await?;

            // Step bookkeeping follows the tool outcome.
            if tracker.has_plan() {
                if success {
                    if let Ok(events) = tracker.transition_current(StepStatus::Done) {
                        for event in events {
                            bus.emit(event);
                        }
                    }
                } else if let Ok((_advice, events)) =
                    tracker.step_failed("tool call failed")
                {
                    for event in events {
                        bus.emit(event);
                    }
                }
            }

            messages.push(result_message.clone());
            handles
                .turn_log
                .append(&[TurnLog::line(turn_id, result_message)])?;
        }
    }

    // ── Max iterations: deterministic summary, then done ───────────
    let summary_text = max_iteration_summary(max_iterations, &tracker);
    bus.emit(EventBody::Text {
        data: summary_text.clone(),
    });
    handles
        .turn_log
        .append(&[TurnLog::line(turn_id, Message::assistant(&summary_text))])?;
    finalize_done(deps, handles, session_id, bus, turn_id, &total_usage, max_iterations)
}

/// Dispatch one tool call: validate, read-before-execute for skills,
/// execute with the per-tool timeout and the cancellation grace
/// window. Returns the tool-role message to append and whether the
/// call succeeded.
async fn run_one_tool(
    deps: &TurnDeps,
    handles: &SessionHandles,
    session_id: &str,
    bus: &EventBus,
    cancel: &CancelToken,
    call: &ToolCall,
) -> Result<(Message, bool), Error> {
    bus.emit(EventBody::ToolCall {
        name: call.tool_name.clone(),
        args: call.arguments.clone(),
        call_id: call.call_id.clone(),
    });

    // ── Skill? Inject the definition instead of dispatching ────────
    if let Some(entry) = deps.registry.get(&call.tool_name) {
        if let ToolKind::Skill { .. } = entry.kind {
            return Ok(inject_skill(deps, handles, bus, call, &entry.name));
        }
    }

    // ── Validation ─────────────────────────────────────────────────
    if let Err(e) = deps.registry.validate_args(&call.tool_name, &call.arguments) {
        let output = ToolOutput::fail(&e);
        return Ok(emit_result(bus, call, output));
    }

    // ── Dispatch under timeout + cancellation grace ────────────────
    let ctx = ToolContext {
        session_id,
        workspace: &handles.workspace,
        executor: &deps.executor,
        sessions: &deps.sessions,
        config: &deps.config,
    };
    let tool_timeout = Duration::from_secs(deps.config.runtime.tool_timeout_seconds);
    let grace = Duration::from_secs(deps.config.runtime.tool_grace_seconds);

    let dispatch = tools::dispatch(&call.tool_name, &call.arguments, &ctx);
    tokio::pin!(dispatch);

    let output = tokio::select! {
        out = tokio::time::timeout(tool_timeout, &mut dispatch) => match out {
            Ok(out) => out,
            Err(_) => ToolOutput::fail_msg(
                "resource",
                &format!("tool timed out after {}s", tool_timeout.as_secs()),
            ),
        },
        _ = cancel.cancelled() => {
            // Grace window: let the in-flight call finish so artifacts
            // survive; abandon it afterwards.
            match tokio::time::timeout(grace, &mut dispatch).await {
                Ok(out) => out,
                Err(_) => ToolOutput::fail_msg("cancelled", "tool abandoned on stop"),
            }
        }
    };

    Ok(emit_result(bus, call, output))
}

/// Read-before-execute: the skill body goes back to the model as a
/// tool-result-shaped message; subsequent calls are constrained to the
/// skill's allowed tools.
fn inject_skill(
    deps: &TurnDeps,
    handles: &SessionHandles,
    bus: &EventBus,
    call: &ToolCall,
    skill_name: &str,
) -> (Message, bool) {
    match deps.registry.skill_body(skill_name) {
        Ok(body) => {
            handles.skills_read.lock().insert(skill_name.to_string());
            *handles.skill_constraint.lock() = deps.registry.skill_allowed_tools(skill_name);

            let payload = serde_json::json!({
                "kind": "skill_definition",
                "skill": skill_name,
                "body": body,
            });
            bus.emit(EventBody::ToolResult {
                call_id: call.call_id.clone(),
                success: true,
                data: payload.clone(),
            });
            (
                Message::tool_result(&call.call_id, payload.to_string(), false),
                true,
            )
        }
        Err(e) => {
            let output = ToolOutput::fail(&e);
            emit_result(bus, call, output)
        }
    }
}

fn emit_result(bus: &EventBus, call: &ToolCall, output: ToolOutput) -> (Message, bool) {
    bus.emit(EventBody::ToolResult {
        call_id: call.call_id.clone(),
        success: output.success,
        data: output.payload.clone(),
    });
    for event in output.derived {
        bus.emit(event);
    }
    let content = output.payload.to_string();
    (
        Message::tool_result(&call.call_id, content, !output.success),
        output.success,
    )
}

fn finalize_done(
    deps: &TurnDeps,
    handles: &SessionHandles,
    session_id: &str,
    bus: &EventBus,
    turn_id: u64,
    usage: &Usage,
    iterations: u32,
) -> Result<(), Error> {
    handles.turn_log.append(&[TurnLog::turn_end(
        turn_id,
        TurnStatus::Done,
        usage.clone(),
        iterations,
    )])?;
    let _ = deps.sessions.record_usage(
        session_id,
        u64::from(usage.prompt_tokens),
        u64::from(usage.completion_tokens),
    );
    let _ = deps
        .sessions
        .update(session_id, |meta| meta.message_count += 1);
    bus.emit(EventBody::Done {
        turn_id,
        usage: usage.clone(),
    });
    Ok(())
}

fn finalize_stopped(
    handles: &SessionHandles,
    bus: &EventBus,
    turn_id: u64,
    usage: &Usage,
    iterations: u32,
    reason: &str,
) -> Result<(), Error> {
    handles.turn_log.append(&[TurnLog::turn_end(
        turn_id,
        TurnStatus::Stopped,
        usage.clone(),
        iterations,
    )])?;
    bus.emit(EventBody::Stopped {
        reason: reason.to_string(),
    });
    Ok(())
}

fn max_iteration_summary(max_iterations: u32, tracker: &PlanTracker) -> String {
    let mut text = format!(
        "I reached the {max_iterations}-iteration limit for this turn before finishing."
    );
    if let Some(plan) = tracker.plan() {
        let done = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count();
        text.push_str(&format!(
            " Progress so far: {done} of {} planned steps completed.",
            plan.steps.len()
        ));
        if let Some(index) = plan.in_progress_index() {
            text.push_str(&format!(
                " I was working on \"{}\".",
                plan.steps[index].title
            ));
        }
    }
    text.push_str(" Send a follow-up message to continue from here.");
    text
}
