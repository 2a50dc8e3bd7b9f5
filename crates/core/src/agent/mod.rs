pub mod transcript;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use restitch_config::Config;
use restitch_provider::{
    looks_like_capability_mismatch, ContentPart, GenerateRequest, Generation, Message,
    MessageContent, Provider, ProviderError, Role,
};

use crate::guard::Guard;
use crate::prompt;
use crate::repo::RepoController;
use crate::runner::{FailingTest, TestRunner};
use crate::state::RunState;
use crate::telemetry::{EventKind, EventLog, RunPaths};
use crate::tools::{self, ToolCtx, ToolName};

const STUCK_SKIP_LIMIT: u32 = 3;
const TURN_MAX_TOKENS: u32 = 8_192;
const RETRY_BACKOFF_MS: u64 = 1_500;

/// How the loop ended. Infrastructure failures (sandbox required but
/// unavailable, model gone with no fallback) propagate as errors instead.
#[derive(Debug)]
pub enum LoopEnd {
    /// A test run reported zero failures.
    Green { summary: Option<String> },
    /// Repetition guard tripped: the agent is no longer making progress.
    Stuck(String),
    /// Iteration, tool-call, or wall-clock budget exhausted.
    Budget(String),
    /// Cooperative cancellation observed.
    Interrupted,
}

#[derive(Debug, Default)]
pub struct LoopStats {
    pub iterations: u32,
    pub tool_calls: u32,
    pub modifications: u64,
    pub applied_commits: Vec<String>,
}

pub struct LoopDeps<'a> {
    pub controller: &'a RepoController,
    pub guard: &'a Guard,
    pub runner: &'a TestRunner,
    pub run_paths: &'a RunPaths,
    pub config: &'a Config,
    pub cancel: &'a CancellationToken,
}

enum Protocol {
    ToolCalls,
    Transcript,
}

enum CallError {
    Capability(String),
    Cancelled,
    Fatal(anyhow::Error),
}

/// Drive the model through the bounded repair cycle. `fallback` is consumed
/// at most once, on a mid-run capability mismatch.
pub async fn run_loop(
    mut provider: Box<dyn Provider>,
    mut fallback: Option<Box<dyn Provider>>,
    deps: &LoopDeps<'_>,
    log: &mut EventLog,
) -> Result<(LoopEnd, LoopStats)> {
    let config = deps.config;
    let mut state = RunState::new(&config.limits);
    let mut failing: Vec<FailingTest> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();
    let temperature = config.model.effective_temperature();
    let repo_display = deps.controller.root().display().to_string();

    // The loop always begins with run_tests to materialize the failing set.
    {
        let ctx = tool_ctx(deps, provider.as_ref());
        let outcome =
            tools::dispatch(ToolName::RunTests, "", &mut state, &failing, &ctx, log).await?;
        let Some(result) = outcome.test_result else {
            anyhow::bail!("initial test run produced no result");
        };
        if result.is_green() {
            tracing::info!("test suite already green, nothing to repair");
            return Ok((LoopEnd::Green { summary: None }, stats(&state)));
        }
        failing = result.failing.clone();
        messages.push(Message::user(prompt::initial_user_message(
            &result,
            &outcome.observation,
        )));
    }

    let mut consecutive_skips: u32 = 0;
    let mut must_run_tests = false;

    while state.iteration < state.max_iterations {
        state.iteration += 1;
        log.record(
            EventKind::IterationStart,
            json!({"iteration": state.iteration}),
        );

        if deps.cancel.is_cancelled() {
            return Ok((LoopEnd::Interrupted, stats(&state)));
        }
        if state.deadline_exceeded() {
            return Ok((
                LoopEnd::Budget("global deadline exceeded".into()),
                stats(&state),
            ));
        }
        if state.tool_calls_exhausted() {
            return Ok((
                LoopEnd::Budget("tool call budget exhausted".into()),
                stats(&state),
            ));
        }

        // Capability is re-read each turn; a fallback swap may change it.
        let generation = loop {
            let protocol = protocol_for(provider.as_ref());
            let request = build_request(provider.as_ref(), &messages, &protocol, temperature, &repo_display);
            match call_model(provider.as_ref(), &request, deps.cancel).await {
                Ok(generation) => break generation,
                Err(CallError::Capability(reason)) => match fallback.take() {
                    Some(next) => {
                        tracing::warn!(
                            from = %provider.capabilities().model_id,
                            to = %next.capabilities().model_id,
                            %reason,
                            "capability mismatch, swapping to fallback model"
                        );
                        log.record(
                            EventKind::ModelFallback,
                            json!({
                                "from": provider.capabilities().model_id,
                                "to": next.capabilities().model_id,
                                "reason": reason,
                            }),
                        );
                        provider = next;
                    }
                    None => {
                        anyhow::bail!(
                            "model capability mismatch with no usable fallback: {reason}"
                        );
                    }
                },
                Err(CallError::Cancelled) => {
                    return Ok((LoopEnd::Interrupted, stats(&state)));
                }
                Err(CallError::Fatal(e)) => return Err(e),
            }
        };

        let actions = match protocol_for(provider.as_ref()) {
            Protocol::ToolCalls => {
                if generation.has_tool_calls() {
                    let tool_uses: Vec<ContentPart> = generation
                        .tool_calls
                        .iter()
                        .map(|tc| ContentPart::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input: tc.arguments.clone(),
                        })
                        .collect();
                    messages.push(Message {
                        role: Role::Assistant,
                        content: MessageContent::Parts(tool_uses),
                    });
                    generation
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            (
                                Some(tc.id.clone()),
                                tc.name.clone(),
                                tool_argument(&tc.name, &tc.arguments),
                            )
                        })
                        .collect()
                } else {
                    // Text without tool calls is an attempt to finish.
                    messages.push(Message::assistant(generation.text.clone()));
                    messages.push(Message::user(
                        "The test suite is still failing. You may only finish after a \
                         test run reports zero failures; continue with tool calls."
                            .to_string(),
                    ));
                    continue;
                }
            }
            Protocol::Transcript => {
                let retained = transcript::retained_text(&generation.text);
                messages.push(Message::assistant(retained.clone()));
                match transcript::parse_turn(&generation.text) {
                    transcript::TranscriptTurn::Final(_) => {
                        messages.push(Message::user(
                            "Observation: ERROR: the test suite is still failing; you may \
                             only give a Final Answer after a test run reports zero \
                             failures."
                                .to_string(),
                        ));
                        continue;
                    }
                    transcript::TranscriptTurn::Unparseable => {
                        messages.push(Message::user(
                            "Observation: ERROR: expected `Action:` and `Action Input:` \
                             lines; emit exactly one action."
                                .to_string(),
                        ));
                        continue;
                    }
                    transcript::TranscriptTurn::Action(action) => {
                        vec![(None, action.name, action.input)]
                    }
                }
            }
        };

        let mut results: Vec<(Option<String>, String)> = Vec::new();
        let mut ended: Option<LoopEnd> = None;

        for (call_id, name_raw, argument) in actions {
            if deps.cancel.is_cancelled() {
                ended = Some(LoopEnd::Interrupted);
                break;
            }

            let Some(name) = ToolName::parse(&name_raw) else {
                results.push((
                    call_id,
                    format!("ERROR: unknown tool `{name_raw}`"),
                ));
                continue;
            };

            if must_run_tests && name != ToolName::RunTests {
                results.push((
                    call_id,
                    "ERROR: a patch was just applied; run_tests must come next".to_string(),
                ));
                continue;
            }

            if state.tool_calls_exhausted() {
                ended = Some(LoopEnd::Budget("tool call budget exhausted".into()));
                break;
            }

            let outcome = {
                let ctx = tool_ctx(deps, provider.as_ref());
                tools::dispatch(name, &argument, &mut state, &failing, &ctx, log).await?
            };

            if outcome.observation.starts_with("SKIP") {
                consecutive_skips += 1;
            } else {
                consecutive_skips = 0;
            }
            if outcome.applied_patch {
                must_run_tests = true;
            }
            if name == ToolName::RunTests && outcome.test_result.is_some() {
                must_run_tests = false;
            }
            if let Some(result) = &outcome.test_result {
                failing = result.failing.clone();
                if result.is_green() {
                    ended = Some(LoopEnd::Green { summary: None });
                }
                if result.timed_out() && state.deadline_exceeded() {
                    // The global deadline dominates a test timeout.
                    ended = Some(LoopEnd::Budget("global deadline exceeded".into()));
                }
            }

            results.push((call_id, outcome.observation));

            if consecutive_skips >= STUCK_SKIP_LIMIT {
                ended = Some(LoopEnd::Stuck(format!(
                    "{STUCK_SKIP_LIMIT} consecutive no-op actions"
                )));
            }
            if ended.is_some() {
                break;
            }
        }

        push_results(&mut messages, protocol_for(provider.as_ref()), results);

        if let Some(end) = ended {
            return Ok((end, stats(&state)));
        }
    }

    Ok((
        LoopEnd::Budget(format!(
            "iteration cap of {} reached with tests still failing",
            state.max_iterations
        )),
        stats(&state),
    ))
}

fn stats(state: &RunState) -> LoopStats {
    LoopStats {
        iterations: state.iteration,
        tool_calls: state.tool_calls,
        modifications: state.modifications_count,
        applied_commits: state.applied_commits.clone(),
    }
}

fn tool_ctx<'a>(deps: &'a LoopDeps<'a>, provider: &'a dyn Provider) -> ToolCtx<'a> {
    ToolCtx {
        controller: deps.controller,
        guard: deps.guard,
        runner: deps.runner,
        provider,
        run_paths: deps.run_paths,
        settings: &deps.config.tools,
        cancel: deps.cancel,
    }
}

fn protocol_for(provider: &dyn Provider) -> Protocol {
    if provider.capabilities().supports_tool_calls {
        Protocol::ToolCalls
    } else {
        Protocol::Transcript
    }
}

fn build_request(
    provider: &dyn Provider,
    messages: &[Message],
    protocol: &Protocol,
    temperature: f32,
    repo_display: &str,
) -> GenerateRequest {
    let (system, tools, stop) = match protocol {
        Protocol::ToolCalls => (
            prompt::system_prompt_tools(repo_display),
            tools::definitions(),
            None,
        ),
        Protocol::Transcript => (
            prompt::system_prompt_transcript(repo_display),
            Vec::new(),
            Some(vec!["Observation:".to_string()]),
        ),
    };
    GenerateRequest {
        model: provider.capabilities().model_id.clone(),
        messages: messages.to_vec(),
        system: Some(system),
        tools,
        stop,
        temperature,
        max_tokens: Some(provider.capabilities().max_tokens.min(TURN_MAX_TOKENS)),
    }
}

/// Flatten a structured tool-call argument into the dispatcher's string
/// form.
fn tool_argument(name: &str, arguments: &serde_json::Value) -> String {
    match ToolName::parse(name) {
        Some(ToolName::ReadFile) => arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        Some(ToolName::ApplyPatch) | Some(ToolName::CriticReview) => arguments
            .get("patch")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        Some(ToolName::RunTests) => arguments
            .get("selectors")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        Some(ToolName::PlanTodo) => arguments
            .get("plan")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        // write_file keeps its structured JSON argument.
        _ => arguments.to_string(),
    }
}

fn push_results(
    messages: &mut Vec<Message>,
    protocol: Protocol,
    results: Vec<(Option<String>, String)>,
) {
    if results.is_empty() {
        return;
    }
    match protocol {
        Protocol::ToolCalls => {
            let parts: Vec<ContentPart> = results
                .into_iter()
                .map(|(call_id, content)| ContentPart::ToolResult {
                    tool_use_id: call_id.unwrap_or_default(),
                    content,
                })
                .collect();
            messages.push(Message {
                role: Role::User,
                content: MessageContent::Parts(parts),
            });
        }
        Protocol::Transcript => {
            for (_, content) in results {
                messages.push(Message::user(format!("Observation: {content}")));
            }
        }
    }
}


/// One model call with a single retry for transient failures. Capability
/// mismatches are surfaced for the provider-fallback path.
async fn call_model(
    provider: &dyn Provider,
    request: &GenerateRequest,
    cancel: &CancellationToken,
) -> Result<Generation, CallError> {
    let mut retried = false;
    loop {
        let attempt = tokio::select! {
            result = provider.generate(request) => result,
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
        };
        match attempt {
            Ok(generation) => return Ok(generation),
            Err(e) => {
                if let Some(pe) = e.downcast_ref::<ProviderError>() {
                    if pe.is_capability_mismatch() {
                        return Err(CallError::Capability(pe.to_string()));
                    }
                    if pe.is_retryable() && !retried {
                        let wait = pe.retry_after_ms().unwrap_or(RETRY_BACKOFF_MS);
                        tracing::warn!(error = %pe, wait_ms = wait, "model call failed, retrying once");
                        retried = true;
                        tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
                        continue;
                    }
                } else if looks_like_capability_mismatch(&format!("{e:#}")) {
                    return Err(CallError::Capability(format!("{e:#}")));
                } else if !retried {
                    retried = true;
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_BACKOFF_MS)).await;
                    continue;
                }
                return Err(CallError::Fatal(e));
            }
        }
    }
}
