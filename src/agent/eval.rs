use crate::agent::effects::Effects;
use crate::agent::form::{Form, InvokeCont, ToolCall, ToolResult};
use crate::agent::parser;
use crate::agent::stream_filter::StreamFilter;
use crate::agent::world::World;
use crate::error::AgentError;
use crate::providers::StreamEvent;
use crate::tools;
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

/// Instructions handed to the periodic context prune.
pub const PRUNE_INSTRUCTIONS: &str = "Prune old tool results and intermediate outputs. Keep the \
     current task goal, recent results, and any information the agent is actively using.";

/// The trampoline: one Form at a time, awaiting each effect, until a
/// terminal form or an error. Cancellation is checked at every entry.
pub async fn eval(form: Form, world: &mut World, effects: &dyn Effects) -> Result<()> {
    // Explicit work stack instead of native recursion; Think and Invoke
    // return their successor and loop, Seq pushes its tail.
    let mut stack: Vec<Form> = vec![form];

    while let Some(form) = stack.pop() {
        if world.cancel.is_cancelled() {
            return Err(AgentError::Aborted.into());
        }
        tracing::debug!(tag = form.tag(), "eval");

        match form {
            Form::Nil => {}
            Form::Done(summary) => {
                effects.complete(&summary).await?;
                return Ok(());
            }
            Form::Emit(text, next) => {
                effects.stream_chunk(&text).await?;
                effects.stream_done().await?;
                stack.push(*next);
            }
            Form::Remember(content, next) => {
                effects.remember(&content).await?;
                stack.push(*next);
            }
            Form::Forget(content, next) => {
                effects.forget(&content).await?;
                stack.push(*next);
            }
            Form::Confirm(command, k) => {
                let approved = effects.confirm(&command).await?;
                stack.push(k(approved));
            }
            Form::Ask(question, k) => {
                let answer = effects.ask(&question).await?;
                stack.push(k(answer));
            }
            Form::Refresh => {
                effects.refresh_system().await?;
                return Ok(());
            }
            Form::Reboot(reason) => {
                // Returns only when the session save failed; the error has
                // already been surfaced by the effect, so end the run.
                effects.reboot(&reason, &world.conversation).await?;
                return Ok(());
            }
            Form::Seq(forms) => {
                for form in forms.into_iter().rev() {
                    stack.push(form);
                }
            }
            Form::Think(input) => {
                let next = think(input, world, effects).await?;
                stack.push(next);
            }
            Form::Invoke(calls, k) => {
                let next = invoke(calls, k, world, effects).await?;
                stack.push(next);
            }
            Form::Install(source) => {
                let report = effects.install_tool(&source).await?;
                effects.stream_chunk(&report).await?;
                effects.stream_done().await?;
                return Ok(());
            }
            Form::ListTools => {
                let listing = effects.list_tools().await?;
                effects.stream_chunk(&listing).await?;
                effects.stream_done().await?;
                return Ok(());
            }
            Form::Spawn(task, k) => {
                let result = effects.spawn(&task).await?;
                stack.push(k(result));
            }
        }
    }

    Ok(())
}

/// A closed tool block means the model is done deciding; anything after it
/// is epilogue not worth the tokens.
fn has_complete_tool_block(text: &str) -> bool {
    (text.contains("<tools>") && text.contains("</tools>"))
        || (text.contains(parser::SECTION_BEGIN) && text.contains(parser::SECTION_END))
}

/// Think step: stream the reply, filter markup to the UI, break early once
/// a complete tool block is present, and parse the accumulated text into
/// the next Form.
async fn think(input: String, world: &World, effects: &dyn Effects) -> Result<Form> {
    let mut filter = StreamFilter::new();
    let mut accumulated = String::new();
    let mut stream = world.conversation.stream(&input);
    let mut hook_ran = false;

    loop {
        // The stream is consumed manually so it can be abandoned without
        // awaiting teardown; each recv races the cancellation token.
        tokio::select! {
            biased;
            _ = world.cancel.cancelled() => {
                stream.abort();
                if !accumulated.is_empty() {
                    world.conversation.push_assistant(&accumulated);
                }
                return Err(AgentError::Aborted.into());
            }
            event = stream.recv() => match event {
                Some(StreamEvent::Delta(chunk)) => {
                    let out = filter.push(&chunk);
                    if !out.clean.is_empty() {
                        effects.stream_chunk(&out.clean).await?;
                    }
                    for tool in out.tools {
                        effects.tool_detected(&tool.name, &tool.preview).await?;
                    }
                    accumulated.push_str(&chunk);
                    if has_complete_tool_block(&accumulated) {
                        stream.abort();
                        break;
                    }
                }
                Some(StreamEvent::Done(_)) => {
                    hook_ran = true;
                    break;
                }
                Some(StreamEvent::Error(message)) => {
                    return Err(AgentError::Provider(message).into());
                }
                None => break,
            }
        }
    }

    // On early termination the conversation's end-of-stream hook never ran,
    // so the assistant message is appended manually.
    if !hook_ran {
        world.conversation.push_assistant(&accumulated);
    }

    let tail = filter.flush();
    if !tail.is_empty() {
        effects.stream_chunk(&tail).await?;
    }
    effects.stream_done().await?;

    Ok(parser::parse_to_form(&accumulated))
}

fn danger_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"\brm\b", r"\brmdir\b", r"\brm\s+-rf?\b", r"\brm\s+-fr?\b"]
            .iter()
            .map(|p| Regex::new(p).expect("danger pattern"))
            .collect()
    })
}

/// First gate: built-in destructive-command patterns for `Bash`.
fn builtin_danger(call: &ToolCall) -> Option<String> {
    if call.name != "Bash" {
        return None;
    }
    let command = call.raw_args.first()?;
    danger_patterns()
        .iter()
        .any(|p| p.is_match(command))
        .then(|| format!("Run shell command: {command}"))
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}...")
    }
}

fn call_preview(call: &ToolCall) -> String {
    call.raw_args
        .iter()
        .take(3)
        .map(|arg| truncate_chars(arg, 40))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A failed tool's feedback: the message plus a short cause excerpt.
fn failure_output(err: &anyhow::Error) -> String {
    let mut lines = vec![err.to_string()];
    for cause in err.chain().skip(1).take(3) {
        lines.push(format!("  caused by: {cause}"));
    }
    lines.join("\n")
}

/// Invoke step: run one tool batch in order, confirmation-gated, capturing
/// every failure into a result, then hand the results to the continuation.
async fn invoke(
    calls: Vec<ToolCall>,
    k: InvokeCont,
    world: &mut World,
    effects: &dyn Effects,
) -> Result<Form> {
    let registry = tools::snapshot(&world.registry);
    let mut results: Vec<ToolResult> = Vec::with_capacity(calls.len());

    for call in &calls {
        if world.cancel.is_cancelled() {
            return Err(AgentError::Aborted.into());
        }

        // AskUser and ManageContext never reach the registry.
        if call.name == "AskUser" {
            let question = call.raw_args.first().cloned().unwrap_or_default();
            effects.tool_start(&call.name, &call_preview(call)).await?;
            let answer = effects.ask(&question).await?;
            results.push(ToolResult {
                name: call.name.clone(),
                output: format!("User answered: {answer}"),
                success: true,
            });
            effects.tool_done(&call.name, true, "ok").await?;
            continue;
        }
        if call.name == "ManageContext" {
            let instructions = call.raw_args.first().cloned().unwrap_or_default();
            effects.tool_start(&call.name, &call_preview(call)).await?;
            match effects.manage_context(&instructions).await {
                Ok(summary) => {
                    results.push(ToolResult {
                        name: call.name.clone(),
                        output: summary,
                        success: true,
                    });
                    effects.tool_done(&call.name, true, "ok").await?;
                }
                Err(e) => {
                    results.push(ToolResult {
                        name: call.name.clone(),
                        output: failure_output(&e),
                        success: false,
                    });
                    effects.tool_done(&call.name, false, &e.to_string()).await?;
                }
            }
            continue;
        }

        let Some(tool) = registry.get(&call.name) else {
            let message = format!("Unknown tool: {}", call.name);
            results.push(ToolResult {
                name: call.name.clone(),
                output: message.clone(),
                success: false,
            });
            effects.tool_done(&call.name, false, &message).await?;
            continue;
        };

        let args = tools::zip_args(tool.as_ref(), &call.raw_args);

        let danger = builtin_danger(call).or_else(|| tool.ask_permission(&args));
        if let Some(description) = danger {
            if !effects.confirm(&description).await? {
                results.push(ToolResult {
                    name: call.name.clone(),
                    output: "User denied execution".to_string(),
                    success: false,
                });
                effects.tool_done(&call.name, false, "denied by user").await?;
                continue;
            }
        }

        effects.tool_start(&call.name, &call_preview(call)).await?;
        match tool.execute(args).await {
            Ok(output) => {
                results.push(ToolResult {
                    name: call.name.clone(),
                    output,
                    success: true,
                });
                effects.tool_done(&call.name, true, "ok").await?;
            }
            Err(e) => {
                results.push(ToolResult {
                    name: call.name.clone(),
                    output: failure_output(&e),
                    success: false,
                });
                effects.tool_done(&call.name, false, &e.to_string()).await?;
            }
        }
    }

    // Reload swapped part of the registry; the model must see the new list.
    if calls.iter().any(|c| c.name == "Reload") {
        effects.refresh_system().await?;
    }

    world.tool_calls += calls.len();
    if world.prune_threshold > 0 && world.tool_calls >= world.prune_threshold {
        world.tool_calls = 0;
        effects
            .tool_start("ManageContext", "periodic context prune")
            .await?;
        match effects.manage_context(PRUNE_INSTRUCTIONS).await {
            Ok(summary) => effects.tool_done("ManageContext", true, &summary).await?,
            Err(e) => {
                effects
                    .tool_done("ManageContext", false, &e.to_string())
                    .await?
            }
        }
    }

    Ok(k(results))
}
