use crate::agent::effects::{Effects, SpawnResult};
use crate::agent::eval::eval;
use crate::agent::form::Form;
use crate::agent::world::World;
use crate::conversation::Conversation;
use crate::prompt;
use crate::providers::ChatMessage;
use crate::tools::{self, ArgSpec, Tool, ToolRegistry};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Shared between the fork's tools: indices marked for deletion. Index 0
/// (the system message) is never deletable.
type DeleteSet = Arc<Mutex<BTreeSet<usize>>>;

/// One line per message: `#<i> [<role>] "<first 50>... ...<last 50>"`.
fn render_index(history: &[ChatMessage]) -> String {
    history
        .iter()
        .enumerate()
        .map(|(i, message)| {
            let flat = message.content.replace(['\n', '\r'], " ");
            let chars: Vec<char> = flat.chars().collect();
            let excerpt = if chars.len() <= 100 {
                flat
            } else {
                let head: String = chars[..50].iter().collect();
                let tail: String = chars[chars.len() - 50..].iter().collect();
                format!("{head}... ...{tail}")
            };
            format!("#{i} [{}] \"{excerpt}\"", message.role)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Fork tools ─────────────────────────────────────────────

struct ViewMessageTool {
    history: Vec<ChatMessage>,
}

#[async_trait]
impl Tool for ViewMessageTool {
    fn name(&self) -> &str {
        "ViewMessage"
    }

    fn description(&self) -> &str {
        "View the full content of one message by index."
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::new("index", "message index")]
    }

    async fn execute(&self, args: HashMap<String, String>) -> Result<String> {
        let raw = args.get("index").cloned().unwrap_or_default();
        let Ok(index) = raw.trim().parse::<usize>() else {
            return Ok(format!("No message at index {raw}"));
        };
        match self.history.get(index) {
            Some(message) => Ok(format!("#{index} [{}]\n{}", message.role, message.content)),
            None => Ok(format!("No message at index {index}")),
        }
    }
}

struct DeleteMessagesTool {
    history_len: usize,
    deletes: DeleteSet,
}

#[async_trait]
impl Tool for DeleteMessagesTool {
    fn name(&self) -> &str {
        "DeleteMessages"
    }

    fn description(&self) -> &str {
        "Mark messages for deletion by comma-separated indices. Message 0 cannot be deleted."
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::new("indexes", "comma-separated message indices")]
    }

    async fn execute(&self, args: HashMap<String, String>) -> Result<String> {
        let raw = args.get("indexes").cloned().unwrap_or_default();
        let accepted: Vec<usize> = raw
            .split(',')
            .filter_map(|part| part.trim().parse::<usize>().ok())
            .filter(|&i| i > 0 && i < self.history_len)
            .collect();
        if accepted.is_empty() {
            return Ok("No valid indices to delete.".to_string());
        }
        let mut deletes = self.deletes.lock().expect("delete set lock");
        deletes.extend(accepted.iter().copied());
        Ok(format!(
            "Marked {} message(s) for deletion: {}",
            accepted.len(),
            accepted
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

/// Listed so the fork's model knows how to finish; the parser intercepts
/// `CompleteTask` before it would ever execute.
struct CompleteTaskTool;

#[async_trait]
impl Tool for CompleteTaskTool {
    fn name(&self) -> &str {
        "CompleteTask"
    }

    fn description(&self) -> &str {
        "Finish pruning with a one-line summary of what was removed."
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::new("summary", "what was removed")]
    }

    async fn execute(&self, args: HashMap<String, String>) -> Result<String> {
        Ok(args.get("summary").cloned().unwrap_or_default())
    }
}

// ── Silent effects ─────────────────────────────────────────

/// Effects for the fork: no UI output, memory and refresh are no-ops,
/// reboot and nested pruning are refused. Captures the completion summary.
#[derive(Default)]
struct SilentEffects {
    summary: Mutex<Option<String>>,
}

impl SilentEffects {
    fn summary(&self) -> Option<String> {
        self.summary.lock().expect("summary lock").clone()
    }
}

#[async_trait]
impl Effects for SilentEffects {
    async fn stream_chunk(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn stream_done(&self) -> Result<()> {
        Ok(())
    }

    async fn tool_start(&self, name: &str, _preview: &str) -> Result<()> {
        tracing::debug!(tool = name, "context-prune tool");
        Ok(())
    }

    async fn tool_done(&self, _name: &str, _ok: bool, _output: &str) -> Result<()> {
        Ok(())
    }

    async fn confirm(&self, _command: &str) -> Result<bool> {
        Ok(false)
    }

    async fn ask(&self, _question: &str) -> Result<String> {
        anyhow::bail!("no user is available during context pruning")
    }

    async fn remember(&self, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn forget(&self, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn refresh_system(&self) -> Result<()> {
        Ok(())
    }

    async fn reboot(&self, _reason: &str, _conversation: &Conversation) -> Result<()> {
        anyhow::bail!("reboot is not available during context pruning")
    }

    async fn manage_context(&self, _instructions: &str) -> Result<String> {
        anyhow::bail!("nested context pruning is not available")
    }

    async fn complete(&self, summary: &str) -> Result<()> {
        *self.summary.lock().expect("summary lock") = Some(summary.to_string());
        Ok(())
    }

    async fn install_tool(&self, _source: &str) -> Result<String> {
        anyhow::bail!("tool installation is not available during context pruning")
    }

    async fn list_tools(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn spawn(&self, _task: &str) -> Result<SpawnResult> {
        anyhow::bail!("subagents are not available during context pruning")
    }
}

// ── The fork itself ────────────────────────────────────────

/// Run a nested interpreter against a forked conversation and a three-tool
/// registry, then remove whatever it marked from the outer history.
/// Cancellation does not propagate into the child; an outer abort raises
/// only after this returns.
pub async fn run_context_prune(conversation: &Conversation, instructions: &str) -> Result<String> {
    let outer_history = conversation.get_history();
    let deletes: DeleteSet = Arc::new(Mutex::new(BTreeSet::new()));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ViewMessageTool {
        history: outer_history.clone(),
    }));
    registry.register(Arc::new(DeleteMessagesTool {
        history_len: outer_history.len(),
        deletes: Arc::clone(&deletes),
    }));
    registry.register(Arc::new(CompleteTaskTool));

    let fork = Arc::new(conversation.fork(&prompt::prune_system_prompt()));
    let mut world = World::new(
        fork,
        tools::shared(registry),
        CancellationToken::new(),
        0,
    );

    let input = format!(
        "Instructions: {instructions}\n\nMessage index:\n{}",
        render_index(&outer_history)
    );

    let effects = SilentEffects::default();
    eval(Form::Think(input), &mut world, &effects).await?;

    let to_delete = deletes.lock().expect("delete set lock").clone();
    let removed = to_delete.len();
    if removed > 0 {
        let new_history: Vec<ChatMessage> = outer_history
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !to_delete.contains(i))
            .map(|(_, message)| message)
            .collect();
        conversation.set_history(new_history);
    }

    Ok(effects.summary().unwrap_or_else(|| {
        format!("Pruned {removed} message(s) from the conversation.")
    }))
}
