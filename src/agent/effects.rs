use crate::conversation::Conversation;
use anyhow::Result;
use async_trait::async_trait;

/// Outcome of a detached subagent invocation.
#[derive(Debug, Clone, Default)]
pub struct SpawnResult {
    pub success: bool,
    pub summary: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The interpreter core's only outward dependency: every side effect the
/// evaluator may perform. Implementations exist for the interactive
/// terminal, for headless JSONL runs, and (silent) for the context-prune
/// fork.
#[async_trait]
pub trait Effects: Send + Sync {
    /// Clean assistant prose, as it streams.
    async fn stream_chunk(&self, text: &str) -> Result<()>;
    async fn stream_done(&self) -> Result<()>;

    /// A complete `<tool>` block was observed mid-stream, before execution.
    async fn tool_detected(&self, _name: &str, _preview: &str) -> Result<()> {
        Ok(())
    }

    async fn tool_start(&self, name: &str, preview: &str) -> Result<()>;
    async fn tool_done(&self, name: &str, ok: bool, output: &str) -> Result<()>;

    /// Ask the user to approve a dangerous action.
    async fn confirm(&self, command: &str) -> Result<bool>;
    /// Prompt the user for free-form input.
    async fn ask(&self, question: &str) -> Result<String>;

    async fn remember(&self, content: &str) -> Result<()>;
    async fn forget(&self, content: &str) -> Result<()>;

    /// Rebuild the system prompt from the current registry + memory and
    /// install it on the conversation.
    async fn refresh_system(&self) -> Result<()>;

    /// Persist the session and exit with the restart signal. Returns only
    /// on save failure.
    async fn reboot(&self, reason: &str, conversation: &Conversation) -> Result<()>;

    /// Run the context-prune fork; returns its summary.
    async fn manage_context(&self, instructions: &str) -> Result<String>;

    async fn complete(&self, summary: &str) -> Result<()>;

    async fn install_tool(&self, source: &str) -> Result<String>;
    async fn list_tools(&self) -> Result<String>;

    async fn spawn(&self, task: &str) -> Result<SpawnResult>;
}
