use crate::agent::effects::{Effects, SpawnResult};
use crate::agent::prune;
use crate::conversation::Conversation;
use crate::events::{AgentEvent, EventWriter};
use crate::memory::MemoryStore;
use crate::prompt;
use crate::session;
use crate::spawn;
use crate::tools::{self, manifest, SharedRegistry};
use anyhow::Result;
use async_trait::async_trait;
use console::style;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Shared wiring both effects implementations delegate to: the conversation,
/// registry, memory store, and workspace paths of one agent process.
#[derive(Clone)]
pub struct AgentHandles {
    pub conversation: Arc<Conversation>,
    pub registry: SharedRegistry,
    pub memory: Arc<MemoryStore>,
    pub workspace: PathBuf,
    pub tools_dir: PathBuf,
    pub model: String,
    pub provider: String,
}

impl AgentHandles {
    /// Rebuild the system prompt from the live registry + memory and
    /// install it on the conversation.
    pub fn refresh_system(&self) {
        let registry = tools::snapshot(&self.registry);
        let memory = self.memory.entries();
        let system = prompt::build_system_prompt(&registry, &memory, &self.model);
        self.conversation.set_system(&system);
        tracing::debug!(tools = registry.len(), "system prompt refreshed");
    }

    /// Persist the session, then exit with the restart signal. Returns only
    /// when the save failed.
    fn reboot(&self, reason: &str) -> Result<()> {
        session::save(&self.workspace, self.conversation.get_history(), reason)?;
        tracing::info!(reason, "rebooting");
        std::process::exit(session::REBOOT_EXIT_CODE);
    }

    async fn manage_context(&self, instructions: &str) -> Result<String> {
        prune::run_context_prune(&self.conversation, instructions).await
    }

    fn install_tool(&self, source: &str) -> Result<String> {
        let report = manifest::install(&self.tools_dir, source)?;
        let loaded = manifest::load_dir(&self.tools_dir, &self.workspace)?;
        self.registry
            .write()
            .expect("registry lock")
            .swap_dynamic(loaded);
        self.refresh_system();
        Ok(report)
    }

    fn list_tools(&self) -> String {
        prompt::render_tool_list(&tools::snapshot(&self.registry))
    }

    async fn spawn(&self, task: &str) -> Result<SpawnResult> {
        spawn::run_subagent(task, &self.model, &self.provider).await
    }
}

// ── Interactive terminal ───────────────────────────────────

pub struct CliEffects {
    handles: AgentHandles,
    running: Mutex<Vec<String>>,
}

impl CliEffects {
    pub fn new(handles: AgentHandles) -> Self {
        Self {
            handles,
            running: Mutex::new(Vec::new()),
        }
    }

    /// Aborted run: mark still-running tools as interrupted and close the
    /// assistant turn visibly.
    pub fn abort_cleanup(&self) {
        let mut running = self.running.lock().expect("running lock");
        for name in running.drain(..) {
            eprintln!("{} {name}: interrupted", style("✗").red());
        }
        println!("\n[Interrupted]");
    }
}

#[async_trait]
impl Effects for CliEffects {
    async fn stream_chunk(&self, text: &str) -> Result<()> {
        print!("{text}");
        std::io::stdout().flush().ok();
        Ok(())
    }

    async fn stream_done(&self) -> Result<()> {
        println!();
        Ok(())
    }

    async fn tool_detected(&self, name: &str, preview: &str) -> Result<()> {
        eprintln!("{}", style(format!("· {name}({preview})")).dim());
        Ok(())
    }

    async fn tool_start(&self, name: &str, preview: &str) -> Result<()> {
        self.running
            .lock()
            .expect("running lock")
            .push(name.to_string());
        eprintln!("{} {name}({preview})", style("▶").cyan());
        Ok(())
    }

    async fn tool_done(&self, name: &str, ok: bool, output: &str) -> Result<()> {
        self.running
            .lock()
            .expect("running lock")
            .retain(|n| n != name);
        if ok {
            eprintln!("{} {name}", style("✓").green());
        } else {
            eprintln!("{} {name}: {output}", style("✗").red());
        }
        Ok(())
    }

    async fn confirm(&self, command: &str) -> Result<bool> {
        let prompt_text = format!("Allow? {command}");
        let approved = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt_text)
                .default(false)
                .interact()
        })
        .await??;
        Ok(approved)
    }

    async fn ask(&self, question: &str) -> Result<String> {
        let prompt_text = question.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Input::<String>::new()
                .with_prompt(prompt_text)
                .allow_empty(true)
                .interact_text()
        })
        .await??;
        Ok(answer)
    }

    async fn remember(&self, content: &str) -> Result<()> {
        self.handles.memory.remember(content)?;
        eprintln!("{}", style(format!("· remembered: {content}")).dim());
        Ok(())
    }

    async fn forget(&self, content: &str) -> Result<()> {
        self.handles.memory.forget(content)?;
        eprintln!("{}", style(format!("· forgot: {content}")).dim());
        Ok(())
    }

    async fn refresh_system(&self) -> Result<()> {
        self.handles.refresh_system();
        Ok(())
    }

    async fn reboot(&self, reason: &str, _conversation: &Conversation) -> Result<()> {
        self.handles.reboot(reason)
    }

    async fn manage_context(&self, instructions: &str) -> Result<String> {
        self.handles.manage_context(instructions).await
    }

    async fn complete(&self, summary: &str) -> Result<()> {
        println!("{} {summary}", style("✔").green().bold());
        Ok(())
    }

    async fn install_tool(&self, source: &str) -> Result<String> {
        self.handles.install_tool(source)
    }

    async fn list_tools(&self) -> Result<String> {
        Ok(self.handles.list_tools())
    }

    async fn spawn(&self, task: &str) -> Result<SpawnResult> {
        eprintln!("{} subagent: {task}", style("▶").cyan());
        self.handles.spawn(task).await
    }
}

// ── Headless (JSONL event stream) ──────────────────────────

pub struct HeadlessEffects {
    handles: AgentHandles,
    events: EventWriter,
    assistant_buf: Mutex<String>,
}

impl HeadlessEffects {
    pub fn new(handles: AgentHandles, events: EventWriter) -> Self {
        Self {
            handles,
            events,
            assistant_buf: Mutex::new(String::new()),
        }
    }

    pub fn emit_start(&self) {
        self.events.write(AgentEvent::Start {
            model: self.handles.model.clone(),
            provider: self.handles.provider.clone(),
        });
    }

    pub fn emit_error(&self, message: &str) {
        self.events.write(AgentEvent::Error {
            message: message.to_string(),
        });
    }

    pub fn emit_usage(&self) {
        self.events.write(AgentEvent::Usage {
            usage: self.handles.conversation.usage(),
        });
    }
}

#[async_trait]
impl Effects for HeadlessEffects {
    async fn stream_chunk(&self, text: &str) -> Result<()> {
        self.assistant_buf
            .lock()
            .expect("assistant buffer lock")
            .push_str(text);
        Ok(())
    }

    async fn stream_done(&self) -> Result<()> {
        let text = std::mem::take(&mut *self.assistant_buf.lock().expect("assistant buffer lock"));
        if !text.trim().is_empty() {
            self.events.write(AgentEvent::Assistant { text });
        }
        Ok(())
    }

    async fn tool_start(&self, name: &str, preview: &str) -> Result<()> {
        self.events.write(AgentEvent::ToolStart {
            name: name.to_string(),
            preview: preview.to_string(),
        });
        Ok(())
    }

    async fn tool_done(&self, name: &str, ok: bool, output: &str) -> Result<()> {
        self.events.write(AgentEvent::ToolDone {
            name: name.to_string(),
            ok,
            output: output.to_string(),
        });
        Ok(())
    }

    // A headless run has no user; dangerous calls are allowed through and
    // recorded in the event stream like any other.
    async fn confirm(&self, command: &str) -> Result<bool> {
        tracing::info!(command, "headless confirm auto-approved");
        Ok(true)
    }

    async fn ask(&self, question: &str) -> Result<String> {
        tracing::warn!(question, "AskUser in a headless run");
        Ok("[no user is attached to this session]".to_string())
    }

    async fn remember(&self, content: &str) -> Result<()> {
        self.handles.memory.remember(content)?;
        self.events.write(AgentEvent::Remember {
            content: content.to_string(),
        });
        Ok(())
    }

    async fn forget(&self, content: &str) -> Result<()> {
        self.handles.memory.forget(content)?;
        self.events.write(AgentEvent::Forget {
            content: content.to_string(),
        });
        Ok(())
    }

    async fn refresh_system(&self) -> Result<()> {
        self.handles.refresh_system();
        self.events.write(AgentEvent::RefreshSystem);
        Ok(())
    }

    async fn reboot(&self, reason: &str, _conversation: &Conversation) -> Result<()> {
        self.events.write(AgentEvent::Reboot {
            reason: reason.to_string(),
        });
        self.handles.reboot(reason)
    }

    async fn manage_context(&self, instructions: &str) -> Result<String> {
        self.handles.manage_context(instructions).await
    }

    async fn complete(&self, summary: &str) -> Result<()> {
        self.events.write(AgentEvent::Complete {
            summary: summary.to_string(),
            usage: self.handles.conversation.usage(),
        });
        Ok(())
    }

    async fn install_tool(&self, source: &str) -> Result<String> {
        self.handles.install_tool(source)
    }

    async fn list_tools(&self) -> Result<String> {
        Ok(self.handles.list_tools())
    }

    async fn spawn(&self, task: &str) -> Result<SpawnResult> {
        self.handles.spawn(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::MockProvider;
    use crate::tools::ToolRegistry;
    use tempfile::TempDir;

    fn handles(tmp: &TempDir) -> AgentHandles {
        let conversation = Arc::new(Conversation::new(
            Arc::new(MockProvider::new(&[])),
            "test-model",
        ));
        AgentHandles {
            conversation,
            registry: tools::shared(ToolRegistry::new()),
            memory: Arc::new(MemoryStore::new(tmp.path().join("memory.txt"))),
            workspace: tmp.path().to_path_buf(),
            tools_dir: tmp.path().join("tools"),
            model: "test-model".into(),
            provider: "mock".into(),
        }
    }

    #[tokio::test]
    async fn headless_buffers_assistant_text_per_turn() {
        let tmp = TempDir::new().unwrap();
        let events_path = tmp.path().join("events.jsonl");
        let effects = HeadlessEffects::new(handles(&tmp), EventWriter::create(&events_path).unwrap());

        effects.emit_start();
        effects.stream_chunk("Hello, ").await.unwrap();
        effects.stream_chunk("world!").await.unwrap();
        effects.stream_done().await.unwrap();
        effects.stream_done().await.unwrap(); // empty turn writes nothing
        effects.complete("all done").await.unwrap();

        let text = std::fs::read_to_string(&events_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"type\":\"start\""));
        assert!(lines[1].contains("\"type\":\"assistant\""));
        assert!(lines[1].contains("Hello, world!"));
        assert!(lines[2].contains("\"type\":\"complete\""));
        assert!(lines[2].contains("all done"));
    }

    #[tokio::test]
    async fn headless_memory_ops_hit_store_and_stream() {
        let tmp = TempDir::new().unwrap();
        let events_path = tmp.path().join("events.jsonl");
        let handles = handles(&tmp);
        let memory = Arc::clone(&handles.memory);
        let effects = HeadlessEffects::new(handles, EventWriter::create(&events_path).unwrap());

        effects.remember("fact one").await.unwrap();
        effects.forget("fact one").await.unwrap();

        assert!(memory.entries().is_empty());
        let text = std::fs::read_to_string(&events_path).unwrap();
        assert!(text.contains("\"type\":\"remember\""));
        assert!(text.contains("\"type\":\"forget\""));
    }

    #[tokio::test]
    async fn install_registers_dynamic_tool() {
        let tmp = TempDir::new().unwrap();
        let handles = handles(&tmp);
        let report = handles
            .install_tool(
                "name = \"Greet\"\ndescription = \"hi\"\ncommand = \"echo hi\"\n",
            )
            .unwrap();
        assert!(report.contains("Installed tool Greet"));
        assert!(tools::snapshot(&handles.registry).get("Greet").is_some());
        // The refreshed system prompt now lists the new tool.
        let history = handles.conversation.get_history();
        assert!(history[0].content.contains("Greet"));
    }

    #[test]
    fn refresh_installs_system_prompt_with_memory() {
        let tmp = TempDir::new().unwrap();
        let handles = handles(&tmp);
        handles.memory.remember("user likes tea").unwrap();
        handles.refresh_system();

        let history = handles.conversation.get_history();
        assert_eq!(history[0].role, "system");
        assert!(history[0].content.contains("user likes tea"));
    }
}
