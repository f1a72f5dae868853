pub mod effects;
pub mod eval;
pub mod form;
pub mod parser;
pub mod prune;
pub mod stream_filter;
pub mod world;

use form::Form;

/// Route one top-level user input. Slash commands hit the dev surface;
/// everything else becomes a model turn.
pub fn route_input(line: &str) -> Form {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Form::Think(trimmed.to_string());
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let argument = parts.next().unwrap_or("").trim();

    match command {
        "install" => {
            if argument.is_empty() {
                Form::Emit(
                    "Usage: /install <manifest path or inline TOML>".to_string(),
                    Box::new(Form::Nil),
                )
            } else {
                Form::Install(argument.to_string())
            }
        }
        "tools" => Form::ListTools,
        _ => Form::Emit(
            format!("Unknown command: /{command}"),
            Box::new(Form::Nil),
        ),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::agent::effects::{Effects, SpawnResult};
    use crate::conversation::Conversation;
    use crate::events::Usage;
    use crate::providers::{ChatMessage, ChatResponse, Provider, StreamEvent};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Scripted provider: pops one canned reply per turn and streams it in
    /// small chunks so tag boundaries land mid-chunk.
    pub struct MockProvider {
        responses: Mutex<VecDeque<String>>,
    }

    impl MockProvider {
        pub fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            }
        }

        fn next_response(&self) -> String {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _model: &str,
            _routing: Option<&str>,
        ) -> Result<ChatResponse> {
            Ok(ChatResponse {
                text: self.next_response(),
                usage: None,
            })
        }

        async fn chat_streaming(
            &self,
            _messages: &[ChatMessage],
            _model: &str,
            _routing: Option<&str>,
            tx: &mpsc::Sender<StreamEvent>,
        ) -> Result<ChatResponse> {
            let text = self.next_response();
            let chars: Vec<char> = text.chars().collect();
            for chunk in chars.chunks(7) {
                let piece: String = chunk.iter().collect();
                if tx.send(StreamEvent::Delta(piece)).await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            Ok(ChatResponse {
                text,
                usage: Some(Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                }),
            })
        }
    }

    /// Everything the evaluator did, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Ev {
        StreamChunk(String),
        StreamDone,
        ToolDetected(String),
        ToolStart(String),
        ToolDone(String, bool),
        Confirm(String),
        Ask(String),
        Remember(String),
        Forget(String),
        RefreshSystem,
        Reboot(String),
        ManageContext(String),
        Complete(String),
        Spawn(String),
    }

    #[derive(Default)]
    pub struct RecordingEffects {
        pub events: Mutex<Vec<Ev>>,
        pub confirm_reply: Mutex<bool>,
        pub ask_reply: Mutex<String>,
    }

    impl RecordingEffects {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                confirm_reply: Mutex::new(true),
                ask_reply: Mutex::new("forty-two".to_string()),
            }
        }

        fn record(&self, event: Ev) {
            self.events.lock().unwrap().push(event);
        }

        pub fn events(&self) -> Vec<Ev> {
            self.events.lock().unwrap().clone()
        }

        /// The recorded sequence minus stream chunks and early detections,
        /// which are incidental to ordering assertions.
        pub fn control_events(&self) -> Vec<Ev> {
            self.events()
                .into_iter()
                .filter(|e| !matches!(e, Ev::StreamChunk(_) | Ev::ToolDetected(_)))
                .collect()
        }

        pub fn streamed_text(&self) -> String {
            self.events()
                .iter()
                .filter_map(|e| match e {
                    Ev::StreamChunk(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Effects for RecordingEffects {
        async fn stream_chunk(&self, text: &str) -> Result<()> {
            self.record(Ev::StreamChunk(text.to_string()));
            Ok(())
        }

        async fn stream_done(&self) -> Result<()> {
            self.record(Ev::StreamDone);
            Ok(())
        }

        async fn tool_detected(&self, name: &str, _preview: &str) -> Result<()> {
            self.record(Ev::ToolDetected(name.to_string()));
            Ok(())
        }

        async fn tool_start(&self, name: &str, _preview: &str) -> Result<()> {
            self.record(Ev::ToolStart(name.to_string()));
            Ok(())
        }

        async fn tool_done(&self, name: &str, ok: bool, _output: &str) -> Result<()> {
            self.record(Ev::ToolDone(name.to_string(), ok));
            Ok(())
        }

        async fn confirm(&self, command: &str) -> Result<bool> {
            self.record(Ev::Confirm(command.to_string()));
            Ok(*self.confirm_reply.lock().unwrap())
        }

        async fn ask(&self, question: &str) -> Result<String> {
            self.record(Ev::Ask(question.to_string()));
            Ok(self.ask_reply.lock().unwrap().clone())
        }

        async fn remember(&self, content: &str) -> Result<()> {
            self.record(Ev::Remember(content.to_string()));
            Ok(())
        }

        async fn forget(&self, content: &str) -> Result<()> {
            self.record(Ev::Forget(content.to_string()));
            Ok(())
        }

        async fn refresh_system(&self) -> Result<()> {
            self.record(Ev::RefreshSystem);
            Ok(())
        }

        async fn reboot(&self, reason: &str, _conversation: &Conversation) -> Result<()> {
            self.record(Ev::Reboot(reason.to_string()));
            Ok(())
        }

        async fn manage_context(&self, instructions: &str) -> Result<String> {
            self.record(Ev::ManageContext(instructions.to_string()));
            Ok("pruned".to_string())
        }

        async fn complete(&self, summary: &str) -> Result<()> {
            self.record(Ev::Complete(summary.to_string()));
            Ok(())
        }

        async fn install_tool(&self, source: &str) -> Result<String> {
            Ok(format!("installed {source}"))
        }

        async fn list_tools(&self) -> Result<String> {
            Ok("Echo(text): Echo the given text back".to_string())
        }

        async fn spawn(&self, task: &str) -> Result<SpawnResult> {
            self.record(Ev::Spawn(task.to_string()));
            Ok(SpawnResult {
                success: true,
                summary: format!("subagent finished: {task}"),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_becomes_think() {
        let form = route_input("  hello there  ");
        assert!(matches!(form, Form::Think(ref input) if input == "hello there"));
    }

    #[test]
    fn tools_command_lists_tools() {
        assert_eq!(route_input("/tools").tag(), "ListTools");
    }

    #[test]
    fn install_command_carries_source() {
        let form = route_input("/install ~/tools/deploy.toml");
        assert!(matches!(form, Form::Install(ref source) if source == "~/tools/deploy.toml"));
    }

    #[test]
    fn install_without_argument_shows_usage() {
        let form = route_input("/install");
        assert!(matches!(form, Form::Emit(ref text, _) if text.starts_with("Usage:")));
    }

    #[test]
    fn unknown_command_is_reported() {
        let form = route_input("/unknown");
        match form {
            Form::Emit(text, next) => {
                assert_eq!(text, "Unknown command: /unknown");
                assert_eq!(next.tag(), "Nil");
            }
            other => panic!("expected Emit, got {other:?}"),
        }
    }
}
