use crate::events::Usage;
use crate::providers::{ChatMessage, Provider, StreamEvent};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle on one live streaming reply.
///
/// Dropping or aborting it abandons the provider task without awaiting its
/// teardown — some providers hold the HTTP connection open in cleanup, and a
/// user-initiated abort must not block on that.
///
/// The end-of-stream hook runs here, in the consumer: when `recv` yields
/// `Done`, the assistant message is appended to the history. A consumer that
/// breaks early never receives `Done`, so the hook observably never ran and
/// the partial text must be appended manually.
pub struct ChunkStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<()>,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    usage: Arc<Mutex<Usage>>,
}

impl ChunkStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if let Some(StreamEvent::Done(ref response)) = event {
            self.history
                .lock()
                .expect("history lock")
                .push(ChatMessage::assistant(&response.text));
            Conversation::record_usage(&self.usage, response.usage);
        }
        event
    }

    /// Fire-and-forget teardown.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// The conversation handle: owns the message history, the model id, and an
/// optional provider-routing hint. Created once per process; a reboot
/// persists the history and a fresh process re-installs it.
pub struct Conversation {
    provider: Arc<dyn Provider>,
    model: String,
    routing: Mutex<Option<String>>,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    usage: Arc<Mutex<Usage>>,
}

impl Conversation {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            routing: Mutex::new(None),
            history: Arc::new(Mutex::new(Vec::new())),
            usage: Arc::new(Mutex::new(Usage::default())),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn get_history(&self) -> Vec<ChatMessage> {
        self.history.lock().expect("history lock").clone()
    }

    pub fn set_history(&self, history: Vec<ChatMessage>) {
        *self.history.lock().expect("history lock") = history;
    }

    pub fn push_assistant(&self, content: &str) {
        self.history
            .lock()
            .expect("history lock")
            .push(ChatMessage::assistant(content));
    }

    /// Install or replace the system prompt at the head of the history.
    pub fn set_system(&self, prompt: &str) {
        let mut history = self.history.lock().expect("history lock");
        match history.first_mut() {
            Some(first) if first.role == "system" => first.content = prompt.to_string(),
            _ => history.insert(0, ChatMessage::system(prompt)),
        }
    }

    pub fn set_provider_routing(&self, hint: Option<String>) {
        *self.routing.lock().expect("routing lock") = hint;
    }

    pub fn routing(&self) -> Option<String> {
        self.routing.lock().expect("routing lock").clone()
    }

    pub fn usage(&self) -> Usage {
        *self.usage.lock().expect("usage lock")
    }

    fn record_usage(usage: &Mutex<Usage>, delta: Option<Usage>) {
        if let Some(delta) = delta {
            usage.lock().expect("usage lock").add(delta);
        }
    }

    /// Blocking single turn: user message in, assistant message appended.
    pub async fn send(&self, text: &str) -> Result<String> {
        self.history
            .lock()
            .expect("history lock")
            .push(ChatMessage::user(text));
        let messages = self.get_history();
        let routing = self.routing();
        let response = self
            .provider
            .chat(&messages, &self.model, routing.as_deref())
            .await?;
        Self::record_usage(&self.usage, response.usage);
        self.push_assistant(&response.text);
        Ok(response.text)
    }

    /// Streaming turn. The user message is appended synchronously; a
    /// provider task then feeds deltas through the returned stream. Receiving
    /// the final `Done` event runs the end-of-stream hook (see `ChunkStream`);
    /// an abandoned stream never runs it and the consumer appends what it
    /// accumulated.
    pub fn stream(&self, text: &str) -> ChunkStream {
        self.history
            .lock()
            .expect("history lock")
            .push(ChatMessage::user(text));

        let messages = self.get_history();
        let provider = Arc::clone(&self.provider);
        let model = self.model.clone();
        let routing = self.routing();

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            match provider
                .chat_streaming(&messages, &model, routing.as_deref(), &tx)
                .await
            {
                Ok(response) => {
                    let _ = tx.send(StreamEvent::Done(response)).await;
                }
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(format!("{e:#}"))).await;
                }
            }
        });

        ChunkStream {
            rx,
            task,
            history: Arc::clone(&self.history),
            usage: Arc::clone(&self.usage),
        }
    }

    /// New conversation on the same provider/model/routing with an empty
    /// history seeded only by `system_prompt`.
    pub fn fork(&self, system_prompt: &str) -> Conversation {
        let fork = Conversation::new(Arc::clone(&self.provider), self.model.clone());
        fork.set_provider_routing(self.routing());
        fork.set_system(system_prompt);
        fork
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatResponse;
    use async_trait::async_trait;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            _model: &str,
            _routing: Option<&str>,
        ) -> Result<ChatResponse> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ChatResponse {
                text: format!("echo: {last}"),
                usage: Some(Usage {
                    input_tokens: 2,
                    output_tokens: 3,
                }),
            })
        }
    }

    fn conversation() -> Conversation {
        Conversation::new(Arc::new(EchoProvider), "test-model")
    }

    #[tokio::test]
    async fn send_appends_both_turns() {
        let conv = conversation();
        let reply = conv.send("hello").await.unwrap();
        assert_eq!(reply, "echo: hello");

        let history = conv.get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(conv.usage().output_tokens, 3);
    }

    #[tokio::test]
    async fn stream_end_of_stream_hook_appends_assistant() {
        let conv = conversation();
        let mut stream = conv.stream("hi");

        let mut saw_done = false;
        while let Some(event) = stream.recv().await {
            if matches!(event, StreamEvent::Done(_)) {
                saw_done = true;
            }
        }
        assert!(saw_done);

        let history = conv.get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "echo: hi");
    }

    #[tokio::test]
    async fn aborted_stream_skips_hook() {
        let conv = conversation();
        let stream = conv.stream("hi");
        stream.abort();
        // Give the aborted task a chance to (not) run the hook.
        tokio::task::yield_now().await;

        let history = conv.get_history();
        assert_eq!(history.len(), 1, "only the user message is recorded");
        assert_eq!(history[0].role, "user");
    }

    #[test]
    fn set_system_replaces_existing() {
        let conv = conversation();
        conv.set_system("first");
        conv.set_system("second");
        let history = conv.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "system");
        assert_eq!(history[0].content, "second");
    }

    #[test]
    fn fork_keeps_provider_settings_fresh_history() {
        let conv = conversation();
        conv.set_provider_routing(Some("groq".into()));
        conv.set_system("outer prompt");
        conv.push_assistant("outer message");

        let fork = conv.fork("fork prompt");
        assert_eq!(fork.model(), "test-model");
        assert_eq!(fork.routing().as_deref(), Some("groq"));
        let history = fork.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "fork prompt");
    }
}
