use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Token accounting reported by providers and carried on the `complete` event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One event on the headless wire. Serialized as a single JSON line with a
/// flattened `type` tag plus the envelope's `ts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Start { model: String, provider: String },
    Assistant { text: String },
    ToolStart { name: String, preview: String },
    ToolDone { name: String, ok: bool, output: String },
    Remember { content: String },
    Forget { content: String },
    RefreshSystem,
    Reboot { reason: String },
    Complete { summary: String, usage: Usage },
    Usage { usage: Usage },
    Error { message: String },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    ts: String,
    #[serde(flatten)]
    event: AgentEvent,
}

/// Newline-delimited JSON event sink for headless runs.
pub struct EventWriter {
    file: Mutex<File>,
}

impl EventWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening event file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn write(&self, event: AgentEvent) {
        let envelope = Envelope {
            ts: chrono::Utc::now().to_rfc3339(),
            event,
        };
        let Ok(line) = serde_json::to_string(&envelope) else {
            return;
        };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
            let _ = file.flush();
        }
    }
}

/// Scan an event file for the final `complete` event's summary and usage.
pub fn read_completion(path: &Path) -> Option<(String, Usage)> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut found = None;
    for line in text.lines() {
        if let Ok(envelope) = serde_json::from_str::<Envelope>(line) {
            if let AgentEvent::Complete { summary, usage } = envelope.event {
                found = Some((summary, usage));
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn events_round_trip_as_jsonl() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");
        let writer = EventWriter::create(&path).unwrap();

        writer.write(AgentEvent::Start {
            model: "m".into(),
            provider: "p".into(),
        });
        writer.write(AgentEvent::ToolStart {
            name: "Bash".into(),
            preview: "ls".into(),
        });
        writer.write(AgentEvent::Complete {
            summary: "done".into(),
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        });

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"type\":\"start\""));
        assert!(lines[0].contains("\"ts\""));
        assert!(lines[1].contains("\"type\":\"tool_start\""));
        assert!(lines[2].contains("\"type\":\"complete\""));
    }

    #[test]
    fn read_completion_finds_last_complete() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");
        let writer = EventWriter::create(&path).unwrap();

        writer.write(AgentEvent::Assistant {
            text: "working".into(),
        });
        writer.write(AgentEvent::Complete {
            summary: "first".into(),
            usage: Usage::default(),
        });
        writer.write(AgentEvent::Complete {
            summary: "final".into(),
            usage: Usage {
                input_tokens: 1,
                output_tokens: 2,
            },
        });

        let (summary, usage) = read_completion(&path).unwrap();
        assert_eq!(summary, "final");
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn read_completion_none_without_complete() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");
        let writer = EventWriter::create(&path).unwrap();
        writer.write(AgentEvent::Error {
            message: "crashed".into(),
        });
        assert!(read_completion(&path).is_none());
    }

    #[test]
    fn usage_accumulates() {
        let mut usage = Usage::default();
        usage.add(Usage {
            input_tokens: 3,
            output_tokens: 4,
        });
        usage.add(Usage {
            input_tokens: 1,
            output_tokens: 1,
        });
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 5);
    }
}
