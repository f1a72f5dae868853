use crate::error::AgentError;
use crate::providers::ChatMessage;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Exit code that tells the supervising launcher to respawn the process.
pub const REBOOT_EXIT_CODE: i32 = 75;

/// Conversation snapshot persisted across a reboot.
#[derive(Debug, Serialize, Deserialize)]
pub struct RebootSession {
    pub history: Vec<ChatMessage>,
    pub reason: String,
    pub timestamp: String,
}

pub fn session_path(workspace: &Path) -> PathBuf {
    workspace.join(".gloop").join("reboot_session.json")
}

/// Persist the conversation for the post-reboot process. Failure propagates:
/// the caller must not exit without a saved session.
pub fn save(workspace: &Path, history: Vec<ChatMessage>, reason: &str) -> Result<()> {
    let path = session_path(workspace);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgentError::Session(format!("creating {}: {e}", parent.display())))?;
    }
    let session = RebootSession {
        history,
        reason: reason.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_string_pretty(&session)
        .map_err(|e| AgentError::Session(format!("encoding session: {e}")))?;
    std::fs::write(&path, json)
        .map_err(|e| AgentError::Session(format!("writing {}: {e}", path.display())))?;
    Ok(())
}

/// Load and remove the session file, if one exists. The file is deleted
/// before the history is installed so a crash loop cannot replay it.
pub fn take(workspace: &Path) -> Result<Option<RebootSession>> {
    let path = session_path(workspace);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| AgentError::Session(format!("reading {}: {e}", path.display())))?;
    std::fs::remove_file(&path).ok();
    let session: RebootSession = serde_json::from_str(&text)
        .map_err(|e| AgentError::Session(format!("decoding {}: {e}", path.display())))?;
    Ok(Some(session))
}

/// The synthetic first input a rebooted process feeds itself.
pub fn resume_input(reason: &str) -> String {
    format!(
        "[System: Rebooted successfully. Reason: {reason}. Fresh code is now loaded. \
         Continue where you left off.]"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_and_take_round_trip() {
        let tmp = TempDir::new().unwrap();
        let history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
        ];
        save(tmp.path(), history.clone(), "hot reload").unwrap();
        assert!(session_path(tmp.path()).exists());

        let session = take(tmp.path()).unwrap().expect("session present");
        assert_eq!(session.reason, "hot reload");
        assert_eq!(session.history.len(), 3);
        assert_eq!(session.history[1].content, "hello");

        // The file is consumed.
        assert!(!session_path(tmp.path()).exists());
        assert!(take(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn take_without_file_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(take(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn corrupt_session_file_errors() {
        let tmp = TempDir::new().unwrap();
        let path = session_path(tmp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        assert!(take(tmp.path()).is_err());
    }

    #[test]
    fn resume_input_carries_reason() {
        let input = resume_input("new tool installed");
        assert!(input.starts_with("[System: Rebooted successfully."));
        assert!(input.contains("Reason: new tool installed."));
        assert!(input.ends_with("Continue where you left off.]"));
    }
}
