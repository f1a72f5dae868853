use crate::agent::effects::SpawnResult;
use crate::events;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Instruction appended to every subagent task prompt (verbatim; the
/// detector and the headless runner both rely on the exact text).
pub const TASK_SUFFIX: &str = "Do not stop working until you think the task is complete, then \
     return the results. make sure to do that by calling task complete tool with the results \
     as arguments .";

/// Append the task suffix unless the prompt already carries it.
pub fn with_task_suffix(task: &str) -> String {
    if task.contains(TASK_SUFFIX) {
        task.to_string()
    } else {
        format!("{task} {TASK_SUFFIX}")
    }
}

fn temp_events_path() -> PathBuf {
    std::env::temp_dir().join(format!("gloop-events-{}.jsonl", uuid::Uuid::new_v4()))
}

/// Launch a detached subagent: re-invoke this executable headless with the
/// task, let it write its event stream to a temp file, and lift the
/// `complete` event's summary into the result.
pub async fn run_subagent(task: &str, model: &str, provider: &str) -> Result<SpawnResult> {
    let events_path = temp_events_path();
    let exe = std::env::current_exe().context("locating the gloop executable")?;

    tracing::info!(task, "spawning subagent");
    let output = tokio::process::Command::new(&exe)
        .arg("--task")
        .arg(task)
        .arg("--model")
        .arg(model)
        .arg("--provider")
        .arg(provider)
        .arg("--events-file")
        .arg(&events_path)
        .output()
        .await
        .context("running subagent process")?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let completion = events::read_completion(&events_path);
    std::fs::remove_file(&events_path).ok();

    let (summary, completed) = match completion {
        Some((summary, _usage)) => (summary, true),
        None => (String::new(), false),
    };

    Ok(SpawnResult {
        success: output.status.success() && completed,
        summary,
        exit_code,
        stdout,
        stderr,
    })
}
