use crate::tools::{manifest, ArgSpec, SharedRegistry, Tool};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maximum bytes of command/file output fed back to the model.
const MAX_OUTPUT_SIZE: usize = 100_000;

/// Truncate output at a UTF-8 boundary, noting how much was cut.
fn truncate_output(output: String) -> String {
    if output.len() <= MAX_OUTPUT_SIZE {
        return output;
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !output.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!(
        "{}\n\n[OUTPUT TRUNCATED - exceeded {} bytes, showing first {}]",
        &output[..end],
        output.len(),
        end
    )
}

fn resolve(workspace: &Path, path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path).into_owned();
    let candidate = PathBuf::from(expanded);
    if candidate.is_absolute() {
        candidate
    } else {
        workspace.join(candidate)
    }
}

// ── Bash ───────────────────────────────────────────────────

/// Shell execution in the workspace. The invoke step's built-in danger
/// patterns gate destructive commands before this runs.
pub struct BashTool {
    workspace: PathBuf,
}

impl BashTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace. Supports pipes and redirects."
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::new("command", "shell command to execute")]
    }

    async fn execute(&self, args: HashMap<String, String>) -> Result<String> {
        let command = args
            .get("command")
            .ok_or_else(|| anyhow::anyhow!("'command' argument is required"))?;

        tracing::info!(command = %command, "executing shell command");
        std::fs::create_dir_all(&self.workspace).ok();

        let output = tokio::process::Command::new("bash")
            .args(["-c", command])
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to execute command: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        let mut parts = Vec::new();
        if !stdout.trim().is_empty() {
            parts.push(format!("STDOUT:\n{}", stdout.trim()));
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{}", stderr.trim()));
        }
        parts.push(format!("EXIT CODE: {exit_code}"));

        let report = truncate_output(parts.join("\n\n"));
        if output.status.success() {
            Ok(report)
        } else {
            Err(anyhow::anyhow!("{report}"))
        }
    }
}

// ── ReadFile / WriteFile ───────────────────────────────────

pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "ReadFile"
    }

    fn description(&self) -> &str {
        "Read file contents. Relative paths resolve against the workspace."
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        vec![ArgSpec::new("path", "file to read")]
    }

    async fn execute(&self, args: HashMap<String, String>) -> Result<String> {
        let path = args
            .get("path")
            .ok_or_else(|| anyhow::anyhow!("'path' argument is required"))?;
        let resolved = resolve(&self.workspace, path);
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", resolved.display()))?;
        Ok(truncate_output(content))
    }
}

pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "WriteFile"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed."
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::new("path", "file to write"),
            ArgSpec::new("content", "full file content"),
        ]
    }

    async fn execute(&self, args: HashMap<String, String>) -> Result<String> {
        let path = args
            .get("path")
            .ok_or_else(|| anyhow::anyhow!("'path' argument is required"))?;
        let content = args.get("content").cloned().unwrap_or_default();
        let resolved = resolve(&self.workspace, path);
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&resolved, &content)
            .await
            .map_err(|e| anyhow::anyhow!("writing {}: {e}", resolved.display()))?;
        Ok(format!(
            "Wrote {} bytes to {}",
            content.len(),
            resolved.display()
        ))
    }
}

// ── Reload ─────────────────────────────────────────────────

/// Re-scan the dynamic tool directory and swap the registry's dynamic
/// portion atomically. The invoke step refreshes the system prompt after
/// any batch containing a Reload.
pub struct ReloadTool {
    registry: SharedRegistry,
    tools_dir: PathBuf,
    workspace: PathBuf,
}

impl ReloadTool {
    pub fn new(
        registry: SharedRegistry,
        tools_dir: impl Into<PathBuf>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            tools_dir: tools_dir.into(),
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for ReloadTool {
    fn name(&self) -> &str {
        "Reload"
    }

    fn description(&self) -> &str {
        "Reload dynamic tools from the tool directory."
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        vec![]
    }

    async fn execute(&self, _args: HashMap<String, String>) -> Result<String> {
        let loaded = manifest::load_dir(&self.tools_dir, &self.workspace)?;
        let names: Vec<String> = loaded.iter().map(|t| t.name().to_string()).collect();
        self.registry
            .write()
            .expect("registry lock")
            .swap_dynamic(loaded);
        Ok(format!(
            "Reloaded {} dynamic tool(s): {}",
            names.len(),
            names.join(", ")
        ))
    }
}

/// The standard registry contents for a workspace.
pub fn default_tools(
    registry: &SharedRegistry,
    tools_dir: &Path,
    workspace: &Path,
) -> Vec<std::sync::Arc<dyn Tool>> {
    vec![
        std::sync::Arc::new(BashTool::new(workspace)),
        std::sync::Arc::new(ReadFileTool::new(workspace)),
        std::sync::Arc::new(WriteFileTool::new(workspace)),
        std::sync::Arc::new(ReloadTool::new(
            std::sync::Arc::clone(registry),
            tools_dir,
            workspace,
        )),
    ]
}
