use crate::tools::{ArgSpec, Tool};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A dynamic tool definition: a TOML file in the tool directory describing a
/// shell-command-backed tool. `{arg}` placeholders in `command` are replaced
/// with the (shell-quoted) argument values at execution time.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub dangerous: bool,
    #[serde(default)]
    pub args: Vec<ManifestArg>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestArg {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ToolManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: ToolManifest = toml::from_str(text).context("parsing tool manifest")?;
        if manifest.name.trim().is_empty() {
            anyhow::bail!("tool manifest needs a non-empty name");
        }
        if manifest.command.trim().is_empty() {
            anyhow::bail!("tool manifest needs a non-empty command");
        }
        Ok(manifest)
    }
}

/// Single-quote a value for safe interpolation into a bash command line.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub struct ManifestTool {
    manifest: ToolManifest,
    workspace: PathBuf,
}

impl ManifestTool {
    pub fn new(manifest: ToolManifest, workspace: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            workspace: workspace.into(),
        }
    }

    fn render_command(&self, args: &HashMap<String, String>) -> String {
        let mut command = self.manifest.command.clone();
        for arg in &self.manifest.args {
            let placeholder = format!("{{{}}}", arg.name);
            let value = args.get(&arg.name).map(String::as_str).unwrap_or("");
            command = command.replace(&placeholder, &shell_quote(value));
        }
        command
    }
}

#[async_trait]
impl Tool for ManifestTool {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    fn arguments(&self) -> Vec<ArgSpec> {
        self.manifest
            .args
            .iter()
            .map(|a| ArgSpec::new(&a.name, &a.description))
            .collect()
    }

    async fn execute(&self, args: HashMap<String, String>) -> Result<String> {
        let command = self.render_command(&args);
        tracing::info!(tool = %self.manifest.name, command = %command, "running manifest tool");

        let output = tokio::process::Command::new("bash")
            .args(["-c", &command])
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to execute command: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            Ok(if stdout.is_empty() { stderr } else { stdout })
        } else {
            anyhow::bail!(
                "command failed with code {}: {}",
                output.status.code().unwrap_or(-1),
                if stderr.is_empty() { stdout } else { stderr }
            )
        }
    }

    fn ask_permission(&self, args: &HashMap<String, String>) -> Option<String> {
        if self.manifest.dangerous {
            Some(format!(
                "Run {} tool: {}",
                self.manifest.name,
                self.render_command(args)
            ))
        } else {
            None
        }
    }

    fn dynamic(&self) -> bool {
        true
    }
}

/// Load every `*.toml` manifest in `dir`. A missing directory is an empty
/// tool set; a malformed manifest is skipped with a warning rather than
/// poisoning the reload.
pub fn load_dir(dir: &Path, workspace: &Path) -> Result<Vec<Arc<dyn Tool>>> {
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(tools),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        match ToolManifest::parse(&text) {
            Ok(manifest) => tools.push(Arc::new(ManifestTool::new(manifest, workspace))),
            Err(e) => tracing::warn!("skipping tool manifest {}: {e:#}", path.display()),
        }
    }
    Ok(tools)
}

/// Install a tool from `source` — a path to a manifest file, or inline TOML.
/// Returns a human-readable summary.
pub fn install(tools_dir: &Path, source: &str) -> Result<String> {
    let expanded = shellexpand::tilde(source.trim()).into_owned();
    let source_path = Path::new(&expanded);
    let text = if source_path.is_file() {
        std::fs::read_to_string(source_path)
            .with_context(|| format!("reading {}", source_path.display()))?
    } else {
        source.to_string()
    };

    let manifest = ToolManifest::parse(&text)?;
    std::fs::create_dir_all(tools_dir)
        .with_context(|| format!("creating {}", tools_dir.display()))?;
    let target = tools_dir.join(format!("{}.toml", manifest.name.to_lowercase()));
    std::fs::write(&target, &text).with_context(|| format!("writing {}", target.display()))?;
    Ok(format!(
        "Installed tool {} ({}) at {}",
        manifest.name,
        manifest.description,
        target.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GREET: &str = r#"
name = "Greet"
description = "Say hello"
command = "echo hello {who}"

[[args]]
name = "who"
description = "who to greet"
"#;

    #[test]
    fn manifest_parses() {
        let manifest = ToolManifest::parse(GREET).unwrap();
        assert_eq!(manifest.name, "Greet");
        assert_eq!(manifest.args.len(), 1);
        assert!(!manifest.dangerous);
    }

    #[test]
    fn manifest_rejects_empty_command() {
        let err = ToolManifest::parse("name = \"X\"\ndescription = \"d\"\ncommand = \"\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("non-empty command"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn render_substitutes_quoted_values() {
        let manifest = ToolManifest::parse(GREET).unwrap();
        let tool = ManifestTool::new(manifest, ".");
        let mut args = HashMap::new();
        args.insert("who".to_string(), "world; rm -rf /".to_string());
        let command = tool.render_command(&args);
        assert_eq!(command, "echo hello 'world; rm -rf /'");
    }

    #[tokio::test]
    async fn manifest_tool_executes() {
        let tmp = TempDir::new().unwrap();
        let manifest = ToolManifest::parse(GREET).unwrap();
        let tool = ManifestTool::new(manifest, tmp.path());
        let mut args = HashMap::new();
        args.insert("who".to_string(), "world".to_string());
        let output = tool.execute(args).await.unwrap();
        assert_eq!(output, "hello world");
    }

    #[test]
    fn dangerous_manifest_asks_permission() {
        let text = GREET.replace("command =", "dangerous = true\ncommand =");
        let manifest = ToolManifest::parse(&text).unwrap();
        let tool = ManifestTool::new(manifest, ".");
        let args = HashMap::new();
        let danger = tool.ask_permission(&args).expect("needs approval");
        assert!(danger.contains("Greet"));
    }

    #[test]
    fn load_dir_skips_malformed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("good.toml"), GREET).unwrap();
        std::fs::write(tmp.path().join("bad.toml"), "not = [valid").unwrap();
        std::fs::write(tmp.path().join("ignored.txt"), "nope").unwrap();

        let tools = load_dir(tmp.path(), tmp.path()).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "Greet");
    }

    #[test]
    fn load_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let tools = load_dir(&tmp.path().join("nowhere"), tmp.path()).unwrap();
        assert!(tools.is_empty());
    }

    #[test]
    fn install_inline_toml() {
        let tmp = TempDir::new().unwrap();
        let tools_dir = tmp.path().join("tools");
        let summary = install(&tools_dir, GREET).unwrap();
        assert!(summary.contains("Installed tool Greet"));
        assert!(tools_dir.join("greet.toml").exists());
    }

    #[test]
    fn install_from_file() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("manifest.toml");
        std::fs::write(&source, GREET).unwrap();
        let tools_dir = tmp.path().join("tools");
        install(&tools_dir, source.to_str().unwrap()).unwrap();
        assert!(tools_dir.join("greet.toml").exists());
    }

    #[test]
    fn install_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        assert!(install(&tmp.path().join("tools"), "definitely not toml [").is_err());
    }
}
