pub mod builtin;
pub mod manifest;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One named, described argument. Order matters: the invoke step zips these
/// against the positional raw args from the parser.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub description: String,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Ordered argument specs.
    fn arguments(&self) -> Vec<ArgSpec>;

    async fn execute(&self, args: HashMap<String, String>) -> Result<String>;

    /// Return a danger description if this invocation needs user approval.
    fn ask_permission(&self, _args: &HashMap<String, String>) -> Option<String> {
        None
    }

    /// Dynamic tools are the manifest-loaded portion `Reload` swaps out.
    fn dynamic(&self) -> bool {
        false
    }
}

/// Name → tool mapping. Cloning is cheap (shared `Arc`s), so readers take a
/// snapshot and mutators copy-on-write behind the shared lock.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any existing tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Swap the dynamic portion for `replacements`, leaving built-ins alone.
    pub fn swap_dynamic(&mut self, replacements: Vec<Arc<dyn Tool>>) {
        self.tools.retain(|t| !t.dynamic());
        for tool in replacements {
            self.register(tool);
        }
    }
}

pub type SharedRegistry = Arc<RwLock<ToolRegistry>>;

pub fn shared(registry: ToolRegistry) -> SharedRegistry {
    Arc::new(RwLock::new(registry))
}

/// Consistent point-in-time view for one tool batch.
pub fn snapshot(registry: &SharedRegistry) -> ToolRegistry {
    registry.read().expect("registry lock").clone()
}

/// Positional argument binding: zip the tool's argument names with the raw
/// args. Excess raw args are dropped; missing ones are absent keys.
pub fn zip_args(tool: &dyn Tool, raw_args: &[String]) -> HashMap<String, String> {
    tool.arguments()
        .into_iter()
        .zip(raw_args.iter())
        .map(|(spec, value)| (spec.name, value.clone()))
        .collect()
}
