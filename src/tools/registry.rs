//! Process-wide tool registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::tools::spec::ToolSpec;

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Output content from the tool
    pub content: String,
    /// Exit code if applicable (e.g. for shell commands)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When the tool finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Tool-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl ToolOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            exit_code: None,
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Whether the execution succeeded (exit_code == 0 or None).
    pub fn is_success(&self) -> bool {
        self.exit_code.map_or(true, |code| code == 0)
    }
}

/// A tool implementation.
///
/// Implementations must be cancellable via the passed token, must not
/// mutate their arguments, and must return within their declared deadline.
/// Failures of any shape are normalized by the orchestrator; implementations
/// just return `Err`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The static catalog entry for this tool.
    fn spec(&self) -> &ToolSpec;

    /// Execute the tool.
    async fn invoke(&self, args: Value, cancel: CancellationToken) -> Result<ToolOutput>;
}

/// Statically registered tool table keyed by name.
///
/// Shared across sessions; logically read-only at session runtime.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.spec().name.clone();
        if crate::tools::mask::is_meta(&name) {
            return Err(Error::Config(format!(
                "'{}' shadows a built-in meta tool",
                name
            )));
        }
        if self.tools.contains_key(&name) {
            return Err(Error::Config(format!("duplicate tool '{}'", name)));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All registered tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every mode any tool is a member of.
    pub fn modes(&self) -> BTreeSet<String> {
        self.tools
            .values()
            .flat_map(|t| t.spec().modes.iter().cloned())
            .collect()
    }

    /// Specs of the tools visible in the given mode, name-ordered.
    pub fn visible_in_mode(&self, mode: &str) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| t.spec().clone())
            .filter(|s| s.modes.contains(mode))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Mechanical coverage check, run at startup: every registered tool must
    /// appear in at least one mode.
    pub fn validate_coverage(&self) -> Result<()> {
        let orphans: Vec<&str> = self
            .tools
            .values()
            .filter(|t| t.spec().modes.is_empty())
            .map(|t| t.spec().name.as_str())
            .collect();
        if orphans.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "tools registered in no mode: {}",
                orphans.join(", ")
            )))
        }
    }
}
