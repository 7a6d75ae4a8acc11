//! Standard workspace tools registered by the CLI.
//!
//! Paths are resolved against the workspace root and must stay inside it.
//! Shell tools are cancellation-aware: the child process is killed when the
//! token fires or the deadline passes.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::phase::ToolCategory;
use crate::tools::registry::{Tool, ToolOutput, ToolRegistry};
use crate::tools::spec::{KeyTemplate, ParamSpec, ParamType, SideEffect, ToolSpec};

fn resolve_in_workspace(workspace: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::Config(format!(
            "path '{}' must be relative and stay inside the workspace",
            raw
        )));
    }
    Ok(workspace.join(candidate))
}

fn string_arg<'a>(args: &'a Value, key: &str, tool: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::SchemaViolation {
            tool: tool.to_string(),
            violations: vec![format!("missing required parameter '{}'", key)],
        })
}

/// Read a file from the workspace.
pub struct ReadFileTool {
    spec: ToolSpec,
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            spec: ToolSpec::new(
                "read_file",
                "Read a file from the workspace.",
                ToolCategory::Read,
                SideEffect::ReadOnly,
            )
            .in_mode("swe")
            .with_param(ParamSpec::required(
                "path",
                ParamType::String,
                "Workspace-relative file path",
            ))
            .with_conflict_key(KeyTemplate::from_arg("fs", "path")),
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<ToolOutput> {
        let raw = string_arg(&args, "path", &self.spec.name)?;
        let path = resolve_in_workspace(&self.workspace, raw)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::tool_failed(&self.spec.name, format!("{}: {}", raw, e)))?;
        Ok(ToolOutput::new(content))
    }
}

/// Write (create or overwrite) a file in the workspace.
pub struct WriteFileTool {
    spec: ToolSpec,
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            spec: ToolSpec::new(
                "write_file",
                "Create or overwrite a file in the workspace.",
                ToolCategory::Write,
                SideEffect::Mutating,
            )
            .in_mode("swe")
            .with_param(ParamSpec::required(
                "path",
                ParamType::String,
                "Workspace-relative file path",
            ))
            .with_param(ParamSpec::required(
                "content",
                ParamType::String,
                "Full file content",
            ))
            .with_conflict_key(KeyTemplate::from_arg("fs", "path")),
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<ToolOutput> {
        let raw = string_arg(&args, "path", &self.spec.name)?;
        let content = string_arg(&args, "content", &self.spec.name)?;
        let path = resolve_in_workspace(&self.workspace, raw)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::tool_failed(&self.spec.name, e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::tool_failed(&self.spec.name, format!("{}: {}", raw, e)))?;
        Ok(ToolOutput::new(format!("wrote {} bytes to {}", content.len(), raw)))
    }
}

/// List directory entries in the workspace.
pub struct ListDirTool {
    spec: ToolSpec,
    workspace: PathBuf,
}

impl ListDirTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            spec: ToolSpec::new(
                "list_dir",
                "List entries of a workspace directory.",
                ToolCategory::Glob,
                SideEffect::ReadOnly,
            )
            .in_mode("swe")
            .with_param(ParamSpec::optional(
                "path",
                ParamType::String,
                "Workspace-relative directory (default: root)",
            )),
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<ToolOutput> {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or("");
        let path = if raw.is_empty() {
            self.workspace.clone()
        } else {
            resolve_in_workspace(&self.workspace, raw)?
        };

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| Error::tool_failed(&self.spec.name, format!("{}: {}", raw, e)))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::tool_failed(&self.spec.name, e.to_string()))?
        {
            let kind = if entry.path().is_dir() { "dir" } else { "file" };
            entries.push(format!("{} {}", kind, entry.file_name().to_string_lossy()));
        }
        entries.sort();
        Ok(ToolOutput::new(entries.join("\n")))
    }
}

/// Search workspace files with a regex.
pub struct SearchTool {
    spec: ToolSpec,
    workspace: PathBuf,
}

impl SearchTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            spec: ToolSpec::new(
                "search_files",
                "Search files matching a glob for a regex pattern.",
                ToolCategory::Search,
                SideEffect::ReadOnly,
            )
            .in_mode("swe")
            .with_param(ParamSpec::required(
                "pattern",
                ParamType::String,
                "Regex to search for",
            ))
            .with_param(ParamSpec::optional(
                "files",
                ParamType::String,
                "Glob of files to search (default: **/*)",
            )),
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, args: Value, cancel: CancellationToken) -> Result<ToolOutput> {
        let pattern = string_arg(&args, "pattern", &self.spec.name)?;
        let files = args.get("files").and_then(Value::as_str).unwrap_or("**/*");

        let re = regex::Regex::new(pattern)
            .map_err(|e| Error::tool_failed(&self.spec.name, format!("bad regex: {}", e)))?;
        let glob_pattern = self.workspace.join(files).to_string_lossy().to_string();
        let paths = glob::glob(&glob_pattern)
            .map_err(|e| Error::tool_failed(&self.spec.name, format!("bad glob: {}", e)))?;

        let mut hits = Vec::new();
        for path in paths.flatten() {
            if cancel.is_cancelled() {
                return Err(Error::tool_failed(&self.spec.name, "cancelled"));
            }
            if !path.is_file() {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (line_no, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    let shown = path
                        .strip_prefix(&self.workspace)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .to_string();
                    hits.push(format!("{}:{}: {}", shown, line_no + 1, line));
                }
            }
        }
        Ok(ToolOutput::new(hits.join("\n")).with_metadata("matches", hits.len() as i64))
    }
}

/// Run a shell command in the workspace.
pub struct CommandTool {
    spec: ToolSpec,
    workspace: PathBuf,
}

impl CommandTool {
    /// `tests_only` narrows the category to BashTests (used by the phases
    /// that only allow running tests).
    pub fn new(workspace: impl Into<PathBuf>, tests_only: bool) -> Self {
        let (name, description, category) = if tests_only {
            (
                "run_tests",
                "Run the test command and report its output and exit code.",
                ToolCategory::BashTests,
            )
        } else {
            (
                "run_command",
                "Run a shell command in the workspace.",
                ToolCategory::Bash,
            )
        };
        Self {
            spec: ToolSpec::new(name, description, category, SideEffect::Mutating)
                .in_mode("swe")
                .with_param(ParamSpec::required(
                    "command",
                    ParamType::String,
                    "Shell command line",
                ))
                .with_conflict_key(KeyTemplate::Fixed("shell:workspace".to_string())),
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, args: Value, cancel: CancellationToken) -> Result<ToolOutput> {
        let command_line = string_arg(&args, "command", &self.spec.name)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .current_dir(&self.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tool_failed(&self.spec.name, format!("spawn: {}", e)))?;

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output
                    .map_err(|e| Error::tool_failed(&self.spec.name, e.to_string()))?;
                let mut content = String::from_utf8_lossy(&output.stdout).to_string();
                if !output.stderr.is_empty() {
                    content.push_str(&String::from_utf8_lossy(&output.stderr));
                }
                Ok(ToolOutput::new(content).with_exit_code(output.status.code().unwrap_or(-1)))
            }
            _ = cancel.cancelled() => {
                Err(Error::tool_failed(&self.spec.name, "cancelled"))
            }
        }
    }
}

/// Register the standard workspace tool set.
pub fn register_workspace_tools(
    registry: &mut ToolRegistry,
    workspace: impl Into<PathBuf>,
) -> Result<()> {
    let workspace = workspace.into();
    registry.register(Arc::new(ReadFileTool::new(&workspace)))?;
    registry.register(Arc::new(WriteFileTool::new(&workspace)))?;
    registry.register(Arc::new(ListDirTool::new(&workspace)))?;
    registry.register(Arc::new(SearchTool::new(&workspace)))?;
    registry.register(Arc::new(CommandTool::new(&workspace, false)))?;
    registry.register(Arc::new(CommandTool::new(&workspace, true)))?;
    registry.validate_coverage()
}
