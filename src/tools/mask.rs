//! Tool-availability masking.
//!
//! The effective tool set at any moment is (meta tools) ∪ (tools in the
//! current mode), further restricted by the current phase's category mask.
//! Calls outside that set are rejected before dispatch with a structured
//! `ToolMasked` error the LLM can read.

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::phase::Phase;
use crate::tools::registry::ToolRegistry;

/// The six always-available meta tools, visible in every mode and phase.
pub const META_TOOLS: [&str; 6] = [
    "menu_list",
    "menu_enter",
    "menu_exit",
    "complete",
    "think",
    "message_user",
];

/// Whether a name refers to a meta tool.
pub fn is_meta(name: &str) -> bool {
    META_TOOLS.contains(&name)
}

/// Check a call against the mode mask and the phase mask.
///
/// Meta tools always pass. Mode changes requested this turn do not apply
/// until the next turn, so the check always uses the mode the turn started
/// with.
pub fn check_visible(
    registry: &ToolRegistry,
    name: &str,
    mode: &str,
    phase: Phase,
) -> Result<()> {
    if is_meta(name) {
        return Ok(());
    }

    let tool = registry
        .get(name)
        .ok_or_else(|| Error::masked(name, "no such tool"))?;
    let spec = tool.spec();

    if !spec.modes.contains(mode) {
        return Err(Error::masked(
            name,
            format!("not in the active mode '{}'", mode),
        ));
    }
    if !phase.allows(spec.category) {
        return Err(Error::masked(
            name,
            format!("not allowed in phase {}", phase),
        ));
    }
    Ok(())
}

/// Tool schemas for the prompt: the visible mode tools filtered by phase,
/// plus the meta tools.
pub fn prompt_schemas(registry: &ToolRegistry, mode: &str, phase: Phase) -> Vec<Value> {
    let mut schemas: Vec<Value> = registry
        .visible_in_mode(mode)
        .iter()
        .filter(|spec| phase.allows(spec.category))
        .map(|spec| spec.llm_schema())
        .collect();
    schemas.extend(meta_schemas());
    schemas
}

/// Fixed schemas for the meta tools.
pub fn meta_schemas() -> Vec<Value> {
    vec![
        json!({
            "name": "menu_list",
            "description": "List the available tool modes and the tools visible right now.",
            "input_schema": {"type": "object", "properties": {}, "required": []}
        }),
        json!({
            "name": "menu_enter",
            "description": "Switch to a named tool mode. Takes effect on the next turn.",
            "input_schema": {
                "type": "object",
                "properties": {"mode": {"type": "string", "description": "Mode to enter"}},
                "required": ["mode"]
            }
        }),
        json!({
            "name": "menu_exit",
            "description": "Return to the default tool mode. Takes effect on the next turn.",
            "input_schema": {"type": "object", "properties": {}, "required": []}
        }),
        json!({
            "name": "complete",
            "description": "Declare the goal achieved. Fails unless every todo is verified and every entered phase's exit criteria are satisfied.",
            "input_schema": {
                "type": "object",
                "properties": {"summary": {"type": "string", "description": "What was accomplished"}},
                "required": []
            }
        }),
        json!({
            "name": "think",
            "description": "Record private reasoning. At most three consecutive calls.",
            "input_schema": {
                "type": "object",
                "properties": {"thought": {"type": "string", "description": "The reasoning step"}},
                "required": ["thought"]
            }
        }),
        json!({
            "name": "message_user",
            "description": "Send a message to the user and continue.",
            "input_schema": {
                "type": "object",
                "properties": {"message": {"type": "string", "description": "Message text"}},
                "required": ["message"]
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::ToolCategory;
    use crate::tools::registry::{Tool, ToolOutput};
    use crate::tools::spec::{SideEffect, ToolSpec};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Fake(ToolSpec);

    #[async_trait]
    impl Tool for Fake {
        fn spec(&self) -> &ToolSpec {
            &self.0
        }
        async fn invoke(
            &self,
            _args: Value,
            _cancel: CancellationToken,
        ) -> crate::error::Result<ToolOutput> {
            Ok(ToolOutput::new(""))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(Fake(
                ToolSpec::new("read_file", "read", ToolCategory::Read, SideEffect::ReadOnly)
                    .in_mode("swe"),
            )))
            .unwrap();
        registry
            .register(Arc::new(Fake(
                ToolSpec::new("edit_file", "edit", ToolCategory::Edit, SideEffect::Mutating)
                    .in_mode("swe"),
            )))
            .unwrap();
        registry
            .register(Arc::new(Fake(
                ToolSpec::new(
                    "browser_click",
                    "click",
                    ToolCategory::Bash,
                    SideEffect::Mutating,
                )
                .in_mode("browser"),
            )))
            .unwrap();
        registry
    }

    #[test]
    fn test_meta_tools_always_visible() {
        let registry = registry();
        for name in META_TOOLS {
            check_visible(&registry, name, "swe", Phase::Localize).unwrap();
        }
    }

    #[test]
    fn test_mode_mask() {
        let registry = registry();
        check_visible(&registry, "read_file", "swe", Phase::Localize).unwrap();
        let err = check_visible(&registry, "browser_click", "swe", Phase::Fix).unwrap_err();
        assert!(matches!(err, Error::ToolMasked { .. }));
    }

    #[test]
    fn test_phase_mask_restricts_mode_tools() {
        let registry = registry();
        // edit_file is in mode 'swe' but Localize forbids edits
        let err = check_visible(&registry, "edit_file", "swe", Phase::Localize).unwrap_err();
        assert!(matches!(err, Error::ToolMasked { .. }));
        check_visible(&registry, "edit_file", "swe", Phase::Fix).unwrap();
    }

    #[test]
    fn test_unknown_tool_is_masked_not_panic() {
        let registry = registry();
        let err = check_visible(&registry, "hallucinated", "swe", Phase::Fix).unwrap_err();
        assert!(matches!(err, Error::ToolMasked { .. }));
    }

    #[test]
    fn test_prompt_schemas_filter_by_phase() {
        let registry = registry();
        let schemas = prompt_schemas(&registry, "swe", Phase::Localize);
        let names: Vec<&str> = schemas
            .iter()
            .filter_map(|s| s.get("name").and_then(Value::as_str))
            .collect();
        assert!(names.contains(&"read_file"));
        assert!(!names.contains(&"edit_file"));
        assert!(names.contains(&"think"));
        assert!(names.contains(&"complete"));
    }
}
