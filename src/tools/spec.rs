//! Typed tool catalog entries.
//!
//! A [`ToolSpec`] is the single source of truth for what a tool is called,
//! what arguments it takes, what it may touch concurrently, and in which
//! modes it is visible. Unknown tool names never reach a handler: dispatch
//! goes through the statically registered table, not reflection.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::phase::ToolCategory;
use crate::tools::conflict::ResourceKey;

/// Side-effect classification, declared statically per tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Pure,
    ReadOnly,
    Mutating,
    Destructive,
}

/// Parameter value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn json_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, param_type: ParamType, desc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: desc.into(),
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, desc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: desc.into(),
        }
    }
}

/// How a tool derives the exclusive resource keys it acquires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyTemplate {
    /// `scheme:{value of argument}` (e.g. `fs:{path}`)
    FromArg { scheme: String, arg: String },
    /// A fixed key held on every invocation (e.g. `net:api.example.com`)
    Fixed(String),
}

impl KeyTemplate {
    pub fn from_arg(scheme: impl Into<String>, arg: impl Into<String>) -> Self {
        Self::FromArg {
            scheme: scheme.into(),
            arg: arg.into(),
        }
    }

    fn resolve(&self, args: &Value) -> Option<ResourceKey> {
        match self {
            Self::Fixed(key) => Some(ResourceKey::new(key.clone())),
            Self::FromArg { scheme, arg } => {
                let value = args.get(arg)?;
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some(ResourceKey::new(format!("{}:{}", scheme, rendered)))
            }
        }
    }
}

/// Registry entry describing one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique name the LLM calls the tool by
    pub name: String,
    /// Description surfaced in the LLM prompt
    pub description: String,
    pub category: ToolCategory,
    pub side_effect: SideEffect,
    /// Modes in which the tool is visible
    pub modes: BTreeSet<String>,
    pub params: Vec<ParamSpec>,
    /// Exclusive resource keys acquired for the duration of a call
    pub conflict_keys: Vec<KeyTemplate>,
    /// Per-tool deadline override in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
        side_effect: SideEffect,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            side_effect,
            modes: BTreeSet::new(),
            params: Vec::new(),
            conflict_keys: Vec::new(),
            deadline_secs: None,
        }
    }

    pub fn in_mode(mut self, mode: impl Into<String>) -> Self {
        self.modes.insert(mode.into());
        self
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_conflict_key(mut self, template: KeyTemplate) -> Self {
        self.conflict_keys.push(template);
        self
    }

    pub fn with_deadline_secs(mut self, secs: u64) -> Self {
        self.deadline_secs = Some(secs);
        self
    }

    /// The call deadline, falling back to the given default.
    pub fn deadline(&self, default: Duration) -> Duration {
        self.deadline_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Resolve the exclusive keys this call would acquire.
    pub fn resource_keys(&self, args: &Value) -> Vec<ResourceKey> {
        self.conflict_keys
            .iter()
            .filter_map(|t| t.resolve(args))
            .collect()
    }

    /// Validate arguments against the declared schema. Returns the list of
    /// violations (empty = valid).
    pub fn validate_args(&self, args: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        let object = match args.as_object() {
            Some(object) => object,
            None => return vec!["arguments must be a JSON object".to_string()],
        };

        for param in &self.params {
            match object.get(&param.name) {
                None if param.required => {
                    violations.push(format!("missing required parameter '{}'", param.name));
                }
                Some(value) if !value.is_null() && !param.param_type.matches(value) => {
                    violations.push(format!(
                        "parameter '{}' must be {}",
                        param.name,
                        param.param_type.json_name()
                    ));
                }
                _ => {}
            }
        }

        for key in object.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                violations.push(format!("unknown parameter '{}'", key));
            }
        }

        violations
    }

    /// Render as the JSON-schema shape LLM providers expect.
    pub fn llm_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.param_type.json_name(),
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_spec() -> ToolSpec {
        ToolSpec::new(
            "read_file",
            "Read a file from the workspace",
            ToolCategory::Read,
            SideEffect::ReadOnly,
        )
        .in_mode("swe")
        .with_param(ParamSpec::required("path", ParamType::String, "File path"))
        .with_param(ParamSpec::optional(
            "limit",
            ParamType::Integer,
            "Max lines",
        ))
        .with_conflict_key(KeyTemplate::from_arg("fs", "path"))
    }

    #[test]
    fn test_validate_accepts_good_args() {
        let spec = read_spec();
        assert!(spec
            .validate_args(&json!({"path": "src/lib.rs", "limit": 10}))
            .is_empty());
        assert!(spec.validate_args(&json!({"path": "src/lib.rs"})).is_empty());
    }

    #[test]
    fn test_validate_flags_violations() {
        let spec = read_spec();
        let missing = spec.validate_args(&json!({}));
        assert_eq!(missing, vec!["missing required parameter 'path'"]);

        let wrong_type = spec.validate_args(&json!({"path": 42}));
        assert_eq!(wrong_type, vec!["parameter 'path' must be string"]);

        let unknown = spec.validate_args(&json!({"path": "a", "nope": true}));
        assert_eq!(unknown, vec!["unknown parameter 'nope'"]);

        let not_object = spec.validate_args(&json!([1, 2]));
        assert_eq!(not_object, vec!["arguments must be a JSON object"]);
    }

    #[test]
    fn test_resource_keys_resolve_from_args() {
        let spec = read_spec();
        let keys = spec.resource_keys(&json!({"path": "src/lib.rs"}));
        assert_eq!(keys, vec![ResourceKey::new("fs:src/lib.rs")]);
        // Missing arg yields no key rather than a bogus one
        assert!(spec.resource_keys(&json!({})).is_empty());
    }

    #[test]
    fn test_llm_schema_shape() {
        let schema = read_spec().llm_schema();
        assert_eq!(schema["name"], "read_file");
        assert_eq!(schema["input_schema"]["required"], json!(["path"]));
        assert_eq!(
            schema["input_schema"]["properties"]["path"]["type"],
            "string"
        );
    }

    #[test]
    fn test_deadline_override() {
        let default = Duration::from_secs(60);
        assert_eq!(read_spec().deadline(default), default);
        let spec = read_spec().with_deadline_secs(5);
        assert_eq!(spec.deadline(default), Duration::from_secs(5));
    }
}
