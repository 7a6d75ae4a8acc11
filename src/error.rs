//! Error types for compymac-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmErrorKind;

/// Result type alias using compymac-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The session is terminal and refuses further writes
    #[error("session {session} is closed ({status})")]
    SessionClosed { session: String, status: String },

    /// Trace-store write or read failure (fatal to the session)
    #[error("trace store error: {0}")]
    Storage(String),

    /// Artifact or entity lookup failed
    #[error("not found: {0}")]
    NotFound(String),

    /// Tool not visible under the active mode or phase
    #[error("tool '{tool}' is masked: {reason}")]
    ToolMasked { tool: String, reason: String },

    /// Tool arguments failed schema validation
    #[error("invalid arguments for '{tool}': {violations:?}")]
    SchemaViolation {
        tool: String,
        violations: Vec<String>,
    },

    /// Timeout during operation
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Tool implementation failure, normalized at the orchestrator boundary
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// Think/latency budget exhausted
    #[error("budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// A todo claim lacked a binding for one or more acceptance criteria
    #[error("insufficient evidence for todo {todo}: {missing:?}")]
    InsufficientEvidence { todo: String, missing: Vec<String> },

    /// A state transition was requested by the wrong authority
    #[error("{actor} may not perform transition '{transition}'")]
    UnauthorizedTransition { actor: String, transition: String },

    /// A state transition violates the allowed ordering
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Phase transition rejected (not adjacent, or exit criteria unmet)
    #[error("phase transition rejected: {0}")]
    PhaseViolation(String),

    /// The verifier rejected claimed evidence
    #[error("verifier rejected todo {todo}: {reasons:?}")]
    VerifierRejected { todo: String, reasons: Vec<String> },

    /// LLM provider error
    #[error("LLM error ({kind}): {message}")]
    Llm { kind: LlmErrorKind, message: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a session-closed error.
    pub fn session_closed(session: impl Into<String>, status: impl Into<String>) -> Self {
        Self::SessionClosed {
            session: session.into(),
            status: status.into(),
        }
    }

    /// Create a masked-tool error.
    pub fn masked(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolMasked {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a tool-failure error.
    pub fn tool_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a budget exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }

    /// Create an LLM error.
    pub fn llm(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self::Llm {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error is fatal to the owning session.
    ///
    /// System errors abort the session; everything else is surfaced back to
    /// the LLM or the caller as a structured message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::SessionClosed { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Category of a normalized per-call failure, surfaced to the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Timeout,
    ToolException,
    SchemaViolation,
    ResourceConflict,
    Masked,
    Cancelled,
    Policy,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ToolException => "tool-exception",
            Self::SchemaViolation => "schema-violation",
            Self::ResourceConflict => "resource-conflict",
            Self::Masked => "masked",
            Self::Cancelled => "cancelled",
            Self::Policy => "policy",
        };
        write!(f, "{}", s)
    }
}

/// Structured error envelope returned to the LLM in place of a tool result.
///
/// Tool implementations may fail however they like; the orchestrator boundary
/// normalizes every failure into this shape. Exceptions never leak to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            recoverable: !matches!(category, ErrorCategory::Cancelled),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn not_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Normalize a crate error into an envelope.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Timeout { duration_ms } => Self::new(
                ErrorCategory::Timeout,
                format!("call exceeded its {}ms deadline", duration_ms),
            )
            .with_hint("retry with a smaller scope or raise the tool deadline"),
            Error::ToolMasked { tool, reason } => Self::new(
                ErrorCategory::Masked,
                format!("tool '{}' is not available: {}", tool, reason),
            )
            .with_hint("call menu_list to see the tools visible right now"),
            Error::SchemaViolation { tool, violations } => Self::new(
                ErrorCategory::SchemaViolation,
                format!(
                    "arguments for '{}' rejected: {}",
                    tool,
                    violations.join("; ")
                ),
            ),
            Error::BudgetExhausted { resource } => Self::new(
                ErrorCategory::Policy,
                format!("budget exhausted: {}", resource),
            )
            .with_hint("issue a non-think, state-changing tool call"),
            Error::PhaseViolation(message) => {
                Self::new(ErrorCategory::Policy, message.clone())
            }
            Error::ToolFailed { tool, message } => Self::new(
                ErrorCategory::ToolException,
                format!("'{}' failed: {}", tool, message),
            ),
            other => Self::new(ErrorCategory::ToolException, other.to_string()),
        }
    }

    /// Serialize for inclusion in a prompt-back message.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .unwrap_or_else(|_| serde_json::json!({"category": "tool-exception"}))
    }
}
