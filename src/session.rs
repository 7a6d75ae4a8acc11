//! Session types and the session context value.
//!
//! A session is the top-level container: it owns one agent loop, one todo
//! list, one trace, and zero or more checkpoints. Cross-cutting service
//! handles are carried in an explicit [`SessionContext`] constructed at
//! session start and dropped at session end; nothing in the core reaches
//! for process-global state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::phase::Phase;
use crate::tools::ToolRegistry;
use crate::trace::TraceStore;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    /// Implicit termination (crash or external interrupt)
    Interrupted,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "interrupted" => Some(Self::Interrupted),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal sessions refuse further trace writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The session manifest persisted alongside the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// The user goal this session pursues
    pub goal: String,
    /// Workspace root all relative paths resolve against
    pub workspace: PathBuf,
    pub phase: Phase,
    /// Active tool mode (exactly one at a time)
    pub mode: String,
    pub status: SessionStatus,
    /// Set when a tool ignored cancellation and its worker was detached
    pub degraded: bool,
    /// Parent session when this session was forked from a checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<SessionId>,
    /// Highest event sequence number appended so far
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session for a user goal.
    pub fn new(goal: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            goal: goal.into(),
            workspace: workspace.into(),
            phase: Phase::Localize,
            mode: "swe".to_string(),
            status: SessionStatus::Running,
            degraded: false,
            parent: None,
            last_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Service handles shared by the components working on one session.
///
/// Constructed at session start; every component receives it explicitly
/// instead of reaching for singletons.
#[derive(Clone)]
pub struct SessionContext {
    pub session: SessionId,
    pub trace: Arc<TraceStore>,
    pub registry: Arc<ToolRegistry>,
    pub config: Arc<CoreConfig>,
}

impl SessionContext {
    pub fn new(
        session: SessionId,
        trace: Arc<TraceStore>,
        registry: Arc<ToolRegistry>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            session,
            trace,
            registry,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Interrupted,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(!SessionStatus::Interrupted.is_terminal());
    }

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new("fix the tests", "/tmp/ws");
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.phase, Phase::Localize);
        assert_eq!(session.mode, "swe");
        assert_eq!(session.last_seq, 0);
        assert!(!session.degraded);
        assert!(session.parent.is_none());
    }
}
