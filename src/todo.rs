//! Guard-railed todo list with verified completion.
//!
//! Status only advances `pending -> in_progress -> claimed -> verified`.
//! The single permitted reversal is `claimed -> in_progress` when the
//! verifier rejects evidence. The agent loop may start and claim todos; only
//! the verification harness may verify or reject them. This separation of
//! duties is the principal anti-hallucination guarantee: the agent cannot
//! promote its own claims.
//!
//! Every transition is recorded in the session trace and sealed with a
//! COMMIT event, so crash recovery can discard partial tails.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::SessionId;
use crate::trace::{ArtifactId, EventKind, TraceStore};

/// Unique identifier for a todo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TodoId(pub Uuid);

impl TodoId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::NotFound(format!("malformed todo id '{}'", s)))
    }
}

impl Default for TodoId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TodoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a machine-checkable acceptance predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CriterionKind {
    CommandExitZero,
    FileExists,
    TestPasses,
    RegexMatches,
    VerifierCallback,
}

impl std::fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CommandExitZero => "command-exit-zero",
            Self::FileExists => "file-exists",
            Self::TestPasses => "test-passes",
            Self::RegexMatches => "regex-matches",
            Self::VerifierCallback => "verifier-callback",
        };
        write!(f, "{}", s)
    }
}

/// One acceptance criterion: a predicate kind plus its expectation
/// (the command line, file pattern, regex, or callback name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub kind: CriterionKind,
    pub expectation: String,
}

impl AcceptanceCriterion {
    pub fn new(kind: CriterionKind, expectation: impl Into<String>) -> Self {
        Self {
            kind,
            expectation: expectation.into(),
        }
    }
}

impl std::fmt::Display for AcceptanceCriterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.expectation)
    }
}

/// Binds one acceptance criterion (by index) to a recorded observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Index into the todo's criteria list
    pub criterion: usize,
    pub artifact: ArtifactId,
    /// Sequence number of the observation event in the same session
    pub event_seq: u64,
}

/// Todo lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Claimed,
    Verified,
}

impl std::fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Claimed => "claimed",
            Self::Verified => "verified",
        };
        write!(f, "{}", s)
    }
}

/// Who is requesting a transition. Checked at runtime on every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// The agent loop
    Agent,
    /// The verification harness
    Harness,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Harness => write!(f, "harness"),
        }
    }
}

/// A tracked unit of work with machine-checkable completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: TodoId,
    pub title: String,
    pub criteria: Vec<AcceptanceCriterion>,
    pub status: TodoStatus,
    pub evidence: Vec<EvidenceRef>,
    /// Seq of the event that created the todo
    pub created_seq: u64,
    /// Seq of the most recent transition to in_progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_seq: Option<u64>,
    /// Seq of the transition to claimed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_seq: Option<u64>,
    /// Seq of the transition to verified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_seq: Option<u64>,
    /// How many times the verifier has rejected a claim
    pub rejections: u32,
}

/// The session's todo list, bound to its trace.
pub struct TodoList {
    session: SessionId,
    trace: Arc<TraceStore>,
    inner: Mutex<Vec<Todo>>,
}

impl TodoList {
    pub fn new(session: SessionId, trace: Arc<TraceStore>) -> Self {
        Self {
            session,
            trace,
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Restore from checkpointed state.
    pub fn restore(session: SessionId, trace: Arc<TraceStore>, todos: Vec<Todo>) -> Self {
        Self {
            session,
            trace,
            inner: Mutex::new(todos),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Todo>>> {
        self.inner
            .lock()
            .map_err(|e| Error::Internal(format!("todo list poisoned: {}", e)))
    }

    fn record_transition(
        &self,
        id: &TodoId,
        transition: &str,
        extra: serde_json::Value,
    ) -> Result<u64> {
        let mut payload = json!({
            "entity": "todo",
            "todo": id.to_string(),
            "transition": transition,
        });
        if let (Some(map), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                map.insert(k.clone(), v.clone());
            }
        }
        let event = self
            .trace
            .append_event(&self.session, EventKind::StateTransition, payload, None)?;
        self.trace.append_event(
            &self.session,
            EventKind::Commit,
            json!({"transition": format!("todo:{}", transition), "todo": id.to_string()}),
            None,
        )?;
        Ok(event.seq)
    }

    /// Create a todo in `pending`.
    pub fn create(
        &self,
        title: impl Into<String>,
        criteria: Vec<AcceptanceCriterion>,
    ) -> Result<TodoId> {
        let title = title.into();
        let id = TodoId::new();
        let seq = self.record_transition(
            &id,
            "create",
            json!({
                "title": title,
                "criteria": criteria.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            }),
        )?;
        self.lock()?.push(Todo {
            id: id.clone(),
            title,
            criteria,
            status: TodoStatus::Pending,
            evidence: Vec::new(),
            created_seq: seq,
            started_seq: None,
            claimed_seq: None,
            verified_seq: None,
            rejections: 0,
        });
        Ok(id)
    }

    /// `pending -> in_progress`. Agent only.
    pub fn start(&self, actor: Actor, id: &TodoId) -> Result<()> {
        if actor != Actor::Agent {
            return Err(Error::UnauthorizedTransition {
                actor: actor.to_string(),
                transition: "start".to_string(),
            });
        }
        {
            let mut todos = self.lock()?;
            let todo = Self::find_mut(&mut todos, id)?;
            if todo.status != TodoStatus::Pending {
                return Err(Error::InvalidTransition {
                    from: todo.status.to_string(),
                    to: TodoStatus::InProgress.to_string(),
                });
            }
        }
        let seq = self.record_transition(id, "start", json!({}))?;
        let mut todos = self.lock()?;
        let todo = Self::find_mut(&mut todos, id)?;
        todo.status = TodoStatus::InProgress;
        todo.started_seq = Some(seq);
        Ok(())
    }

    /// `in_progress -> claimed` with evidence binding every criterion.
    /// Agent only.
    pub fn claim(&self, actor: Actor, id: &TodoId, evidence: Vec<EvidenceRef>) -> Result<()> {
        if actor != Actor::Agent {
            return Err(Error::UnauthorizedTransition {
                actor: actor.to_string(),
                transition: "claim".to_string(),
            });
        }

        {
            let mut todos = self.lock()?;
            let todo = Self::find_mut(&mut todos, id)?;
            if todo.status != TodoStatus::InProgress {
                return Err(Error::InvalidTransition {
                    from: todo.status.to_string(),
                    to: TodoStatus::Claimed.to_string(),
                });
            }

            // Every criterion needs at least one binding
            let missing: Vec<String> = todo
                .criteria
                .iter()
                .enumerate()
                .filter(|(i, _)| !evidence.iter().any(|e| e.criterion == *i))
                .map(|(_, c)| c.to_string())
                .collect();
            if evidence.is_empty() || !missing.is_empty() {
                return Err(Error::InsufficientEvidence {
                    todo: id.to_string(),
                    missing,
                });
            }
        }

        // Evidence must reference this session's trace and real artifacts
        let last_seq = self.trace.last_seq(&self.session)?;
        for item in &evidence {
            if item.event_seq == 0 || item.event_seq > last_seq {
                return Err(Error::InsufficientEvidence {
                    todo: id.to_string(),
                    missing: vec![format!(
                        "event seq {} is not in this session's trace",
                        item.event_seq
                    )],
                });
            }
            if !self.trace.artifacts().contains(&item.artifact) {
                return Err(Error::InsufficientEvidence {
                    todo: id.to_string(),
                    missing: vec![format!("artifact {} not found", item.artifact)],
                });
            }
        }

        let seq = self.record_transition(
            id,
            "claim",
            json!({
                "evidence": evidence
                    .iter()
                    .map(|e| json!({
                        "criterion": e.criterion,
                        "artifact": e.artifact.as_str(),
                        "event_seq": e.event_seq,
                    }))
                    .collect::<Vec<_>>(),
            }),
        )?;
        let mut todos = self.lock()?;
        let todo = Self::find_mut(&mut todos, id)?;
        todo.status = TodoStatus::Claimed;
        todo.claimed_seq = Some(seq);
        todo.evidence = evidence;
        Ok(())
    }

    /// `claimed -> verified`. Harness only; the harness records its criterion
    /// evaluations as events before calling this.
    pub fn verify(&self, actor: Actor, id: &TodoId) -> Result<()> {
        if actor != Actor::Harness {
            return Err(Error::UnauthorizedTransition {
                actor: actor.to_string(),
                transition: "verify".to_string(),
            });
        }
        {
            let mut todos = self.lock()?;
            let todo = Self::find_mut(&mut todos, id)?;
            if todo.status != TodoStatus::Claimed {
                return Err(Error::InvalidTransition {
                    from: todo.status.to_string(),
                    to: TodoStatus::Verified.to_string(),
                });
            }
        }
        let seq = self.record_transition(id, "verify", json!({}))?;
        let mut todos = self.lock()?;
        let todo = Self::find_mut(&mut todos, id)?;
        todo.status = TodoStatus::Verified;
        todo.verified_seq = Some(seq);
        Ok(())
    }

    /// `claimed -> in_progress`: the single permitted reversal, on verifier
    /// rejection. Harness only. Evidence is discarded; the next claim must
    /// bind fresh observations.
    pub fn reject(&self, actor: Actor, id: &TodoId, reasons: Vec<String>) -> Result<()> {
        if actor != Actor::Harness {
            return Err(Error::UnauthorizedTransition {
                actor: actor.to_string(),
                transition: "reject".to_string(),
            });
        }
        {
            let mut todos = self.lock()?;
            let todo = Self::find_mut(&mut todos, id)?;
            if todo.status != TodoStatus::Claimed {
                return Err(Error::InvalidTransition {
                    from: todo.status.to_string(),
                    to: TodoStatus::InProgress.to_string(),
                });
            }
        }
        let seq = self.record_transition(
            id,
            "verifier_rejection",
            json!({ "reasons": reasons }),
        )?;
        let mut todos = self.lock()?;
        let todo = Self::find_mut(&mut todos, id)?;
        todo.status = TodoStatus::InProgress;
        todo.started_seq = Some(seq);
        todo.claimed_seq = None;
        todo.evidence.clear();
        todo.rejections += 1;
        Ok(())
    }

    fn find_mut<'a>(todos: &'a mut [Todo], id: &TodoId) -> Result<&'a mut Todo> {
        todos
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| Error::NotFound(format!("todo {}", id)))
    }

    /// Read-only snapshot of all todos.
    pub fn list(&self) -> Result<Vec<Todo>> {
        Ok(self.lock()?.clone())
    }

    /// Read-only lookup.
    pub fn get(&self, id: &TodoId) -> Result<Option<Todo>> {
        Ok(self.lock()?.iter().find(|t| &t.id == id).cloned())
    }

    /// Todos currently in the given status.
    pub fn in_status(&self, status: TodoStatus) -> Result<Vec<Todo>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    /// Whether every todo has been verified.
    pub fn all_verified(&self) -> Result<bool> {
        Ok(self
            .lock()?
            .iter()
            .all(|t| t.status == TodoStatus::Verified))
    }
}
