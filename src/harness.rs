//! The verification harness: the sole authority that may promote a todo to
//! `verified`.
//!
//! The harness is an independent loop, not part of the agent. It picks up
//! todos in `claimed`, re-evaluates every acceptance criterion itself
//! (running commands, checking files, matching regexes), and either advances
//! the todo or rejects it with reasons. It is stateless between todos and
//! never sees the agent's LLM context, which is what breaks the
//! self-confirmation bias: the agent's belief that a criterion holds counts
//! for nothing here.

use glob::glob;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::session::{SessionId, SessionStatus};
use crate::todo::{AcceptanceCriterion, Actor, CriterionKind, EvidenceRef, Todo, TodoList, TodoStatus};
use crate::trace::{EventKind, TraceStore};

/// A named verifier callback: receives the bound evidence artifact's content
/// and decides whether the criterion holds.
pub type VerifierCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Outcome of evaluating one criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct CriterionOutcome {
    pub criterion: usize,
    pub passed: bool,
    pub reason: Option<String>,
}

/// Independent verifier for one session's claims.
pub struct VerificationHarness {
    trace: Arc<TraceStore>,
    session: SessionId,
    workspace: PathBuf,
    command_timeout: Duration,
    callbacks: HashMap<String, VerifierCallback>,
}

impl VerificationHarness {
    pub fn new(trace: Arc<TraceStore>, session: SessionId, workspace: impl Into<PathBuf>) -> Self {
        Self {
            trace,
            session,
            workspace: workspace.into(),
            command_timeout: Duration::from_secs(120),
            callbacks: HashMap::new(),
        }
    }

    /// Register a named callback usable by `verifier-callback` criteria.
    pub fn with_callback(mut self, name: impl Into<String>, callback: VerifierCallback) -> Self {
        self.callbacks.insert(name.into(), callback);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Process every claimed todo once. Returns how many were examined.
    pub async fn run_once(&self, todos: &TodoList) -> Result<usize> {
        let claimed = todos.in_status(TodoStatus::Claimed)?;
        let examined = claimed.len();

        for todo in claimed {
            let outcomes = self.evaluate_todo(&todo).await?;

            for outcome in &outcomes {
                self.trace.append_event(
                    &self.session,
                    EventKind::StateTransition,
                    json!({
                        "transition": "harness_evaluation",
                        "todo": todo.id.to_string(),
                        "criterion": outcome.criterion,
                        "passed": outcome.passed,
                        "reason": outcome.reason,
                    }),
                    None,
                )?;
            }

            if outcomes.iter().all(|o| o.passed) {
                todos.verify(Actor::Harness, &todo.id)?;
                tracing::info!(todo = %todo.id, "todo verified");
            } else {
                let reasons: Vec<String> = outcomes
                    .iter()
                    .filter(|o| !o.passed)
                    .map(|o| {
                        o.reason
                            .clone()
                            .unwrap_or_else(|| format!("criterion {} failed", o.criterion))
                    })
                    .collect();
                tracing::info!(todo = %todo.id, ?reasons, "todo rejected");
                todos.reject(Actor::Harness, &todo.id, reasons)?;
            }
        }

        Ok(examined)
    }

    /// Poll for claims until the session reaches a terminal status.
    pub async fn run_until_terminal(&self, todos: &TodoList, poll: Duration) -> Result<()> {
        loop {
            self.run_once(todos).await?;
            match self.trace.get_session(&self.session)? {
                Some(manifest) if !manifest.status.is_terminal() => {
                    tokio::time::sleep(poll).await;
                }
                _ => return Ok(()),
            }
        }
    }

    /// Evaluate every criterion of one todo against its bound evidence.
    async fn evaluate_todo(&self, todo: &Todo) -> Result<Vec<CriterionOutcome>> {
        let mut outcomes = Vec::new();
        for (index, criterion) in todo.criteria.iter().enumerate() {
            let bindings: Vec<&EvidenceRef> = todo
                .evidence
                .iter()
                .filter(|e| e.criterion == index)
                .collect();
            outcomes.push(self.evaluate(todo, index, criterion, &bindings).await);
        }
        Ok(outcomes)
    }

    async fn evaluate(
        &self,
        todo: &Todo,
        index: usize,
        criterion: &AcceptanceCriterion,
        bindings: &[&EvidenceRef],
    ) -> CriterionOutcome {
        // Evidence recorded before the todo was (re)started proves nothing
        // about the work done since
        let started = todo.started_seq.unwrap_or(todo.created_seq);
        if let Some(stale) = bindings.iter().find(|e| e.event_seq <= started) {
            return CriterionOutcome {
                criterion: index,
                passed: false,
                reason: Some(format!(
                    "stale-evidence: event {} predates the todo's activation at {}",
                    stale.event_seq, started
                )),
            };
        }

        let result = match criterion.kind {
            CriterionKind::CommandExitZero | CriterionKind::TestPasses => {
                self.run_command(&criterion.expectation).await
            }
            CriterionKind::FileExists => self.check_file_exists(&criterion.expectation),
            CriterionKind::RegexMatches => self.check_regex(&criterion.expectation, bindings),
            CriterionKind::VerifierCallback => self.run_callback(&criterion.expectation, bindings),
        };

        match result {
            Ok(()) => CriterionOutcome {
                criterion: index,
                passed: true,
                reason: None,
            },
            Err(error) => CriterionOutcome {
                criterion: index,
                passed: false,
                reason: Some(error.to_string()),
            },
        }
    }

    /// Re-run the command in the workspace; passes iff it exits zero.
    async fn run_command(&self, command_line: &str) -> Result<()> {
        let program = command_line
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::Config("empty command".to_string()))?;
        which::which(program)
            .map_err(|_| Error::Config(format!("command '{}' not found", program)))?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .current_dir(&self.workspace)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let status = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| Error::timeout(self.command_timeout.as_millis() as u64))?
            .map_err(|e| Error::Config(format!("spawn '{}': {}", command_line, e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "'{}' exited with {}",
                command_line,
                status.code().unwrap_or(-1)
            )))
        }
    }

    fn check_file_exists(&self, pattern: &str) -> Result<()> {
        let full = self.workspace.join(pattern);
        let rendered = full.to_string_lossy().to_string();
        let mut matches = glob(&rendered)
            .map_err(|e| Error::Config(format!("bad file pattern '{}': {}", pattern, e)))?;
        if matches.any(|m| m.is_ok()) {
            Ok(())
        } else {
            Err(Error::Config(format!("no file matches '{}'", pattern)))
        }
    }

    fn check_regex(&self, pattern: &str, bindings: &[&EvidenceRef]) -> Result<()> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| Error::Config(format!("bad regex '{}': {}", pattern, e)))?;
        if bindings.is_empty() {
            return Err(Error::Config("no evidence bound to regex criterion".to_string()));
        }
        for binding in bindings {
            let content = self.trace.get_artifact_string(&binding.artifact)?;
            if re.is_match(&content) {
                return Ok(());
            }
        }
        Err(Error::Config(format!(
            "no bound evidence matches /{}/",
            pattern
        )))
    }

    fn run_callback(&self, name: &str, bindings: &[&EvidenceRef]) -> Result<()> {
        let callback = self
            .callbacks
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown verifier callback '{}'", name)))?;
        for binding in bindings {
            let content = self.trace.get_artifact_string(&binding.artifact)?;
            if callback(&content) {
                return Ok(());
            }
        }
        Err(Error::Config(format!(
            "callback '{}' rejected all bound evidence",
            name
        )))
    }
}

/// Convenience: keep verifying until the session ends (used by the CLI,
/// which runs the harness alongside the agent loop).
pub async fn attach(
    trace: Arc<TraceStore>,
    session: SessionId,
    workspace: PathBuf,
    todos: Arc<TodoList>,
) -> Result<()> {
    let harness = VerificationHarness::new(trace.clone(), session.clone(), workspace);
    harness
        .run_until_terminal(&todos, Duration::from_millis(250))
        .await?;
    // Surface whether the session ended with everything verified
    if let Some(manifest) = trace.get_session(&session)? {
        if manifest.status == SessionStatus::Completed && !todos.all_verified()? {
            return Err(Error::Internal(
                "session completed with unverified todos".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::todo::AcceptanceCriterion;

    struct Fixture {
        trace: Arc<TraceStore>,
        todos: TodoList,
        session: SessionId,
        _dir: tempfile::TempDir,
        workspace: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_path_buf();
        let trace = Arc::new(TraceStore::in_memory().unwrap());
        let session = Session::new("goal", &workspace);
        trace.create_session(&session).unwrap();
        let todos = TodoList::new(session.id.clone(), Arc::clone(&trace));
        Fixture {
            trace,
            todos,
            session: session.id,
            _dir: dir,
            workspace,
        }
    }

    impl Fixture {
        fn harness(&self) -> VerificationHarness {
            VerificationHarness::new(
                Arc::clone(&self.trace),
                self.session.clone(),
                self.workspace.clone(),
            )
        }

        /// Record an observation event and bind it as evidence.
        fn observe(&self, content: &[u8], criterion: usize) -> EvidenceRef {
            let artifact = self.trace.put_artifact(content).unwrap();
            let event = self
                .trace
                .append_event(
                    &self.session,
                    EventKind::ToolResult,
                    json!({"tool": "bash", "artifact": artifact.as_str()}),
                    None,
                )
                .unwrap();
            EvidenceRef {
                criterion,
                artifact,
                event_seq: event.seq,
            }
        }

        fn claimed_todo(&self, criteria: Vec<AcceptanceCriterion>) -> crate::todo::TodoId {
            let id = self.todos.create("todo", criteria).unwrap();
            self.todos.start(Actor::Agent, &id).unwrap();
            let evidence: Vec<EvidenceRef> = (0..self.todos.get(&id).unwrap().unwrap().criteria.len())
                .map(|i| self.observe(b"observation", i))
                .collect();
            self.todos.claim(Actor::Agent, &id, evidence).unwrap();
            id
        }
    }

    #[tokio::test]
    async fn test_command_exit_zero_verifies() {
        let f = fixture();
        let id = f.claimed_todo(vec![AcceptanceCriterion::new(
            CriterionKind::CommandExitZero,
            "true",
        )]);

        f.harness().run_once(&f.todos).await.unwrap();
        assert_eq!(
            f.todos.get(&id).unwrap().unwrap().status,
            TodoStatus::Verified
        );
    }

    #[tokio::test]
    async fn test_failing_command_rejects() {
        let f = fixture();
        let id = f.claimed_todo(vec![AcceptanceCriterion::new(
            CriterionKind::CommandExitZero,
            "false",
        )]);

        f.harness().run_once(&f.todos).await.unwrap();
        let todo = f.todos.get(&id).unwrap().unwrap();
        assert_eq!(todo.status, TodoStatus::InProgress);
        assert_eq!(todo.rejections, 1);
    }

    #[tokio::test]
    async fn test_file_exists_criterion() {
        let f = fixture();
        std::fs::write(f.workspace.join("result.txt"), "ok").unwrap();

        let id = f.claimed_todo(vec![AcceptanceCriterion::new(
            CriterionKind::FileExists,
            "result.txt",
        )]);
        f.harness().run_once(&f.todos).await.unwrap();
        assert_eq!(
            f.todos.get(&id).unwrap().unwrap().status,
            TodoStatus::Verified
        );

        let missing = f.claimed_todo(vec![AcceptanceCriterion::new(
            CriterionKind::FileExists,
            "no-such-*.log",
        )]);
        f.harness().run_once(&f.todos).await.unwrap();
        assert_eq!(
            f.todos.get(&missing).unwrap().unwrap().status,
            TodoStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_regex_matches_bound_evidence() {
        let f = fixture();
        let id = f.todos.create(
            "t",
            vec![AcceptanceCriterion::new(
                CriterionKind::RegexMatches,
                r"\d+ passed",
            )],
        )
        .unwrap();
        f.todos.start(Actor::Agent, &id).unwrap();
        let evidence = f.observe(b"===== 3 passed in 0.2s =====", 0);
        f.todos.claim(Actor::Agent, &id, vec![evidence]).unwrap();

        f.harness().run_once(&f.todos).await.unwrap();
        assert_eq!(
            f.todos.get(&id).unwrap().unwrap().status,
            TodoStatus::Verified
        );
    }

    #[tokio::test]
    async fn test_stale_evidence_rejected_with_reason() {
        let f = fixture();

        // Observation recorded before the todo even exists
        let stale = f.observe(b"old test output: 1 passed", 0);

        let id = f
            .todos
            .create(
                "t",
                vec![AcceptanceCriterion::new(CriterionKind::CommandExitZero, "true")],
            )
            .unwrap();
        f.todos.start(Actor::Agent, &id).unwrap();
        f.todos.claim(Actor::Agent, &id, vec![stale]).unwrap();

        f.harness().run_once(&f.todos).await.unwrap();
        let todo = f.todos.get(&id).unwrap().unwrap();
        assert_eq!(todo.status, TodoStatus::InProgress);

        // The rejection reason names the staleness
        let transitions = f
            .trace
            .query_by_kind(&f.session, &[EventKind::StateTransition])
            .unwrap();
        let rejection = transitions
            .iter()
            .find(|e| e.payload_str("transition") == Some("verifier_rejection"))
            .unwrap();
        assert!(rejection.payload["reasons"][0]
            .as_str()
            .unwrap()
            .contains("stale-evidence"));
    }

    #[tokio::test]
    async fn test_callback_criterion() {
        let f = fixture();
        let id = f.claimed_todo(vec![AcceptanceCriterion::new(
            CriterionKind::VerifierCallback,
            "looks-good",
        )]);

        let harness = f.harness().with_callback(
            "looks-good",
            Arc::new(|content: &str| content.contains("observation")),
        );
        harness.run_once(&f.todos).await.unwrap();
        assert_eq!(
            f.todos.get(&id).unwrap().unwrap().status,
            TodoStatus::Verified
        );
    }

    #[tokio::test]
    async fn test_evaluations_recorded_before_verify() {
        let f = fixture();
        let id = f.claimed_todo(vec![AcceptanceCriterion::new(
            CriterionKind::CommandExitZero,
            "true",
        )]);
        f.harness().run_once(&f.todos).await.unwrap();

        let transitions = f
            .trace
            .query_by_kind(&f.session, &[EventKind::StateTransition])
            .unwrap();
        let evaluation = transitions
            .iter()
            .find(|e| e.payload_str("transition") == Some("harness_evaluation"))
            .unwrap();
        let verify = transitions
            .iter()
            .find(|e| {
                e.payload_str("transition") == Some("verify")
                    && e.payload_str("todo") == Some(id.to_string().as_str())
            })
            .unwrap();
        assert!(evaluation.seq < verify.seq);
    }
}
