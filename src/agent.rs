//! The agent loop: drives the LLM turn-by-turn until completion, pause, or
//! failure.
//!
//! Each turn assembles the prompt from recorded state (the conversation is a
//! pure function of the event log, so resumed sessions build byte-identical
//! prompts), records the request and the verbatim response as artifacts,
//! validates every tool call against the mode mask, phase mask, parameter
//! schema, and budget rules, and dispatches the valid ones through the
//! rollout orchestrator. Completion is gated on the todo list: `complete`
//! succeeds only when every todo has been verified by the harness and every
//! entered phase's exit criteria were satisfied.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::checkpoint::{messages_from_events, CheckpointSnapshot};
use crate::error::{Error, ErrorCategory, ErrorEnvelope, Result};
use crate::llm::{ChatMessage, CompletionRequest, LlmClient, ToolCallRequest};
use crate::phase::{Phase, PhaseTracker, ThinkBudget, ToolCategory};
use crate::rollout::{BatchMode, CallOutcome, RolloutOrchestrator, ToolCall};
use crate::session::{SessionContext, SessionStatus};
use crate::todo::{AcceptanceCriterion, Actor, CriterionKind, EvidenceRef, TodoId, TodoList};
use crate::tools::{check_visible, is_meta, prompt_schemas};
use crate::trace::{ArtifactId, CorrelationId, EventKind, SpanId};

/// Built-in todo and phase tools handled inline by the loop.
const BUILTIN_TOOLS: [&str; 6] = [
    "todo_create",
    "todo_start",
    "todo_claim",
    "todo_list",
    "todo_get",
    "phase_transition",
];

fn is_builtin(name: &str) -> bool {
    is_meta(name) || BUILTIN_TOOLS.contains(&name)
}

/// How a `run` call ended (failures surface as errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Paused,
}

enum TurnOutcome {
    Continue,
    Completed,
}

/// Per-session driver.
pub struct AgentLoop {
    ctx: SessionContext,
    client: Arc<dyn LlmClient>,
    orchestrator: Arc<RolloutOrchestrator>,
    todos: Arc<TodoList>,
    tracker: PhaseTracker,
    think: ThinkBudget,
    latency: crate::phase::LatencyBudget,
    mode: String,
    pending_mode: Option<String>,
    pause: Arc<AtomicBool>,
    seed_messages: Vec<ChatMessage>,
    seen_call_hashes: HashSet<String>,
    stale_turns: usize,
    turn: u32,
    goal: String,
}

impl AgentLoop {
    /// Start a loop for a freshly created session.
    pub fn new(
        ctx: SessionContext,
        client: Arc<dyn LlmClient>,
        orchestrator: Arc<RolloutOrchestrator>,
    ) -> Result<Self> {
        let manifest = ctx
            .trace
            .get_session(&ctx.session)?
            .ok_or_else(|| Error::NotFound(format!("session {}", ctx.session)))?;

        let seed_messages = Self::seed_from_lineage(&ctx)?;

        if manifest.last_seq == 0 {
            ctx.trace.append_event(
                &ctx.session,
                EventKind::HumanInput,
                json!({"message": manifest.goal}),
                None,
            )?;
        }

        let todos = Arc::new(TodoList::new(ctx.session.clone(), Arc::clone(&ctx.trace)));
        Ok(Self {
            think: ThinkBudget::new(ctx.config.think_limit),
            latency: crate::phase::LatencyBudget::new(ctx.config.latency_limit),
            mode: manifest.mode.clone(),
            goal: manifest.goal.clone(),
            ctx,
            client,
            orchestrator,
            todos,
            tracker: PhaseTracker::new(),
            pending_mode: None,
            pause: Arc::new(AtomicBool::new(false)),
            seed_messages,
            seen_call_hashes: HashSet::new(),
            stale_turns: 0,
            turn: 0,
        })
    }

    /// Resume a loop from a checkpoint snapshot.
    pub fn resume(
        ctx: SessionContext,
        client: Arc<dyn LlmClient>,
        orchestrator: Arc<RolloutOrchestrator>,
        snapshot: CheckpointSnapshot,
    ) -> Result<Self> {
        let progress = snapshot
            .phase_progress
            .iter()
            .filter_map(|(name, p)| Phase::parse(name).map(|phase| (phase, *p)))
            .collect();
        let tracker = PhaseTracker::restore(
            snapshot.phase,
            progress,
            snapshot.phases_entered.clone(),
        );

        let todos = Arc::new(TodoList::restore(
            ctx.session.clone(),
            Arc::clone(&ctx.trace),
            snapshot.todos.clone(),
        ));

        ctx.trace
            .set_status(&ctx.session, SessionStatus::Running)?;
        ctx.trace.append_event(
            &ctx.session,
            EventKind::StateTransition,
            json!({"transition": "resumed", "last_seq": snapshot.last_seq}),
            None,
        )?;

        // Calls pending at the snapshot are marked cancelled rather than
        // silently dropped
        for call in &snapshot.pending_calls {
            ctx.trace.append_event(
                &ctx.session,
                EventKind::Error,
                json!({
                    "correlation": call.correlation.to_string(),
                    "tool": call.name,
                    "envelope": ErrorEnvelope::new(
                        ErrorCategory::Cancelled,
                        "pending at checkpoint; cancelled on resume",
                    )
                    .not_recoverable()
                    .to_json(),
                    "llm_call_id": call.llm_call_id,
                }),
                None,
            )?;
        }

        let seed_messages = Self::seed_from_lineage(&ctx)?;

        Ok(Self {
            think: snapshot.think_budget,
            latency: snapshot.latency_budget,
            mode: snapshot.mode.clone(),
            goal: snapshot.goal.clone(),
            ctx,
            client,
            orchestrator,
            todos,
            tracker,
            pending_mode: None,
            pause: Arc::new(AtomicBool::new(false)),
            seed_messages,
            seen_call_hashes: HashSet::new(),
            stale_turns: 0,
            turn: 0,
        })
    }

    fn seed_from_lineage(ctx: &SessionContext) -> Result<Vec<ChatMessage>> {
        Ok(ctx
            .trace
            .lineage_of(&ctx.session)?
            .map(|(_, checkpoint)| crate::checkpoint::load_snapshot(&ctx.trace, &checkpoint))
            .transpose()?
            .map(|snapshot| snapshot.messages)
            .unwrap_or_default())
    }

    /// Handle for requesting a pause; honored at the next turn boundary.
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pause)
    }

    /// The session's todo list (shared with the verification harness).
    pub fn todos(&self) -> Arc<TodoList> {
        Arc::clone(&self.todos)
    }

    /// Drive the session until completion, pause, or failure.
    pub async fn run(&mut self) -> Result<SessionOutcome> {
        match self.drive().await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                // System errors abort the session; record what we can
                let _ = self.ctx.trace.append_event(
                    &self.ctx.session,
                    EventKind::Error,
                    json!({"message": error.to_string(), "fatal": true}),
                    None,
                );
                let _ = self
                    .ctx
                    .trace
                    .set_status(&self.ctx.session, SessionStatus::Failed);
                Err(error)
            }
        }
    }

    async fn drive(&mut self) -> Result<SessionOutcome> {
        loop {
            if self.pause_requested()? {
                self.write_checkpoint()?;
                self.ctx
                    .trace
                    .set_status(&self.ctx.session, SessionStatus::Paused)?;
                return Ok(SessionOutcome::Paused);
            }
            if self.turn >= self.ctx.config.max_turns {
                return Err(Error::Internal(format!(
                    "turn limit {} reached without completion",
                    self.ctx.config.max_turns
                )));
            }
            match self.run_turn().await? {
                TurnOutcome::Continue => {}
                TurnOutcome::Completed => return Ok(SessionOutcome::Completed),
            }
        }
    }

    fn pause_requested(&self) -> Result<bool> {
        if self.pause.load(Ordering::SeqCst) {
            return Ok(true);
        }
        // An external `pause <session-id>` flips the manifest
        let manifest = self
            .ctx
            .trace
            .get_session(&self.ctx.session)?
            .ok_or_else(|| Error::NotFound(format!("session {}", self.ctx.session)))?;
        Ok(manifest.status == SessionStatus::Paused)
    }

    /// Snapshot current state and write a checkpoint.
    pub fn write_checkpoint(&self) -> Result<ArtifactId> {
        let snapshot = self.make_snapshot()?;
        let (artifact, _) =
            crate::checkpoint::write_snapshot(&self.ctx.trace, &self.ctx.session, &snapshot)?;
        Ok(artifact)
    }

    fn make_snapshot(&self) -> Result<CheckpointSnapshot> {
        let phase_progress: BTreeMap<String, _> = self
            .tracker
            .progress()
            .iter()
            .map(|(phase, progress)| (phase.as_str().to_string(), *progress))
            .collect();

        Ok(CheckpointSnapshot {
            session: self.ctx.session.to_string(),
            goal: self.goal.clone(),
            workspace: self
                .ctx
                .trace
                .get_session(&self.ctx.session)?
                .map(|s| s.workspace)
                .unwrap_or_default(),
            phase: self.tracker.current(),
            mode: self.mode.clone(),
            messages: self.assemble_messages()?,
            todos: self.todos.list()?,
            phase_progress,
            phases_entered: self.tracker.entered().to_vec(),
            think_budget: self.think,
            latency_budget: self.latency,
            pending_calls: Vec::new(),
            last_seq: self.ctx.trace.last_seq(&self.ctx.session)?,
            rng_seed: None,
        })
    }

    fn assemble_messages(&self) -> Result<Vec<ChatMessage>> {
        let events = self.ctx.trace.iterate(&self.ctx.session, 1, None)?;
        messages_from_events(&self.ctx.trace, &self.seed_messages, &events)
    }

    /// Deterministic system prompt: a pure function of phase, mode, todos,
    /// and recent observations, so resume reproduces it exactly.
    fn system_prompt(&self) -> Result<String> {
        let mut prompt = String::new();
        prompt.push_str(
            "You are CompyMac, a software-engineering agent. Every reply must \
             invoke at least one tool. Claims of completion are verified \
             independently: create todos with machine-checkable acceptance \
             criteria, claim them with evidence, and call complete only when \
             everything is verified.\n",
        );
        prompt.push_str(&format!("\nGoal: {}\n", self.goal));
        prompt.push_str(&format!(
            "Phase: {} (exit criteria {}). Mode: {}.\n",
            self.tracker.current(),
            if self.tracker.exit_criteria_met(self.tracker.current()) {
                "satisfied"
            } else {
                "not yet satisfied"
            },
            self.mode,
        ));

        let todos = self.todos.list()?;
        if todos.is_empty() {
            prompt.push_str("\nTodos: none yet.\n");
        } else {
            let transitions = self
                .ctx
                .trace
                .query_by_kind(&self.ctx.session, &[EventKind::StateTransition])?;
            prompt.push_str("\nTodos:\n");
            for todo in &todos {
                prompt.push_str(&format!(
                    "- [{}] {} ({})",
                    todo.status, todo.title, todo.id
                ));
                // Rejected claims carry the verifier's reasons back to the LLM
                if todo.rejections > 0 {
                    let id = todo.id.to_string();
                    if let Some(rejection) = transitions
                        .iter()
                        .rev()
                        .find(|e| {
                            e.payload_str("transition") == Some("verifier_rejection")
                                && e.payload_str("todo") == Some(id.as_str())
                        })
                    {
                        prompt.push_str(&format!(
                            " last rejection: {}",
                            rejection.payload.get("reasons").cloned().unwrap_or_default()
                        ));
                    }
                }
                prompt.push('\n');
            }
        }

        // Recent observations the model may cite as evidence
        let results = self
            .ctx
            .trace
            .query_by_kind(&self.ctx.session, &[EventKind::ToolResult])?;
        if !results.is_empty() {
            prompt.push_str("\nRecent observations (cite event_seq in todo_claim evidence):\n");
            for event in results.iter().rev().take(8).rev() {
                prompt.push_str(&format!(
                    "- event_seq={} tool={} exit_code={}\n",
                    event.seq,
                    event.payload_str("tool").unwrap_or("?"),
                    event
                        .payload
                        .get("exit_code")
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "null".to_string()),
                ));
            }
        }
        Ok(prompt)
    }

    fn builtin_schemas() -> Vec<Value> {
        vec![
            json!({
                "name": "todo_create",
                "description": "Create a todo with machine-checkable acceptance criteria.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string", "description": "What must be done"},
                        "criteria": {
                            "type": "array",
                            "description": "Acceptance criteria: {kind, expectation}. Kinds: command-exit-zero, file-exists, test-passes, regex-matches, verifier-callback."
                        }
                    },
                    "required": ["title", "criteria"]
                }
            }),
            json!({
                "name": "todo_start",
                "description": "Move a pending todo to in_progress.",
                "input_schema": {
                    "type": "object",
                    "properties": {"id": {"type": "string", "description": "Todo id"}},
                    "required": ["id"]
                }
            }),
            json!({
                "name": "todo_claim",
                "description": "Claim an in_progress todo as done, binding each criterion to an observed tool result. Verification happens independently.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string", "description": "Todo id"},
                        "evidence": {
                            "type": "array",
                            "description": "Bindings: {criterion: index, event_seq: observed TOOL_RESULT sequence number}"
                        }
                    },
                    "required": ["id", "evidence"]
                }
            }),
            json!({
                "name": "todo_list",
                "description": "List todos and their statuses.",
                "input_schema": {"type": "object", "properties": {}, "required": []}
            }),
            json!({
                "name": "todo_get",
                "description": "Get one todo with criteria and evidence.",
                "input_schema": {
                    "type": "object",
                    "properties": {"id": {"type": "string", "description": "Todo id"}},
                    "required": ["id"]
                }
            }),
            json!({
                "name": "phase_transition",
                "description": "Advance to another phase (localize, understand, fix, regression_check, verify). Requires the current phase's exit criteria.",
                "input_schema": {
                    "type": "object",
                    "properties": {"to": {"type": "string", "description": "Target phase"}},
                    "required": ["to"]
                }
            }),
        ]
    }

    async fn run_turn(&mut self) -> Result<TurnOutcome> {
        // Mode changes requested last turn take effect now
        if let Some(mode) = self.pending_mode.take() {
            self.ctx.trace.append_event(
                &self.ctx.session,
                EventKind::StateTransition,
                json!({"transition": "mode_change", "from": self.mode, "to": mode}),
                None,
            )?;
            self.ctx.trace.set_mode(&self.ctx.session, &mode)?;
            self.mode = mode;
        }

        let turn_span = self.ctx.trace.open_span(
            &self.ctx.session,
            "turn",
            None,
            json!({"turn": self.turn}),
        )?;

        let messages = self.assemble_messages()?;
        let mut tools = prompt_schemas(&self.ctx.registry, &self.mode, self.tracker.current());
        tools.extend(Self::builtin_schemas());

        let request = CompletionRequest::new()
            .with_system(self.system_prompt()?)
            .with_messages(messages)
            .with_tools(tools)
            .with_max_tokens(4096);

        let prompt_artifact = self
            .ctx
            .trace
            .put_artifact(&serde_json::to_vec(&request)?)?;
        self.ctx.trace.append_event(
            &self.ctx.session,
            EventKind::LlmRequest,
            json!({"artifact": prompt_artifact.as_str(), "turn": self.turn}),
            Some(&turn_span),
        )?;

        let response = match self.client.complete(request).await {
            Ok(response) => response,
            Err(error) => {
                self.ctx.trace.append_event(
                    &self.ctx.session,
                    EventKind::Error,
                    json!({"message": error.to_string(), "source": "llm"}),
                    Some(&turn_span),
                )?;
                self.ctx
                    .trace
                    .close_span(&self.ctx.session, &turn_span, "error", json!({}))?;
                return Err(error);
            }
        };

        // Verbatim capture is mandatory for deterministic replay
        let response_artifact = self.ctx.trace.put_artifact(response.raw.as_bytes())?;
        self.ctx.trace.append_event(
            &self.ctx.session,
            EventKind::LlmResponse,
            json!({
                "artifact": response_artifact.as_str(),
                "content": response.content,
                "tool_calls": response.tool_calls,
                "model": response.model,
                "usage": response.usage,
            }),
            Some(&turn_span),
        )?;

        if response.tool_calls.is_empty() {
            // Prose-only turns are rejected with a structured prompt-back
            self.ctx.trace.append_event(
                &self.ctx.session,
                EventKind::HumanInput,
                json!({
                    "message": json!({
                        "error": "no_tool_call",
                        "detail": "every turn must carry at least one tool call",
                    })
                    .to_string(),
                    "synthetic": true,
                }),
                Some(&turn_span),
            )?;
            self.latency.note_turn(false);
            self.finish_turn(&turn_span, false)?;
            return Ok(TurnOutcome::Continue);
        }

        let novel = self.observe_novelty(&response.tool_calls);

        let mut registry_calls: Vec<ToolCall> = Vec::new();
        let mut completed = false;
        let mut had_state_change = false;

        for call in &response.tool_calls {
            match self.validate_call(call) {
                Err(error) => {
                    self.reject_call(&turn_span, call, &error)?;
                    continue;
                }
                Ok(category) => {
                    if is_builtin(&call.name) {
                        let done = self.run_builtin(&turn_span, call, category)?;
                        if done {
                            completed = true;
                        }
                    } else {
                        registry_calls.push(
                            ToolCall::new(call.name.clone(), call.arguments.clone())
                                .with_llm_call_id(call.id.clone()),
                        );
                    }
                }
            }
        }

        if completed {
            self.ctx.trace.append_event(
                &self.ctx.session,
                EventKind::StateTransition,
                json!({"transition": "completed"}),
                Some(&turn_span),
            )?;
            self.finish_turn(&turn_span, true)?;
            self.ctx
                .trace
                .set_status(&self.ctx.session, SessionStatus::Completed)?;
            return Ok(TurnOutcome::Completed);
        }

        if !registry_calls.is_empty() {
            let batch = self
                .orchestrator
                .execute(&self.ctx, Some(&turn_span), registry_calls, BatchMode::WaitAll)
                .await?;

            for result in &batch.results {
                let spec = match self.ctx.registry.get(&result.call.name) {
                    Some(tool) => tool.spec().clone(),
                    None => continue,
                };
                if let CallOutcome::Success(output) = &result.outcome {
                    self.tracker.record(spec.category);
                    if spec.category.is_state_changing() && output.is_success() {
                        had_state_change = true;
                    }
                    // The single back-edge: a failing verification test
                    // returns the session to FIX
                    if self.tracker.current() == Phase::Verify
                        && spec.category == ToolCategory::BashTests
                        && !output.is_success()
                    {
                        self.transition_phase(&turn_span, Phase::Fix)?;
                    }
                }
            }
        }

        self.latency.note_turn(had_state_change);
        self.detect_stuckness(&turn_span, novel)?;
        self.finish_turn(&turn_span, true)?;
        Ok(TurnOutcome::Continue)
    }

    fn finish_turn(&mut self, turn_span: &SpanId, ok: bool) -> Result<()> {
        self.ctx.trace.close_span(
            &self.ctx.session,
            turn_span,
            if ok { "ok" } else { "error" },
            json!({}),
        )?;
        self.turn += 1;
        Ok(())
    }

    /// Validate a call against the masks, its schema, and the budgets.
    /// Returns the call's category when valid.
    fn validate_call(&mut self, call: &ToolCallRequest) -> Result<ToolCategory> {
        let category = if is_builtin(&call.name) {
            match call.name.as_str() {
                "think" => ToolCategory::Think,
                "complete" => ToolCategory::Complete,
                _ => ToolCategory::Meta,
            }
        } else {
            check_visible(
                &self.ctx.registry,
                &call.name,
                &self.mode,
                self.tracker.current(),
            )?;
            let tool = self
                .ctx
                .registry
                .get(&call.name)
                .ok_or_else(|| Error::masked(&call.name, "no such tool"))?;
            let violations = tool.spec().validate_args(&call.arguments);
            if !violations.is_empty() {
                return Err(Error::SchemaViolation {
                    tool: call.name.clone(),
                    violations,
                });
            }
            tool.spec().category
        };

        if category == ToolCategory::Think {
            if let Err(error) = self.think.record_think() {
                self.ctx.trace.append_event(
                    &self.ctx.session,
                    EventKind::StateTransition,
                    json!({"transition": "budget_exhausted", "resource": "think"}),
                    None,
                )?;
                return Err(error);
            }
        } else {
            self.latency.validate(category, self.tracker.current())?;
            self.think.record_other();
        }

        Ok(category)
    }

    /// Record an invalid call's structured rejection so the LLM sees it as
    /// the call's result on the next turn.
    fn reject_call(
        &self,
        turn_span: &SpanId,
        call: &ToolCallRequest,
        error: &Error,
    ) -> Result<()> {
        if error.is_fatal() {
            return Err(Error::Internal(format!(
                "fatal error during validation: {}",
                error
            )));
        }
        let envelope = ErrorEnvelope::from_error(error);
        self.ctx.trace.append_event(
            &self.ctx.session,
            EventKind::Error,
            json!({
                "correlation": CorrelationId::new().to_string(),
                "tool": call.name,
                "envelope": envelope.to_json(),
                "llm_call_id": call.id,
            }),
            Some(turn_span),
        )?;
        Ok(())
    }

    /// Execute a meta or todo tool inline. Returns true when `complete`
    /// succeeded.
    fn run_builtin(
        &mut self,
        turn_span: &SpanId,
        call: &ToolCallRequest,
        category: ToolCategory,
    ) -> Result<bool> {
        let correlation = CorrelationId::new();
        self.ctx.trace.append_event(
            &self.ctx.session,
            EventKind::ToolCall,
            json!({
                "correlation": correlation.to_string(),
                "tool": call.name,
                "arguments": call.arguments,
            }),
            Some(turn_span),
        )?;

        let handled = self.handle_builtin(turn_span, call);
        match handled {
            Ok((content, completed)) => {
                if category == ToolCategory::Think {
                    self.tracker.record(ToolCategory::Think);
                }
                let artifact = self.ctx.trace.put_artifact(content.as_bytes())?;
                self.ctx.trace.append_event(
                    &self.ctx.session,
                    EventKind::ToolResult,
                    json!({
                        "correlation": correlation.to_string(),
                        "tool": call.name,
                        "artifact": artifact.as_str(),
                        "exit_code": 0,
                        "success": true,
                        "llm_call_id": call.id,
                    }),
                    Some(turn_span),
                )?;
                Ok(completed)
            }
            Err(error) => {
                if error.is_fatal() {
                    return Err(error);
                }
                let envelope = ErrorEnvelope::from_error(&error);
                self.ctx.trace.append_event(
                    &self.ctx.session,
                    EventKind::Error,
                    json!({
                        "correlation": correlation.to_string(),
                        "tool": call.name,
                        "envelope": envelope.to_json(),
                        "llm_call_id": call.id,
                    }),
                    Some(turn_span),
                )?;
                Ok(false)
            }
        }
    }

    fn handle_builtin(
        &mut self,
        turn_span: &SpanId,
        call: &ToolCallRequest,
    ) -> Result<(String, bool)> {
        let args = &call.arguments;
        match call.name.as_str() {
            "think" => {
                let thought = args
                    .get("thought")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok((format!("thought recorded ({} chars)", thought.len()), false))
            }
            "message_user" => Ok(("delivered".to_string(), false)),
            "menu_list" => {
                let modes: Vec<String> = self.ctx.registry.modes().into_iter().collect();
                let visible: Vec<String> = self
                    .ctx
                    .registry
                    .visible_in_mode(&self.mode)
                    .iter()
                    .map(|s| s.name.clone())
                    .collect();
                Ok((
                    json!({"modes": modes, "active": self.mode, "visible": visible}).to_string(),
                    false,
                ))
            }
            "menu_enter" => {
                let mode = args
                    .get("mode")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::SchemaViolation {
                        tool: call.name.clone(),
                        violations: vec!["missing required parameter 'mode'".to_string()],
                    })?;
                if !self.ctx.registry.modes().contains(mode) {
                    return Err(Error::Config(format!("unknown mode '{}'", mode)));
                }
                self.pending_mode = Some(mode.to_string());
                Ok((format!("mode '{}' active from next turn", mode), false))
            }
            "menu_exit" => {
                self.pending_mode = Some("swe".to_string());
                Ok(("default mode active from next turn".to_string(), false))
            }
            "complete" => {
                let mut unmet = Vec::new();
                for todo in self.todos.list()? {
                    if todo.status != crate::todo::TodoStatus::Verified {
                        unmet.push(format!("todo '{}' is {}", todo.title, todo.status));
                    }
                }
                for phase in self.tracker.entered() {
                    if !self.tracker.exit_criteria_met(*phase) {
                        unmet.push(format!("phase {} exit criteria unmet", phase));
                    }
                }
                if unmet.is_empty() {
                    Ok(("session complete".to_string(), true))
                } else {
                    Err(Error::PhaseViolation(format!(
                        "complete() preconditions unmet: {}",
                        unmet.join("; ")
                    )))
                }
            }
            "phase_transition" => {
                let to = args
                    .get("to")
                    .and_then(Value::as_str)
                    .and_then(Phase::parse)
                    .ok_or_else(|| Error::SchemaViolation {
                        tool: call.name.clone(),
                        violations: vec!["'to' must be a phase name".to_string()],
                    })?;
                self.transition_phase(turn_span, to)?;
                Ok((format!("phase is now {}", to), false))
            }
            "todo_create" => {
                let title = args
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::SchemaViolation {
                        tool: call.name.clone(),
                        violations: vec!["missing required parameter 'title'".to_string()],
                    })?;
                let criteria = Self::parse_criteria(args.get("criteria"))?;
                let id = self.todos.create(title, criteria)?;
                Ok((json!({"id": id.to_string()}).to_string(), false))
            }
            "todo_start" => {
                let id = Self::parse_todo_id(args)?;
                self.todos.start(Actor::Agent, &id)?;
                Ok(("in_progress".to_string(), false))
            }
            "todo_claim" => {
                let id = Self::parse_todo_id(args)?;
                let evidence = self.resolve_evidence(args.get("evidence"))?;
                self.todos.claim(Actor::Agent, &id, evidence)?;
                Ok(("claimed; awaiting verification".to_string(), false))
            }
            "todo_list" => {
                let todos = self.todos.list()?;
                Ok((serde_json::to_string(&todos)?, false))
            }
            "todo_get" => {
                let id = Self::parse_todo_id(args)?;
                let todo = self
                    .todos
                    .get(&id)?
                    .ok_or_else(|| Error::NotFound(format!("todo {}", id)))?;
                Ok((serde_json::to_string(&todo)?, false))
            }
            other => Err(Error::masked(other, "unknown builtin")),
        }
    }

    fn transition_phase(&mut self, _turn_span: &SpanId, to: Phase) -> Result<()> {
        let from = self.tracker.current();
        self.tracker.transition(to)?;
        self.ctx.trace.append_event(
            &self.ctx.session,
            EventKind::StateTransition,
            json!({
                "transition": "phase_change",
                "from": from.as_str(),
                "to": to.as_str(),
            }),
            None,
        )?;
        self.ctx.trace.append_event(
            &self.ctx.session,
            EventKind::Commit,
            json!({"transition": format!("phase:{}", to.as_str())}),
            None,
        )?;
        self.ctx.trace.set_phase(&self.ctx.session, to)?;
        Ok(())
    }

    fn parse_todo_id(args: &Value) -> Result<TodoId> {
        args.get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::SchemaViolation {
                tool: "todo".to_string(),
                violations: vec!["missing required parameter 'id'".to_string()],
            })
            .and_then(TodoId::parse)
    }

    fn parse_criteria(value: Option<&Value>) -> Result<Vec<AcceptanceCriterion>> {
        let items = value
            .and_then(Value::as_array)
            .ok_or_else(|| Error::SchemaViolation {
                tool: "todo_create".to_string(),
                violations: vec!["'criteria' must be an array".to_string()],
            })?;
        let mut criteria = Vec::new();
        for item in items {
            let kind = item
                .get("kind")
                .and_then(Value::as_str)
                .and_then(|s| match s {
                    "command-exit-zero" => Some(CriterionKind::CommandExitZero),
                    "file-exists" => Some(CriterionKind::FileExists),
                    "test-passes" => Some(CriterionKind::TestPasses),
                    "regex-matches" => Some(CriterionKind::RegexMatches),
                    "verifier-callback" => Some(CriterionKind::VerifierCallback),
                    _ => None,
                })
                .ok_or_else(|| Error::SchemaViolation {
                    tool: "todo_create".to_string(),
                    violations: vec!["criterion 'kind' is not a known kind".to_string()],
                })?;
            let expectation = item
                .get("expectation")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::SchemaViolation {
                    tool: "todo_create".to_string(),
                    violations: vec!["criterion 'expectation' must be a string".to_string()],
                })?;
            criteria.push(AcceptanceCriterion::new(kind, expectation));
        }
        if criteria.is_empty() {
            return Err(Error::SchemaViolation {
                tool: "todo_create".to_string(),
                violations: vec!["at least one criterion is required".to_string()],
            });
        }
        Ok(criteria)
    }

    /// Resolve `{criterion, event_seq}` bindings into full evidence refs by
    /// looking up the recorded TOOL_RESULT events.
    fn resolve_evidence(&self, value: Option<&Value>) -> Result<Vec<EvidenceRef>> {
        let items = value
            .and_then(Value::as_array)
            .ok_or_else(|| Error::SchemaViolation {
                tool: "todo_claim".to_string(),
                violations: vec!["'evidence' must be an array".to_string()],
            })?;
        let mut evidence = Vec::new();
        for item in items {
            let criterion = item
                .get("criterion")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::SchemaViolation {
                    tool: "todo_claim".to_string(),
                    violations: vec!["evidence 'criterion' must be an index".to_string()],
                })? as usize;
            let event_seq = item
                .get("event_seq")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::SchemaViolation {
                    tool: "todo_claim".to_string(),
                    violations: vec!["evidence 'event_seq' must be a sequence number".to_string()],
                })?;

            let events = self
                .ctx
                .trace
                .iterate(&self.ctx.session, event_seq, Some(event_seq))?;
            let artifact = events
                .first()
                .filter(|e| e.kind == EventKind::ToolResult)
                .and_then(|e| e.payload_str("artifact"))
                .map(ArtifactId::parse)
                .transpose()?
                .ok_or_else(|| Error::InsufficientEvidence {
                    todo: "claim".to_string(),
                    missing: vec![format!(
                        "event {} is not a recorded tool result",
                        event_seq
                    )],
                })?;

            evidence.push(EvidenceRef {
                criterion,
                artifact,
                event_seq,
            });
        }
        Ok(evidence)
    }

    /// Track call-argument hashes; returns whether this turn brought any
    /// call not seen before.
    fn observe_novelty(&mut self, calls: &[ToolCallRequest]) -> bool {
        let mut novel = false;
        for call in calls {
            let mut hasher = Sha256::new();
            hasher.update(call.name.as_bytes());
            hasher.update(call.arguments.to_string().as_bytes());
            let hash = format!("{:x}", hasher.finalize());
            if self.seen_call_hashes.insert(hash) {
                novel = true;
            }
        }
        novel
    }

    fn detect_stuckness(&mut self, turn_span: &SpanId, novel: bool) -> Result<()> {
        if novel {
            self.stale_turns = 0;
            return Ok(());
        }
        self.stale_turns += 1;
        if self.stale_turns >= self.ctx.config.stuckness_window {
            self.ctx.trace.append_event(
                &self.ctx.session,
                EventKind::StateTransition,
                json!({
                    "transition": "stuckness_detected",
                    "stale_turns": self.stale_turns,
                }),
                Some(turn_span),
            )?;
            self.ctx.trace.append_event(
                &self.ctx.session,
                EventKind::HumanInput,
                json!({
                    "message": json!({
                        "warning": "stuckness_detected",
                        "detail": "recent turns repeated earlier tool calls with identical arguments; try a different approach or ask for help with message_user",
                    })
                    .to_string(),
                    "synthetic": true,
                }),
                Some(turn_span),
            )?;
            self.stale_turns = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::llm::{CompletionResponse, TokenUsage};
    use crate::session::Session;
    use crate::tools::registry::{Tool, ToolOutput, ToolRegistry};
    use crate::tools::spec::{ParamSpec, ParamType, SideEffect, ToolSpec};
    use crate::trace::TraceStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Client replaying a canned script of responses.
    struct ScriptedClient {
        script: Mutex<VecDeque<CompletionResponse>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::llm(crate::llm::LlmErrorKind::Transport, "script exhausted"))
        }

        fn available_models(&self) -> Vec<crate::llm::ModelSpec> {
            vec![]
        }
    }

    fn respond(calls: Vec<(&str, &str, Value)>) -> CompletionResponse {
        let tool_calls = calls
            .into_iter()
            .map(|(id, name, arguments)| ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })
            .collect();
        CompletionResponse {
            content: String::new(),
            tool_calls,
            usage: TokenUsage::new(10, 10),
            stop_reason: None,
            model: "scripted".to_string(),
            raw: "{\"scripted\":true}".to_string(),
        }
    }

    struct OkTool {
        spec: ToolSpec,
        exit_code: i32,
    }

    #[async_trait]
    impl Tool for OkTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<ToolOutput> {
            Ok(ToolOutput::new(format!("ran with {}", args)).with_exit_code(self.exit_code))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(OkTool {
                spec: ToolSpec::new(
                    "read_file",
                    "read a file",
                    ToolCategory::Read,
                    SideEffect::ReadOnly,
                )
                .in_mode("swe")
                .with_param(ParamSpec::required("path", ParamType::String, "path")),
                exit_code: 0,
            }))
            .unwrap();
        registry
            .register(Arc::new(OkTool {
                spec: ToolSpec::new(
                    "run_tests",
                    "run the test suite",
                    ToolCategory::BashTests,
                    SideEffect::Mutating,
                )
                .in_mode("swe")
                .with_param(ParamSpec::required("command", ParamType::String, "command")),
                exit_code: 0,
            }))
            .unwrap();
        registry
    }

    fn harness_ctx(config: CoreConfig) -> (SessionContext, Session) {
        let trace = Arc::new(TraceStore::in_memory().unwrap());
        let session = Session::new("fix the bug", "/tmp/ws");
        trace.create_session(&session).unwrap();
        let ctx = SessionContext::new(
            session.id.clone(),
            trace,
            Arc::new(registry()),
            Arc::new(config),
        );
        (ctx, session)
    }

    fn agent(ctx: &SessionContext, script: Vec<CompletionResponse>) -> AgentLoop {
        let orchestrator = Arc::new(RolloutOrchestrator::new(&ctx.config));
        AgentLoop::new(ctx.clone(), ScriptedClient::new(script), orchestrator).unwrap()
    }

    #[tokio::test]
    async fn test_prose_only_response_gets_prompt_back() {
        let mut config = CoreConfig::default();
        config.max_turns = 1;
        let (ctx, _session) = harness_ctx(config);

        let mut agent_loop = agent(
            &ctx,
            vec![CompletionResponse {
                content: "I fixed it, trust me".to_string(),
                tool_calls: vec![],
                usage: TokenUsage::new(5, 5),
                stop_reason: None,
                model: "scripted".to_string(),
                raw: "{}".to_string(),
            }],
        );

        // Turn limit converts the endless loop into an error exit
        let err = agent_loop.run().await.unwrap_err();
        assert!(err.to_string().contains("turn limit"));

        let inputs = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::HumanInput])
            .unwrap();
        // goal + synthetic prompt-back
        assert_eq!(inputs.len(), 2);
        assert!(inputs[1]
            .payload_str("message")
            .unwrap()
            .contains("no_tool_call"));
    }

    #[tokio::test]
    async fn test_think_budget_violation_records_policy_error() {
        let mut config = CoreConfig::default();
        config.max_turns = 5;
        let (ctx, _session) = harness_ctx(config);

        let think = |id: &str| {
            respond(vec![(id, "think", json!({"thought": "hmm"}))])
        };
        // Understand phase allows think; start in Localize where think is
        // meta-visible (builtin) and budget applies regardless
        let mut agent_loop = agent(
            &ctx,
            vec![
                think("t1"),
                think("t2"),
                think("t3"),
                think("t4"),
                think("t5"),
            ],
        );

        let err = agent_loop.run().await.unwrap_err();
        assert!(err.to_string().contains("turn limit"));

        let errors = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::Error])
            .unwrap();
        let budget_errors: Vec<_> = errors
            .iter()
            .filter(|e| {
                e.payload
                    .get("envelope")
                    .and_then(|v| v.get("category"))
                    .and_then(Value::as_str)
                    == Some("policy")
            })
            .collect();
        // Fourth and fifth think calls both rejected
        assert_eq!(budget_errors.len(), 2);

        let transitions = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::StateTransition])
            .unwrap();
        assert!(transitions
            .iter()
            .any(|e| e.payload_str("transition") == Some("budget_exhausted")));
    }

    #[tokio::test]
    async fn test_masked_and_hallucinated_calls_are_rejected_structurally() {
        let mut config = CoreConfig::default();
        config.max_turns = 2;
        let (ctx, _session) = harness_ctx(config);

        let mut agent_loop = agent(
            &ctx,
            vec![
                // run_tests is in mode swe but LOCALIZE forbids BashTests;
                // fly_to_moon does not exist
                respond(vec![
                    ("c1", "run_tests", json!({"command": "pytest"})),
                    ("c2", "fly_to_moon", json!({})),
                ]),
                respond(vec![("c3", "read_file", json!({"path": "a.rs"}))]),
            ],
        );
        let _ = agent_loop.run().await;

        let errors = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::Error])
            .unwrap();
        let masked: Vec<_> = errors
            .iter()
            .filter(|e| {
                e.payload
                    .get("envelope")
                    .and_then(|v| v.get("category"))
                    .and_then(Value::as_str)
                    == Some("masked")
            })
            .collect();
        assert_eq!(masked.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_rejected_until_preconditions_hold() {
        let mut config = CoreConfig::default();
        config.max_turns = 6;
        let (ctx, _session) = harness_ctx(config);

        let mut agent_loop = agent(
            &ctx,
            vec![
                // Premature complete: LOCALIZE exit criteria unmet
                respond(vec![("c1", "complete", json!({}))]),
                respond(vec![("c2", "read_file", json!({"path": "mod/a.py"}))]),
                respond(vec![("c3", "phase_transition", json!({"to": "verify"}))]),
                respond(vec![("c4", "run_tests", json!({"command": "pytest"}))]),
                respond(vec![("c5", "complete", json!({"summary": "done"}))]),
            ],
        );

        let outcome = agent_loop.run().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Completed);

        let manifest = ctx.trace.get_session(&ctx.session).unwrap().unwrap();
        assert_eq!(manifest.status, SessionStatus::Completed);

        // The premature complete was answered with a policy rejection
        let errors = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::Error])
            .unwrap();
        assert!(errors.iter().any(|e| {
            e.payload_str("tool") == Some("complete")
                && e.payload
                    .get("envelope")
                    .and_then(|v| v.get("message"))
                    .and_then(Value::as_str)
                    .map(|m| m.contains("preconditions"))
                    .unwrap_or(false)
        }));
    }

    #[tokio::test]
    async fn test_complete_blocked_by_unverified_todo() {
        let mut config = CoreConfig::default();
        config.max_turns = 6;
        let (ctx, _session) = harness_ctx(config);

        let mut agent_loop = agent(
            &ctx,
            vec![
                respond(vec![(
                    "c1",
                    "todo_create",
                    json!({
                        "title": "Fix test_foo",
                        "criteria": [{"kind": "command-exit-zero", "expectation": "pytest"}]
                    }),
                )]),
                respond(vec![("c2", "read_file", json!({"path": "mod/a.py"}))]),
                respond(vec![("c3", "phase_transition", json!({"to": "verify"}))]),
                respond(vec![("c4", "run_tests", json!({"command": "pytest"}))]),
                // Todo still pending: complete must fail
                respond(vec![("c5", "complete", json!({}))]),
                respond(vec![("c6", "message_user", json!({"message": "blocked"}))]),
            ],
        );

        let err = agent_loop.run().await.unwrap_err();
        assert!(err.to_string().contains("turn limit"));

        let errors = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::Error])
            .unwrap();
        assert!(errors.iter().any(|e| {
            e.payload_str("tool") == Some("complete")
                && e.payload
                    .get("envelope")
                    .and_then(|v| v.get("message"))
                    .and_then(Value::as_str)
                    .map(|m| m.contains("pending"))
                    .unwrap_or(false)
        }));
    }

    #[tokio::test]
    async fn test_pause_writes_checkpoint_and_resume_replays_identically() {
        let mut config = CoreConfig::default();
        config.max_turns = 10;
        let (ctx, _session) = harness_ctx(config);

        let mut agent_loop = agent(
            &ctx,
            vec![respond(vec![(
                "c1",
                "read_file",
                json!({"path": "mod/a.py"}),
            )])],
        );
        // Request the pause up front; it is honored at the turn boundary
        agent_loop.pause_handle().store(true, Ordering::SeqCst);
        let outcome = agent_loop.run().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Paused);

        let manifest = ctx.trace.get_session(&ctx.session).unwrap().unwrap();
        assert_eq!(manifest.status, SessionStatus::Paused);

        let checkpoint = ctx.trace.latest_checkpoint(&ctx.session).unwrap().unwrap();
        let snapshot = crate::checkpoint::load_snapshot(&ctx.trace, &checkpoint).unwrap();

        // The snapshot's message history equals a replay of the trace
        let replayed = crate::checkpoint::replay(
            &ctx.trace,
            &ctx.session,
            snapshot.last_seq,
        )
        .unwrap();
        // Ignore events appended after the checkpoint (the CHECKPOINT event
        // itself is recorded after the snapshot bytes were fixed)
        assert_eq!(
            serde_json::to_vec(&snapshot.messages).unwrap(),
            serde_json::to_vec(&replayed.messages).unwrap()
        );
    }

    /// Client whose turns are computed from the request (e.g. to read todo
    /// ids out of the rendered system prompt).
    struct FnClient {
        turns: Mutex<VecDeque<Box<dyn Fn(&CompletionRequest) -> CompletionResponse + Send>>>,
    }

    impl FnClient {
        fn new(
            turns: Vec<Box<dyn Fn(&CompletionRequest) -> CompletionResponse + Send>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for FnClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::llm(crate::llm::LlmErrorKind::Transport, "script exhausted"))?;
            Ok(turn(&request))
        }

        fn available_models(&self) -> Vec<crate::llm::ModelSpec> {
            vec![]
        }
    }

    fn todo_id_from_prompt(request: &CompletionRequest, title: &str) -> String {
        let system = request.system.as_deref().unwrap_or_default();
        system
            .lines()
            .find(|line| line.contains(title))
            .and_then(|line| {
                let start = line.rfind('(')? + 1;
                let end = line.rfind(')')?;
                Some(line[start..end].to_string())
            })
            .expect("todo listed in system prompt")
    }

    #[tokio::test]
    async fn test_todo_claim_resolves_evidence_from_trace() {
        let mut config = CoreConfig::default();
        config.max_turns = 6;
        let (ctx, _session) = harness_ctx(config);

        // For a fixed script the event sequence is deterministic: the
        // run_tests TOOL_RESULT lands at seq 39
        let turns: Vec<Box<dyn Fn(&CompletionRequest) -> CompletionResponse + Send>> = vec![
            Box::new(|_| {
                respond(vec![(
                    "c1",
                    "todo_create",
                    json!({
                        "title": "Fix test_foo",
                        "criteria": [{"kind": "command-exit-zero", "expectation": "true"}]
                    }),
                )])
            }),
            Box::new(|request| {
                let id = todo_id_from_prompt(request, "Fix test_foo");
                respond(vec![("c2", "todo_start", json!({"id": id}))])
            }),
            Box::new(|_| respond(vec![("c3", "read_file", json!({"path": "mod/a.py"}))])),
            Box::new(|_| respond(vec![("c4", "phase_transition", json!({"to": "fix"}))])),
            Box::new(|_| respond(vec![("c5", "run_tests", json!({"command": "pytest"}))])),
            Box::new(|request| {
                let id = todo_id_from_prompt(request, "Fix test_foo");
                respond(vec![(
                    "c6",
                    "todo_claim",
                    json!({"id": id, "evidence": [{"criterion": 0, "event_seq": 39}]}),
                )])
            }),
        ];

        let orchestrator = Arc::new(RolloutOrchestrator::new(&ctx.config));
        let mut agent_loop =
            AgentLoop::new(ctx.clone(), FnClient::new(turns), orchestrator).unwrap();
        let todos = agent_loop.todos();

        let run = agent_loop.run().await;
        assert!(run.is_err()); // turn limit, deliberately

        let all = todos.list().unwrap();
        assert_eq!(all.len(), 1);
        let todo = &all[0];
        assert_eq!(todo.status, crate::todo::TodoStatus::Claimed);
        assert_eq!(todo.evidence.len(), 1);
        assert_eq!(todo.evidence[0].event_seq, 39);

        // The bound artifact is the run_tests output
        let content = ctx
            .trace
            .get_artifact_string(&todo.evidence[0].artifact)
            .unwrap();
        assert!(content.starts_with("ran with"));
    }

    #[tokio::test]
    async fn test_resume_assembles_byte_identical_prompt() {
        let mut config = CoreConfig::default();
        config.max_turns = 2;
        let (ctx, _session) = harness_ctx(config);

        let mut first = agent(&ctx, vec![]);
        let orchestrator = Arc::new(RolloutOrchestrator::new(&ctx.config));
        first.pause_handle().store(true, Ordering::SeqCst);
        let outcome = first.run().await.unwrap();
        assert_eq!(outcome, SessionOutcome::Paused);

        let checkpoint = ctx.trace.latest_checkpoint(&ctx.session).unwrap().unwrap();
        let snapshot = crate::checkpoint::load_snapshot(&ctx.trace, &checkpoint).unwrap();

        // Resume and run one real turn
        let mut resumed = AgentLoop::resume(
            ctx.clone(),
            ScriptedClient::new(vec![respond(vec![(
                "c2",
                "read_file",
                json!({"path": "mod/a.py"}),
            )])]),
            orchestrator,
            snapshot.clone(),
        )
        .unwrap();
        let _ = resumed.run().await;

        // The resumed session's first prompt carries exactly the
        // checkpointed conversation
        let requests = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::LlmRequest])
            .unwrap();
        let last = requests.last().unwrap();
        let prompt_bytes = ctx
            .trace
            .get_artifact(&ArtifactId::parse(last.payload_str("artifact").unwrap()).unwrap())
            .unwrap();
        let decoded: CompletionRequest = serde_json::from_slice(&prompt_bytes).unwrap();
        assert_eq!(
            serde_json::to_vec(&decoded.messages).unwrap(),
            serde_json::to_vec(&snapshot.messages).unwrap()
        );
    }

    #[tokio::test]
    async fn test_stuckness_detection_nudges() {
        let mut config = CoreConfig::default();
        config.max_turns = 4;
        config.stuckness_window = 2;
        let (ctx, _session) = harness_ctx(config);

        let same = || respond(vec![("c", "read_file", json!({"path": "same.rs"}))]);
        let mut agent_loop = agent(&ctx, vec![same(), same(), same(), same()]);
        let _ = agent_loop.run().await;

        let transitions = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::StateTransition])
            .unwrap();
        assert!(transitions
            .iter()
            .any(|e| e.payload_str("transition") == Some("stuckness_detected")));
    }

    #[tokio::test]
    async fn test_llm_request_and_response_artifacts_recorded() {
        let mut config = CoreConfig::default();
        config.max_turns = 1;
        let (ctx, _session) = harness_ctx(config);

        let mut agent_loop = agent(
            &ctx,
            vec![respond(vec![("c1", "read_file", json!({"path": "a.rs"}))])],
        );
        let _ = agent_loop.run().await;

        let requests = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::LlmRequest])
            .unwrap();
        assert_eq!(requests.len(), 1);
        let prompt_artifact =
            ArtifactId::parse(requests[0].payload_str("artifact").unwrap()).unwrap();
        let prompt_bytes = ctx.trace.get_artifact(&prompt_artifact).unwrap();
        let decoded: CompletionRequest = serde_json::from_slice(&prompt_bytes).unwrap();
        assert!(decoded.system.unwrap().contains("fix the bug"));

        let responses = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::LlmResponse])
            .unwrap();
        let raw = ctx
            .trace
            .get_artifact_string(
                &ArtifactId::parse(responses[0].payload_str("artifact").unwrap()).unwrap(),
            )
            .unwrap();
        assert_eq!(raw, "{\"scripted\":true}");
    }
}
