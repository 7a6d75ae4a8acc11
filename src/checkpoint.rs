//! Checkpoints, session forking, and deterministic replay.
//!
//! A checkpoint is a content-addressed snapshot of everything the agent loop
//! needs to continue: the full message history, phase and mode, the todo
//! list with evidence, budgets, pending calls, and the last-seen sequence
//! number. Identical state serializes to identical bytes, so identical
//! state yields the identical checkpoint id.
//!
//! Replay never re-invokes the LLM or re-executes tools: the conversation
//! is a pure function of the recorded events, and both the live loop and
//! the replayer derive it with [`messages_from_events`]. That is what makes
//! resumed prompts byte-identical to the prompts the paused session would
//! have assembled.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, ToolCallRequest};
use crate::phase::{ExitProgress, LatencyBudget, Phase, ThinkBudget};
use crate::rollout::ToolCall;
use crate::session::{Session, SessionId, SessionStatus};
use crate::todo::Todo;
use crate::trace::{ArtifactId, Event, EventKind, TraceStore};

/// Serializable snapshot of a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub session: String,
    pub goal: String,
    pub workspace: PathBuf,
    pub phase: Phase,
    pub mode: String,
    /// Full message history, not summarized
    pub messages: Vec<ChatMessage>,
    pub todos: Vec<Todo>,
    /// Exit-criteria progress keyed by phase name (sorted for stable bytes)
    pub phase_progress: BTreeMap<String, ExitProgress>,
    pub phases_entered: Vec<Phase>,
    pub think_budget: ThinkBudget,
    pub latency_budget: LatencyBudget,
    /// Calls that were scheduled but not completed when the snapshot was taken
    pub pending_calls: Vec<ToolCall>,
    pub last_seq: u64,
    /// Deterministic RNG seed, if the session uses one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
}

impl CheckpointSnapshot {
    /// Canonical bytes for content addressing. Struct field order is fixed
    /// and maps are sorted, so equal snapshots serialize equally.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a snapshot artifact.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Write a snapshot: stores the artifact and records a CHECKPOINT event.
pub fn write_snapshot(
    trace: &TraceStore,
    session: &SessionId,
    snapshot: &CheckpointSnapshot,
) -> Result<(ArtifactId, u64)> {
    trace.write_checkpoint(session, &snapshot.canonical_bytes()?)
}

/// Load a snapshot by artifact id.
pub fn load_snapshot(trace: &TraceStore, artifact: &ArtifactId) -> Result<CheckpointSnapshot> {
    let bytes = trace.get_artifact(artifact)?;
    CheckpointSnapshot::from_bytes(&bytes)
}

/// Load the latest snapshot for a session.
pub fn load_latest(trace: &TraceStore, session: &SessionId) -> Result<CheckpointSnapshot> {
    let artifact = trace
        .latest_checkpoint(session)?
        .ok_or_else(|| Error::NotFound(format!("no checkpoint for session {}", session)))?;
    load_snapshot(trace, &artifact)
}

/// Fork a new session from a checkpoint.
///
/// The child is an independent session seeded with the snapshot's state; a
/// lineage edge records where it came from. The parent is untouched.
pub fn fork_session(
    trace: &TraceStore,
    parent: &SessionId,
    checkpoint: &ArtifactId,
) -> Result<Session> {
    let snapshot = load_snapshot(trace, checkpoint)?;

    let mut child = Session::new(snapshot.goal.clone(), snapshot.workspace.clone());
    child.phase = snapshot.phase;
    child.mode = snapshot.mode.clone();
    child.status = SessionStatus::Paused;
    child.parent = Some(parent.clone());
    trace.create_session(&child)?;
    trace.record_lineage(&child.id, parent, checkpoint)?;

    trace.append_event(
        &child.id,
        EventKind::StateTransition,
        serde_json::json!({
            "transition": "forked",
            "parent": parent.to_string(),
            "checkpoint": checkpoint.as_str(),
        }),
        None,
    )?;
    // The forked trace starts with the inherited conversation so replay
    // works without reaching into the parent's log
    let (artifact, _) = trace.write_checkpoint(&child.id, &snapshot.canonical_bytes()?)?;
    debug_assert_eq!(&artifact, checkpoint);

    Ok(child)
}

/// State reconstructed by replaying a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayState {
    pub messages: Vec<ChatMessage>,
    pub last_seq: u64,
}

/// Replay a session's conversation up to (and including) `up_to_seq`,
/// without re-invoking the LLM or re-executing tools.
pub fn replay(trace: &TraceStore, session: &SessionId, up_to_seq: u64) -> Result<ReplayState> {
    // A fork seeds its conversation from the inherited checkpoint
    let seed = trace
        .lineage_of(session)?
        .map(|(_, checkpoint)| load_snapshot(trace, &checkpoint))
        .transpose()?
        .map(|snapshot| snapshot.messages)
        .unwrap_or_default();

    let events = trace.iterate(session, 1, Some(up_to_seq))?;
    let messages = messages_from_events(trace, &seed, &events)?;
    let last_seq = events.last().map(|e| e.seq).unwrap_or(0);
    Ok(ReplayState { messages, last_seq })
}

/// Derive the conversation from a prefix of the event log.
///
/// This is the single source of truth for message history: the live agent
/// loop assembles its prompt from exactly this function, so replaying the
/// same prefix yields byte-identical messages.
///
/// Rules:
/// - HUMAN_INPUT appends a user message.
/// - LLM_RESPONSE appends an assistant message (content + tool calls, taken
///   from the recorded payload verbatim).
/// - Once every tool call of an assistant message has a TOOL_RESULT or
///   ERROR at or before the cutoff, tool-result messages are appended in
///   submission order (never completion order).
pub fn messages_from_events(
    trace: &TraceStore,
    seed: &[ChatMessage],
    events: &[Event],
) -> Result<Vec<ChatMessage>> {
    // Index call closers by llm_call_id
    let mut closers: BTreeMap<String, (u64, String)> = BTreeMap::new();
    for event in events {
        let call_id = match event.payload_str("llm_call_id") {
            Some(id) => id.to_string(),
            None => continue,
        };
        match event.kind {
            EventKind::ToolResult => {
                let content = match event.payload_str("artifact") {
                    Some(artifact) => {
                        trace.get_artifact_string(&ArtifactId::parse(artifact)?)?
                    }
                    None => String::new(),
                };
                closers.insert(call_id, (event.seq, content));
            }
            EventKind::Error => {
                let envelope = event
                    .payload
                    .get("envelope")
                    .cloned()
                    .unwrap_or(Value::Null);
                closers.insert(call_id, (event.seq, envelope.to_string()));
            }
            _ => {}
        }
    }

    let mut messages: Vec<ChatMessage> = seed.to_vec();
    for event in events {
        match event.kind {
            EventKind::HumanInput => {
                if let Some(text) = event.payload_str("message") {
                    messages.push(ChatMessage::user(text));
                }
            }
            EventKind::LlmResponse => {
                let content = event.payload_str("content").unwrap_or_default();
                let tool_calls: Vec<ToolCallRequest> = event
                    .payload
                    .get("tool_calls")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();

                let complete = tool_calls
                    .iter()
                    .all(|call| closers.contains_key(&call.id));

                messages
                    .push(ChatMessage::assistant(content).with_tool_calls(tool_calls.clone()));

                if complete {
                    for call in &tool_calls {
                        if let Some((_, content)) = closers.get(&call.id) {
                            messages.push(ChatMessage::tool_result(&call.id, content));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(messages)
}
