//! # compymac-core
//!
//! Guard-railed, phase-structured agent execution core: drives an LLM
//! through software-engineering tasks while making hallucinated completions
//! structurally impossible to ship.
//!
//! ## Core Components
//!
//! - **Trace**: append-only event log, spans, content-addressed artifacts
//! - **Tools**: typed catalog, mode/phase masks, conflict classes
//! - **Todo**: verified-completion state machine
//! - **Rollout**: parallel tool execution with resource-key arbitration
//! - **Phase**: LOCALIZE → UNDERSTAND → FIX → REGRESSION_CHECK → VERIFY
//! - **Agent**: the turn-by-turn driver with budget enforcement
//! - **Checkpoint**: pause/resume, session forking, deterministic replay
//! - **Harness**: the independent verifier that promotes claims
//!
//! ## Example
//!
//! ```rust,ignore
//! use compymac_core::{AgentLoop, CoreConfig, RolloutOrchestrator, SessionContext};
//!
//! let config = Arc::new(CoreConfig::rooted(".compymac"));
//! let trace = Arc::new(TraceStore::open(config.database_path(), &config.blob_dir)?);
//! let session = Session::new("Fix failing test test_foo", workspace);
//! trace.create_session(&session)?;
//!
//! let ctx = SessionContext::new(session.id, trace, registry, config);
//! let mut agent = AgentLoop::new(ctx, client, orchestrator)?;
//! agent.run().await?;
//! ```

pub mod agent;
pub mod bridge;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod harness;
pub mod llm;
pub mod phase;
pub mod rollout;
pub mod session;
pub mod todo;
pub mod tools;
pub mod trace;

#[cfg(test)]
mod properties;

// Re-exports for convenience
pub use agent::{AgentLoop, SessionOutcome};
pub use bridge::{Bridge, BridgeHandler, BridgeRequest, BridgeResponse, BridgeStatus};
pub use checkpoint::{
    fork_session, load_latest, load_snapshot, messages_from_events, replay, write_snapshot,
    CheckpointSnapshot, ReplayState,
};
pub use config::CoreConfig;
pub use error::{Error, ErrorCategory, ErrorEnvelope, Result};
pub use harness::{CriterionOutcome, VerificationHarness, VerifierCallback};
pub use llm::{
    AnthropicClient, ChatMessage, ChatRole, ClientConfig, CompletionRequest, CompletionResponse,
    CostSummary, LlmClient, LlmErrorKind, ModelSpec, RetryConfig, StopReason, TokenUsage,
    ToolCallRequest,
};
pub use phase::{ExitProgress, LatencyBudget, Phase, PhaseTracker, ThinkBudget, ToolCategory};
pub use rollout::{
    BatchMode, BatchResult, CallOutcome, CallResult, KeyLockTable, RolloutOrchestrator, ToolCall,
};
pub use session::{Session, SessionContext, SessionId, SessionStatus};
pub use todo::{
    AcceptanceCriterion, Actor, CriterionKind, EvidenceRef, Todo, TodoId, TodoList, TodoStatus,
};
pub use tools::{
    check_visible, is_meta, KeyTemplate, ParamSpec, ParamType, ResourceKey, SideEffect, Tool,
    ToolOutput, ToolRegistry, ToolSpec,
};
pub use trace::{
    export_events, ArtifactId, ArtifactStore, CorrelationId, Event, EventKind, ExportFormat,
    SpanId, TraceStore,
};
