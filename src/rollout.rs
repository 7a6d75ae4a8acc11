//! Rollout orchestrator: executes tool calls, possibly in parallel, while
//! honoring conflict classes and recording the full fork/join structure.
//!
//! A batch is partitioned into waves of mutually conflict-free calls; waves
//! run through a bounded worker pool. Exclusive resource keys are also held
//! in a process-wide lock table for the duration of each call, so calls from
//! concurrent sessions never overlap on a key either. Every call gets its
//! own span; sibling spans share a fork parent and a join span records the
//! aggregate in submission order.

use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::error::{Error, ErrorCategory, ErrorEnvelope, Result};
use crate::session::SessionContext;
use crate::tools::conflict::{partition, ResourceKey};
use crate::tools::registry::ToolOutput;
use crate::trace::{CorrelationId, EventKind, SpanId};

/// A tool call scheduled for execution.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub correlation: CorrelationId,
    pub name: String,
    pub arguments: Value,
    /// The provider's call id, echoed back in the tool-result message
    pub llm_call_id: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            correlation: CorrelationId::new(),
            name: name.into(),
            arguments,
            llm_call_id: None,
        }
    }

    pub fn with_llm_call_id(mut self, id: impl Into<String>) -> Self {
        self.llm_call_id = Some(id.into());
        self
    }
}

/// How a batch terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Wait for every call to complete
    WaitAll,
    /// Cancel the rest as soon as any call succeeds
    FirstSuccess,
}

/// Outcome of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success(ToolOutput),
    Failure(ErrorEnvelope),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(envelope) => match envelope.category {
                ErrorCategory::Timeout => "timeout",
                ErrorCategory::Cancelled => "cancelled",
                _ => "error",
            },
        }
    }
}

/// One call's result, with its span and timing.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub call: ToolCall,
    pub span: SpanId,
    pub outcome: CallOutcome,
    pub duration_ms: u64,
}

/// Results of a batch, in submission order regardless of completion order.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<CallResult>,
    pub fork_span: Option<SpanId>,
}

impl BatchResult {
    /// A batch fails as a whole only when every call failed.
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| !r.outcome.is_success())
    }
}

/// Process-wide table of held exclusive resource keys.
///
/// The only locking mechanism tool execution is allowed to use. Keys are
/// held for the duration of a call and released on completion, failure, or
/// timeout.
#[derive(Default)]
pub struct KeyLockTable {
    held: Mutex<HashSet<ResourceKey>>,
    freed: Notify,
}

impl KeyLockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire all keys atomically, waiting until none are held elsewhere.
    pub async fn acquire(self: &Arc<Self>, keys: &[ResourceKey]) -> KeyGuard {
        let unique: Vec<ResourceKey> = {
            let mut seen = HashSet::new();
            keys.iter()
                .filter(|k| seen.insert((*k).clone()))
                .cloned()
                .collect()
        };
        loop {
            {
                let mut held = self.held.lock().expect("lock table poisoned");
                if unique.iter().all(|k| !held.contains(k)) {
                    held.extend(unique.iter().cloned());
                    return KeyGuard {
                        table: Arc::clone(self),
                        keys: unique,
                    };
                }
            }
            self.freed.notified().await;
        }
    }

    /// Keys currently held (for assertions).
    pub fn held_keys(&self) -> HashSet<ResourceKey> {
        self.held.lock().expect("lock table poisoned").clone()
    }
}

/// Releases its keys on drop.
pub struct KeyGuard {
    table: Arc<KeyLockTable>,
    keys: Vec<ResourceKey>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut held = self.table.held.lock().expect("lock table poisoned");
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.table.freed.notify_waiters();
    }
}

enum Supervised {
    Completed(std::result::Result<Result<ToolOutput>, tokio::task::JoinError>),
    Cancelled,
}

/// Executes tool-call batches for sessions.
pub struct RolloutOrchestrator {
    pool: Arc<Semaphore>,
    locks: Arc<KeyLockTable>,
    default_deadline: Duration,
    cancel_grace: Duration,
}

impl RolloutOrchestrator {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(config.max_parallel_calls)),
            locks: KeyLockTable::new(),
            default_deadline: config.default_deadline(),
            cancel_grace: config.cancel_grace(),
        }
    }

    /// Share a lock table across orchestrators.
    pub fn with_lock_table(mut self, locks: Arc<KeyLockTable>) -> Self {
        self.locks = locks;
        self
    }

    pub fn lock_table(&self) -> Arc<KeyLockTable> {
        Arc::clone(&self.locks)
    }

    /// Execute a batch of validated tool calls.
    ///
    /// A single call runs inline under `parent_span`. A larger batch opens a
    /// fork span, runs conflict-free waves of sibling spans, and closes a
    /// join span whose aggregate lists results in submission order.
    pub async fn execute(
        &self,
        ctx: &SessionContext,
        parent_span: Option<&SpanId>,
        calls: Vec<ToolCall>,
        mode: BatchMode,
    ) -> Result<BatchResult> {
        if calls.is_empty() {
            return Ok(BatchResult::default());
        }

        if calls.len() == 1 {
            let call = calls.into_iter().next().expect("len checked");
            let never = CancellationToken::new();
            let result = self
                .run_call(ctx, parent_span, call, &never, BatchMode::WaitAll)
                .await?;
            return Ok(BatchResult {
                results: vec![result],
                fork_span: None,
            });
        }

        let trace = &ctx.trace;
        let fork = trace.open_span(
            &ctx.session,
            "fork",
            parent_span,
            json!({"calls": calls.len()}),
        )?;

        let key_sets: Vec<Vec<ResourceKey>> = calls
            .iter()
            .map(|call| {
                ctx.registry
                    .get(&call.name)
                    .map(|t| t.spec().resource_keys(&call.arguments))
                    .unwrap_or_default()
            })
            .collect();
        let waves = partition(&key_sets);

        let batch_cancel = CancellationToken::new();
        let mut slots: Vec<Option<CallResult>> = calls.iter().map(|_| None).collect();

        for wave in waves {
            let futures = wave.iter().map(|&index| {
                let call = calls[index].clone();
                let batch_cancel = batch_cancel.clone();
                let fork = fork.clone();
                async move {
                    let result = self
                        .run_call(ctx, Some(&fork), call, &batch_cancel, mode)
                        .await;
                    (index, result)
                }
            });
            for (index, result) in join_all(futures).await {
                slots[index] = Some(result?);
            }
        }

        let results: Vec<CallResult> = slots
            .into_iter()
            .map(|slot| slot.expect("every wave slot filled"))
            .collect();

        let aggregate: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "tool": r.call.name,
                    "correlation": r.call.correlation.to_string(),
                    "status": r.outcome.status(),
                    "duration_ms": r.duration_ms,
                })
            })
            .collect();

        let join = trace.open_span(&ctx.session, "join", Some(&fork), json!({}))?;
        trace.close_span(&ctx.session, &join, "ok", json!({"results": aggregate}))?;
        trace.close_span(&ctx.session, &fork, "ok", json!({}))?;

        Ok(BatchResult {
            results,
            fork_span: Some(fork),
        })
    }

    /// Run one call: acquire a worker and its resource keys, record the
    /// TOOL_CALL, supervise the tool with deadline and cancellation, record
    /// the TOOL_RESULT or ERROR, close the call span.
    async fn run_call(
        &self,
        ctx: &SessionContext,
        parent_span: Option<&SpanId>,
        call: ToolCall,
        batch_cancel: &CancellationToken,
        mode: BatchMode,
    ) -> Result<CallResult> {
        let trace = &ctx.trace;

        let span = trace.open_span(
            &ctx.session,
            &format!("tool:{}", call.name),
            parent_span,
            json!({"tool": call.name, "correlation": call.correlation.to_string()}),
        )?;
        trace.append_event(
            &ctx.session,
            EventKind::ToolCall,
            json!({
                "correlation": call.correlation.to_string(),
                "tool": call.name,
                "arguments": call.arguments.clone(),
            }),
            Some(&span),
        )?;

        let started = Instant::now();
        let outcome = self.supervise(ctx, &call, batch_cancel, mode).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            CallOutcome::Success(output) => {
                let artifact = trace.put_artifact(output.content.as_bytes())?;
                trace.append_event(
                    &ctx.session,
                    EventKind::ToolResult,
                    json!({
                        "correlation": call.correlation.to_string(),
                        "tool": call.name,
                        "artifact": artifact.as_str(),
                        "exit_code": output.exit_code,
                        "success": output.is_success(),
                        "llm_call_id": call.llm_call_id,
                    }),
                    Some(&span),
                )?;
            }
            CallOutcome::Failure(envelope) => {
                trace.append_event(
                    &ctx.session,
                    EventKind::Error,
                    json!({
                        "correlation": call.correlation.to_string(),
                        "tool": call.name,
                        "envelope": envelope.to_json(),
                        "llm_call_id": call.llm_call_id,
                    }),
                    Some(&span),
                )?;
            }
        }

        trace.close_span(
            &ctx.session,
            &span,
            outcome.status(),
            json!({"duration_ms": duration_ms}),
        )?;

        Ok(CallResult {
            call,
            span,
            outcome,
            duration_ms,
        })
    }

    async fn supervise(
        &self,
        ctx: &SessionContext,
        call: &ToolCall,
        batch_cancel: &CancellationToken,
        mode: BatchMode,
    ) -> Result<CallOutcome> {
        if batch_cancel.is_cancelled() {
            return Ok(CallOutcome::Failure(
                ErrorEnvelope::new(ErrorCategory::Cancelled, "batch terminated early")
                    .not_recoverable(),
            ));
        }

        let tool = match ctx.registry.get(&call.name) {
            Some(tool) => tool,
            None => {
                return Ok(CallOutcome::Failure(ErrorEnvelope::new(
                    ErrorCategory::Masked,
                    format!("no such tool '{}'", call.name),
                )));
            }
        };

        // Keys before permit: a call holding a worker slot never waits on a
        // key, so the pool cannot wedge on cross-session key contention
        let keys = tool.spec().resource_keys(&call.arguments);
        let _guard = self.locks.acquire(&keys).await;

        let permit = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("worker pool closed: {}", e)))?;

        let deadline = tool.spec().deadline(self.default_deadline);
        let tool_cancel = batch_cancel.child_token();
        let mut worker: JoinHandle<Result<ToolOutput>> = tokio::spawn({
            let tool = Arc::clone(&tool);
            let arguments = call.arguments.clone();
            let cancel = tool_cancel.clone();
            async move { tool.invoke(arguments, cancel).await }
        });

        let supervised = timeout(deadline, async {
            tokio::select! {
                joined = &mut worker => Supervised::Completed(joined),
                _ = batch_cancel.cancelled() => Supervised::Cancelled,
            }
        })
        .await;

        let cancelled_envelope = || {
            ErrorEnvelope::new(ErrorCategory::Cancelled, "batch terminated early")
                .not_recoverable()
        };
        let outcome = match supervised {
            // A call finishing after the batch was cancelled counts as
            // cancelled regardless of what the tool returned; its effects
            // are recorded but it did not win
            Ok(Supervised::Completed(Ok(Ok(output)))) => {
                if mode == BatchMode::FirstSuccess {
                    if batch_cancel.is_cancelled() {
                        CallOutcome::Failure(cancelled_envelope())
                    } else {
                        if output.is_success() {
                            batch_cancel.cancel();
                        }
                        CallOutcome::Success(output)
                    }
                } else {
                    CallOutcome::Success(output)
                }
            }
            Ok(Supervised::Completed(Ok(Err(error)))) => {
                if mode == BatchMode::FirstSuccess && batch_cancel.is_cancelled() {
                    CallOutcome::Failure(cancelled_envelope())
                } else {
                    CallOutcome::Failure(ErrorEnvelope::from_error(&error))
                }
            }
            Ok(Supervised::Completed(Err(join_error))) => CallOutcome::Failure(
                ErrorEnvelope::new(
                    ErrorCategory::ToolException,
                    format!("tool worker panicked: {}", join_error),
                )
                .with_hint("this is a tool implementation bug"),
            ),
            Ok(Supervised::Cancelled) => {
                tool_cancel.cancel();
                self.drain(ctx, &mut worker).await?;
                CallOutcome::Failure(
                    ErrorEnvelope::new(ErrorCategory::Cancelled, "batch terminated early")
                        .not_recoverable(),
                )
            }
            Err(_elapsed) => {
                tool_cancel.cancel();
                self.drain(ctx, &mut worker).await?;
                CallOutcome::Failure(ErrorEnvelope::from_error(&Error::timeout(
                    deadline.as_millis() as u64,
                )))
            }
        };

        drop(permit);
        Ok(outcome)
    }

    /// After cancellation, give the tool a grace period to yield. A tool
    /// that ignores the signal is detached (the handle is dropped, the task
    /// leaks) and the session is marked degraded.
    async fn drain(
        &self,
        ctx: &SessionContext,
        worker: &mut JoinHandle<Result<ToolOutput>>,
    ) -> Result<()> {
        if timeout(self.cancel_grace, worker).await.is_err() {
            tracing::warn!(
                session = %ctx.session,
                "tool ignored cancellation; detaching worker and degrading session"
            );
            ctx.trace.set_degraded(&ctx.session)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::ToolCategory;
    use crate::session::{Session, SessionContext};
    use crate::tools::registry::{Tool, ToolRegistry};
    use crate::tools::spec::{KeyTemplate, ParamSpec, ParamType, SideEffect, ToolSpec};
    use crate::trace::TraceStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test tool: sleeps, then succeeds or fails; tracks peak concurrency.
    struct SleepyTool {
        spec: ToolSpec,
        sleep_ms: u64,
        fail: bool,
        ignore_cancel: bool,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl SleepyTool {
        fn new(spec: ToolSpec, sleep_ms: u64) -> Self {
            Self {
                spec,
                sleep_ms,
                fail: false,
                ignore_cancel: false,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Tool for SleepyTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn invoke(
            &self,
            args: Value,
            cancel: CancellationToken,
        ) -> crate::error::Result<ToolOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let work = tokio::time::sleep(Duration::from_millis(self.sleep_ms));
            if self.ignore_cancel {
                work.await;
            } else {
                tokio::select! {
                    _ = work => {}
                    _ = cancel.cancelled() => {
                        self.running.fetch_sub(1, Ordering::SeqCst);
                        return Err(Error::tool_failed(&self.spec.name, "cancelled"));
                    }
                }
            }

            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::tool_failed(&self.spec.name, "boom"))
            } else {
                Ok(ToolOutput::new(format!("done: {}", args)))
            }
        }
    }

    fn read_spec(name: &str) -> ToolSpec {
        ToolSpec::new(name, "read", ToolCategory::Read, SideEffect::ReadOnly)
            .in_mode("swe")
            .with_param(ParamSpec::required("path", ParamType::String, "path"))
            .with_conflict_key(KeyTemplate::from_arg("fs", "path"))
    }

    fn fixture(tools: Vec<Arc<dyn Tool>>) -> (SessionContext, RolloutOrchestrator) {
        let trace = Arc::new(TraceStore::in_memory().unwrap());
        let session = Session::new("goal", "/tmp/ws");
        trace.create_session(&session).unwrap();

        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }

        let config = Arc::new(CoreConfig::default());
        let orchestrator = RolloutOrchestrator::new(&config);
        let ctx = SessionContext::new(
            session.id,
            trace,
            Arc::new(registry),
            config,
        );
        (ctx, orchestrator)
    }

    fn call(name: &str, path: &str) -> ToolCall {
        ToolCall::new(name, json!({"path": path}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_disjoint_reads() {
        let tool = Arc::new(SleepyTool::new(read_spec("read_file"), 50));
        let peak = tool.peak.clone();
        let (ctx, orchestrator) = fixture(vec![tool]);

        let calls = vec![
            call("read_file", "a.rs"),
            call("read_file", "b.rs"),
            call("read_file", "c.rs"),
        ];
        let correlations: Vec<_> = calls.iter().map(|c| c.correlation.clone()).collect();

        let batch = orchestrator
            .execute(&ctx, None, calls, BatchMode::WaitAll)
            .await
            .unwrap();

        // Sibling calls actually overlapped
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(batch.fork_span.is_some());
        // Submission order preserved regardless of completion order
        for (result, correlation) in batch.results.iter().zip(&correlations) {
            assert_eq!(&result.call.correlation, correlation);
            assert!(result.outcome.is_success());
        }

        // Fork span has three sibling call spans plus the join
        let starts = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::SpanStart])
            .unwrap();
        let fork = batch.fork_span.unwrap().to_string();
        let siblings = starts
            .iter()
            .filter(|e| e.payload_str("parent") == Some(fork.as_str()))
            .count();
        assert_eq!(siblings, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_calls_never_overlap() {
        let tool = Arc::new(SleepyTool::new(read_spec("read_file"), 20));
        let peak = tool.peak.clone();
        let (ctx, orchestrator) = fixture(vec![tool]);

        let calls = vec![
            call("read_file", "same.rs"),
            call("read_file", "same.rs"),
            call("read_file", "same.rs"),
        ];
        let batch = orchestrator
            .execute(&ctx, None, calls, BatchMode::WaitAll)
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(batch.results.iter().all(|r| r.outcome.is_success()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_keys_and_batch_survives() {
        let slow = Arc::new(SleepyTool::new(
            read_spec("slow_read").with_deadline_secs(1),
            120_000,
        ));
        let quick = Arc::new(SleepyTool::new(read_spec("read_file"), 10));
        let (ctx, orchestrator) = fixture(vec![slow, quick]);

        let calls = vec![
            call("slow_read", "stuck.rs"),
            call("read_file", "a.rs"),
            call("read_file", "b.rs"),
        ];
        let batch = orchestrator
            .execute(&ctx, None, calls, BatchMode::WaitAll)
            .await
            .unwrap();

        assert!(!batch.all_failed());
        match &batch.results[0].outcome {
            CallOutcome::Failure(envelope) => {
                assert_eq!(envelope.category, ErrorCategory::Timeout)
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(batch.results[1].outcome.is_success());
        assert!(batch.results[2].outcome.is_success());

        // Keys held by the timed-out call were released
        assert!(orchestrator.lock_table().held_keys().is_empty());

        // Cancel-aware tool yielded within grace: session not degraded
        let session = ctx.trace.get_session(&ctx.session).unwrap().unwrap();
        assert!(!session.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncooperative_tool_degrades_session() {
        let mut stubborn = SleepyTool::new(read_spec("stubborn").with_deadline_secs(1), 600_000);
        stubborn.ignore_cancel = true;
        let (ctx, orchestrator) = fixture(vec![Arc::new(stubborn)]);

        let batch = orchestrator
            .execute(
                &ctx,
                None,
                vec![call("stubborn", "x.rs")],
                BatchMode::WaitAll,
            )
            .await
            .unwrap();

        assert!(batch.all_failed());
        let session = ctx.trace.get_session(&ctx.session).unwrap().unwrap();
        assert!(session.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_cancels_rest() {
        let quick = Arc::new(SleepyTool::new(read_spec("quick"), 5));
        let slow = Arc::new(SleepyTool::new(read_spec("slow"), 50_000));
        let (ctx, orchestrator) = fixture(vec![quick, slow]);

        let batch = orchestrator
            .execute(
                &ctx,
                None,
                vec![
                    call("quick", "a.rs"),
                    call("slow", "b.rs"),
                    call("slow", "c.rs"),
                ],
                BatchMode::FirstSuccess,
            )
            .await
            .unwrap();

        assert!(batch.results[0].outcome.is_success());
        for result in &batch.results[1..] {
            match &result.outcome {
                CallOutcome::Failure(envelope) => {
                    assert_eq!(envelope.category, ErrorCategory::Cancelled)
                }
                other => panic!("expected cancellation, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_call_event_gets_a_result_or_error() {
        let ok = Arc::new(SleepyTool::new(read_spec("ok_tool"), 5));
        let mut failing = SleepyTool::new(read_spec("bad_tool"), 5);
        failing.fail = true;
        let (ctx, orchestrator) = fixture(vec![ok, Arc::new(failing)]);

        orchestrator
            .execute(
                &ctx,
                None,
                vec![call("ok_tool", "a.rs"), call("bad_tool", "b.rs")],
                BatchMode::WaitAll,
            )
            .await
            .unwrap();

        let calls = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::ToolCall])
            .unwrap();
        let closers = ctx
            .trace
            .query_by_kind(&ctx.session, &[EventKind::ToolResult, EventKind::Error])
            .unwrap();
        assert_eq!(calls.len(), 2);
        for event in &calls {
            let correlation = event.correlation().unwrap();
            let matched = closers
                .iter()
                .filter(|e| e.correlation() == Some(correlation.clone()) && e.seq > event.seq)
                .count();
            assert_eq!(matched, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_fails_only_when_every_call_fails() {
        let mut failing = SleepyTool::new(read_spec("bad_tool"), 5);
        failing.fail = true;
        let (ctx, orchestrator) = fixture(vec![Arc::new(failing)]);

        let batch = orchestrator
            .execute(
                &ctx,
                None,
                vec![call("bad_tool", "a.rs"), call("bad_tool", "b.rs")],
                BatchMode::WaitAll,
            )
            .await
            .unwrap();
        assert!(batch.all_failed());
    }
}
