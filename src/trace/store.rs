//! Durable, append-only trace store.
//!
//! One SQLite database holds session manifests, the per-session event logs,
//! and fork lineage; artifacts live next to it in a shared content-addressed
//! blob directory. `append_event` is the atomic unit: an event row and the
//! manifest's sequence counter commit together or not at all.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::phase::Phase;
use crate::session::{Session, SessionId, SessionStatus};
use crate::trace::artifact::{ArtifactId, ArtifactStore};
use crate::trace::event::{Event, EventKind, SpanId};
use crate::trace::schema::initialize_schema;

/// Store for session traces and shared artifacts.
pub struct TraceStore {
    conn: Arc<Mutex<Connection>>,
    artifacts: ArtifactStore,
    origin: Instant,
}

impl TraceStore {
    /// Open or create a trace store.
    pub fn open(db_path: impl AsRef<Path>, blob_root: impl Into<PathBuf>) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("create data dir: {}", e)))?;
        }
        let conn = Connection::open(db_path)?;
        initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            artifacts: ArtifactStore::open(blob_root)?,
            origin: Instant::now(),
        })
    }

    /// Create an in-memory store (for testing). Blobs land in a unique
    /// directory under the system temp dir.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        let blob_root =
            std::env::temp_dir().join(format!("compymac-blobs-{}", uuid::Uuid::new_v4()));

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            artifacts: ArtifactStore::open(blob_root)?,
            origin: Instant::now(),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(Error::from)
    }

    fn mono_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    // ==================== Sessions ====================

    /// Create a session and persist its manifest.
    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (
                    id, goal, workspace, phase, mode, status, degraded,
                    parent_id, last_seq, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    session.id.to_string(),
                    session.goal,
                    session.workspace.to_string_lossy(),
                    session.phase.as_str(),
                    session.mode,
                    session.status.as_str(),
                    session.degraded as i32,
                    session.parent.as_ref().map(|p| p.to_string()),
                    session.last_seq as i64,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get a session manifest by ID.
    pub fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, goal, workspace, phase, mode, status, degraded,
                        parent_id, last_seq, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_session,
            )
            .optional()
        })
    }

    /// List sessions, optionally filtered by status.
    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, goal, workspace, phase, mode, status, degraded,
                                parent_id, last_seq, created_at, updated_at
                         FROM sessions WHERE status = ?1 ORDER BY created_at",
                    )?;
                    let rows = stmt.query_map(params![status.as_str()], Self::row_to_session)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, goal, workspace, phase, mode, status, degraded,
                                parent_id, last_seq, created_at, updated_at
                         FROM sessions ORDER BY created_at",
                    )?;
                    let rows = stmt.query_map([], Self::row_to_session)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        let id: String = row.get(0)?;
        let workspace: String = row.get(2)?;
        let phase: String = row.get(3)?;
        let status: String = row.get(5)?;
        let parent: Option<String> = row.get(7)?;
        let created_at: String = row.get(9)?;
        let updated_at: String = row.get(10)?;

        Ok(Session {
            id: SessionId::parse(&id).unwrap_or_default(),
            goal: row.get(1)?,
            workspace: PathBuf::from(workspace),
            phase: Phase::parse(&phase).unwrap_or(Phase::Localize),
            mode: row.get(4)?,
            status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Interrupted),
            degraded: row.get::<_, i32>(6)? != 0,
            parent: parent.and_then(|p| SessionId::parse(&p).ok()),
            last_seq: row.get::<_, i64>(8)? as u64,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    /// Update a session's status.
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<()> {
        self.update_manifest(id, "status", status.as_str())
    }

    /// Update a session's phase.
    pub fn set_phase(&self, id: &SessionId, phase: Phase) -> Result<()> {
        self.update_manifest(id, "phase", phase.as_str())
    }

    /// Update a session's active tool mode.
    pub fn set_mode(&self, id: &SessionId, mode: &str) -> Result<()> {
        self.update_manifest(id, "mode", mode)
    }

    /// Flag a session as degraded (a worker leaked past cancellation).
    pub fn set_degraded(&self, id: &SessionId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET degraded = 1, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn update_manifest(&self, id: &SessionId, column: &str, value: &str) -> Result<()> {
        // Column names come from this file only, never from input
        let sql = format!(
            "UPDATE sessions SET {} = ?2, updated_at = ?3 WHERE id = ?1",
            column
        );
        let updated = self.with_conn(|conn| {
            conn.execute(
                &sql,
                params![id.to_string(), value, Utc::now().to_rfc3339()],
            )
        })?;
        if updated == 0 {
            return Err(Error::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    // ==================== Events ====================

    /// Append an event to a session's trace.
    ///
    /// Sequence numbers are contiguous starting at 1. Fails with
    /// `SessionClosed` when the session is terminal. The event row and the
    /// manifest counter commit in one transaction.
    pub fn append_event(
        &self,
        session: &SessionId,
        kind: EventKind,
        payload: Value,
        span: Option<&SpanId>,
    ) -> Result<Event> {
        let wall = Utc::now();
        let mono_ns = self.mono_ns();

        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        let tx = conn.unchecked_transaction()?;

        let (status, last_seq): (String, i64) = tx
            .query_row(
                "SELECT status, last_seq FROM sessions WHERE id = ?1",
                params![session.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("session {}", session)))?;

        let status =
            SessionStatus::parse(&status).unwrap_or(SessionStatus::Interrupted);
        if status.is_terminal() {
            return Err(Error::session_closed(
                session.to_string(),
                status.to_string(),
            ));
        }

        let seq = (last_seq as u64) + 1;
        tx.execute(
            "INSERT INTO events (session_id, seq, kind, wall, mono_ns, span_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.to_string(),
                seq as i64,
                kind.to_string(),
                wall.to_rfc3339(),
                mono_ns as i64,
                span.map(|s| s.to_string()),
                serde_json::to_string(&payload)?,
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET last_seq = ?2, updated_at = ?3 WHERE id = ?1",
            params![session.to_string(), seq as i64, wall.to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(Event {
            seq,
            kind,
            wall,
            mono_ns,
            span: span.cloned(),
            payload,
        })
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
        let kind: String = row.get(1)?;
        let wall: String = row.get(2)?;
        let span: Option<String> = row.get(4)?;
        let payload: String = row.get(5)?;

        Ok(Event {
            seq: row.get::<_, i64>(0)? as u64,
            kind: EventKind::parse(&kind).unwrap_or(EventKind::Error),
            wall: chrono::DateTime::parse_from_rfc3339(&wall)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            mono_ns: row.get::<_, i64>(3)? as u64,
            span: span.and_then(|s| SpanId::parse(&s).ok()),
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        })
    }

    /// Ordered events in `[from_seq, to_seq]` (inclusive; `None` = open end).
    /// Finite and restartable: the same bounds yield the same sequence.
    pub fn iterate(
        &self,
        session: &SessionId,
        from_seq: u64,
        to_seq: Option<u64>,
    ) -> Result<Vec<Event>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, kind, wall, mono_ns, span_id, payload
                 FROM events
                 WHERE session_id = ?1 AND seq >= ?2 AND seq <= ?3
                 ORDER BY seq",
            )?;
            let upper = to_seq.map(|s| s as i64).unwrap_or(i64::MAX);
            let rows = stmt.query_map(
                params![session.to_string(), from_seq as i64, upper],
                Self::row_to_event,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Events of the given kinds, in sequence order.
    pub fn query_by_kind(&self, session: &SessionId, kinds: &[EventKind]) -> Result<Vec<Event>> {
        let events = self.iterate(session, 1, None)?;
        Ok(events
            .into_iter()
            .filter(|e| kinds.contains(&e.kind))
            .collect())
    }

    /// The highest sequence number appended to the session so far.
    pub fn last_seq(&self, session: &SessionId) -> Result<u64> {
        self.get_session(session)?
            .map(|s| s.last_seq)
            .ok_or_else(|| Error::NotFound(format!("session {}", session)))
    }

    // ==================== Spans ====================

    /// Open a named span; emits SPAN_START.
    pub fn open_span(
        &self,
        session: &SessionId,
        name: &str,
        parent: Option<&SpanId>,
        attributes: Value,
    ) -> Result<SpanId> {
        let span = SpanId::new();
        self.append_event(
            session,
            EventKind::SpanStart,
            json!({
                "name": name,
                "parent": parent.map(|p| p.to_string()),
                "attributes": attributes,
            }),
            Some(&span),
        )?;
        Ok(span)
    }

    /// Close a span; emits SPAN_END. All child spans must already be closed.
    pub fn close_span(
        &self,
        session: &SessionId,
        span: &SpanId,
        status: &str,
        attributes: Value,
    ) -> Result<Event> {
        let open = self.open_child_spans(session, span)?;
        if !open.is_empty() {
            return Err(Error::Internal(format!(
                "span {} has {} open child span(s)",
                span,
                open.len()
            )));
        }
        self.append_event(
            session,
            EventKind::SpanEnd,
            json!({
                "status": status,
                "attributes": attributes,
            }),
            Some(span),
        )
    }

    /// Child spans of `parent` whose SPAN_END has not been recorded.
    fn open_child_spans(&self, session: &SessionId, parent: &SpanId) -> Result<Vec<SpanId>> {
        let events = self.query_by_kind(session, &[EventKind::SpanStart, EventKind::SpanEnd])?;
        let parent_str = parent.to_string();

        let mut children: Vec<SpanId> = Vec::new();
        for event in &events {
            if event.kind == EventKind::SpanStart
                && event.payload_str("parent") == Some(parent_str.as_str())
            {
                if let Some(span) = &event.span {
                    children.push(span.clone());
                }
            }
        }
        Ok(children
            .into_iter()
            .filter(|child| {
                !events
                    .iter()
                    .any(|e| e.kind == EventKind::SpanEnd && e.span.as_ref() == Some(child))
            })
            .collect())
    }

    // ==================== Artifacts ====================

    /// Store a content-addressed artifact; idempotent.
    pub fn put_artifact(&self, bytes: &[u8]) -> Result<ArtifactId> {
        self.artifacts.put(bytes)
    }

    /// Fetch an artifact's bytes.
    pub fn get_artifact(&self, id: &ArtifactId) -> Result<Vec<u8>> {
        self.artifacts.get(id)
    }

    /// Fetch an artifact as UTF-8.
    pub fn get_artifact_string(&self, id: &ArtifactId) -> Result<String> {
        self.artifacts.get_string(id)
    }

    /// Access to the underlying blob store.
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    // ==================== Checkpoints & lineage ====================

    /// Write a checkpoint snapshot: stores the snapshot as an artifact and
    /// records a CHECKPOINT event referencing it.
    pub fn write_checkpoint(
        &self,
        session: &SessionId,
        snapshot: &[u8],
    ) -> Result<(ArtifactId, u64)> {
        let artifact = self.put_artifact(snapshot)?;
        let event = self.append_event(
            session,
            EventKind::Checkpoint,
            json!({ "artifact": artifact.as_str() }),
            None,
        )?;
        Ok((artifact, event.seq))
    }

    /// The most recent checkpoint artifact for a session, if any.
    pub fn latest_checkpoint(&self, session: &SessionId) -> Result<Option<ArtifactId>> {
        let checkpoints = self.query_by_kind(session, &[EventKind::Checkpoint])?;
        Ok(checkpoints
            .last()
            .and_then(|e| e.payload_str("artifact").map(String::from))
            .and_then(|s| ArtifactId::parse(&s).ok()))
    }

    /// Record that `child` was forked from `parent` at `checkpoint`.
    pub fn record_lineage(
        &self,
        child: &SessionId,
        parent: &SessionId,
        checkpoint: &ArtifactId,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO lineage (child_id, parent_id, checkpoint, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    child.to_string(),
                    parent.to_string(),
                    checkpoint.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// The (parent, checkpoint) a session was forked from, if any.
    pub fn lineage_of(&self, child: &SessionId) -> Result<Option<(SessionId, ArtifactId)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT parent_id, checkpoint FROM lineage WHERE child_id = ?1",
                params![child.to_string()],
                |row| {
                    let parent: String = row.get(0)?;
                    let checkpoint: String = row.get(1)?;
                    Ok((parent, checkpoint))
                },
            )
            .optional()
        })
        .map(|opt| {
            opt.and_then(|(p, c)| {
                Some((SessionId::parse(&p).ok()?, ArtifactId::parse(&c).ok()?))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_with_session() -> (TraceStore, Session) {
        let store = TraceStore::in_memory().unwrap();
        let session = Session::new("test goal", "/tmp/ws");
        store.create_session(&session).unwrap();
        (store, session)
    }

    #[test]
    fn test_sequence_is_dense_from_one() {
        let (store, session) = store_with_session();
        for expected in 1..=5u64 {
            let event = store
                .append_event(&session.id, EventKind::HumanInput, json!({}), None)
                .unwrap();
            assert_eq!(event.seq, expected);
        }
        assert_eq!(store.last_seq(&session.id).unwrap(), 5);
    }

    #[test]
    fn test_terminal_session_refuses_events() {
        let (store, session) = store_with_session();
        store
            .set_status(&session.id, SessionStatus::Completed)
            .unwrap();
        let err = store
            .append_event(&session.id, EventKind::HumanInput, json!({}), None)
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed { .. }));
    }

    #[test]
    fn test_paused_session_accepts_events() {
        let (store, session) = store_with_session();
        store.set_status(&session.id, SessionStatus::Paused).unwrap();
        store
            .append_event(&session.id, EventKind::HumanInput, json!({}), None)
            .unwrap();
    }

    #[test]
    fn test_span_close_checks_children() {
        let (store, session) = store_with_session();
        let fork = store
            .open_span(&session.id, "fork", None, json!({}))
            .unwrap();
        let child = store
            .open_span(&session.id, "call", Some(&fork), json!({}))
            .unwrap();

        let err = store
            .close_span(&session.id, &fork, "ok", json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        store
            .close_span(&session.id, &child, "ok", json!({}))
            .unwrap();
        store
            .close_span(&session.id, &fork, "ok", json!({}))
            .unwrap();
    }

    #[test]
    fn test_iterate_bounds_are_restartable() {
        let (store, session) = store_with_session();
        for i in 0..6 {
            store
                .append_event(&session.id, EventKind::HumanInput, json!({"i": i}), None)
                .unwrap();
        }
        let first = store.iterate(&session.id, 2, Some(4)).unwrap();
        let second = store.iterate(&session.id, 2, Some(4)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].seq, 2);
        assert_eq!(first[2].seq, 4);
    }

    #[test]
    fn test_query_by_kind() {
        let (store, session) = store_with_session();
        store
            .append_event(&session.id, EventKind::HumanInput, json!({}), None)
            .unwrap();
        store
            .append_event(&session.id, EventKind::StateTransition, json!({}), None)
            .unwrap();
        store
            .append_event(&session.id, EventKind::HumanInput, json!({}), None)
            .unwrap();

        let inputs = store
            .query_by_kind(&session.id, &[EventKind::HumanInput])
            .unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].seq, 1);
        assert_eq!(inputs[1].seq, 3);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let (store, session) = store_with_session();
        let (artifact, seq) = store
            .write_checkpoint(&session.id, b"{\"snapshot\": true}")
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(
            store.latest_checkpoint(&session.id).unwrap(),
            Some(artifact.clone())
        );
        assert_eq!(
            store.get_artifact(&artifact).unwrap(),
            b"{\"snapshot\": true}"
        );
    }

    #[test]
    fn test_lineage_roundtrip() {
        let (store, parent) = store_with_session();
        let (artifact, _) = store.write_checkpoint(&parent.id, b"snap").unwrap();

        let mut child = Session::new("forked", "/tmp/ws");
        child.parent = Some(parent.id.clone());
        store.create_session(&child).unwrap();
        store
            .record_lineage(&child.id, &parent.id, &artifact)
            .unwrap();

        let (found_parent, found_ckpt) = store.lineage_of(&child.id).unwrap().unwrap();
        assert_eq!(found_parent, parent.id);
        assert_eq!(found_ckpt, artifact);
    }

    #[test]
    fn test_session_manifest_updates() {
        let (store, session) = store_with_session();
        store.set_phase(&session.id, Phase::Fix).unwrap();
        store.set_mode(&session.id, "browser").unwrap();
        store.set_degraded(&session.id).unwrap();

        let loaded = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Fix);
        assert_eq!(loaded.mode, "browser");
        assert!(loaded.degraded);
    }

    #[test]
    fn test_list_sessions_by_status() {
        let store = TraceStore::in_memory().unwrap();
        let a = Session::new("a", "/tmp");
        let b = Session::new("b", "/tmp");
        store.create_session(&a).unwrap();
        store.create_session(&b).unwrap();
        store.set_status(&b.id, SessionStatus::Paused).unwrap();

        let running = store.list_sessions(Some(SessionStatus::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
        assert_eq!(store.list_sessions(None).unwrap().len(), 2);
    }
}
