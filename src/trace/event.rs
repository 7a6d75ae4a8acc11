//! Event and span types for the append-only session trace.
//!
//! Every externally observable action in a session is recorded as an event.
//! Events are immutable, totally ordered per session by a gap-free sequence
//! number, and can be rendered differently depending on the consumer:
//! - CLI: one-line log output
//! - Analysis: JSON export for replay
//! - Replay: byte-identical conversation reconstruction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a span within a session's trace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub Uuid);

impl SpanId {
    /// Generate a new random span ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation identifier pairing a TOOL_CALL with its TOOL_RESULT or ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of events appended to a session trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A span opened
    SpanStart,
    /// A span closed
    SpanEnd,
    /// A tool call was dispatched
    ToolCall,
    /// A tool call produced a result
    ToolResult,
    /// A prompt was sent to the LLM (references the prompt artifact)
    LlmRequest,
    /// The LLM responded (references the verbatim response artifact)
    LlmResponse,
    /// A session, phase, or todo state transition
    StateTransition,
    /// An error was recorded
    Error,
    /// A checkpoint snapshot was written
    Checkpoint,
    /// Input arrived from the user
    HumanInput,
    /// Marks the end of a multi-event logical transition
    Commit,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SpanStart => "SPAN_START",
            Self::SpanEnd => "SPAN_END",
            Self::ToolCall => "TOOL_CALL",
            Self::ToolResult => "TOOL_RESULT",
            Self::LlmRequest => "LLM_REQUEST",
            Self::LlmResponse => "LLM_RESPONSE",
            Self::StateTransition => "STATE_TRANSITION",
            Self::Error => "ERROR",
            Self::Checkpoint => "CHECKPOINT",
            Self::HumanInput => "HUMAN_INPUT",
            Self::Commit => "COMMIT",
        };
        write!(f, "{}", s)
    }
}

impl EventKind {
    /// Parse the SCREAMING_SNAKE_CASE form used in storage.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SPAN_START" => Some(Self::SpanStart),
            "SPAN_END" => Some(Self::SpanEnd),
            "TOOL_CALL" => Some(Self::ToolCall),
            "TOOL_RESULT" => Some(Self::ToolResult),
            "LLM_REQUEST" => Some(Self::LlmRequest),
            "LLM_RESPONSE" => Some(Self::LlmResponse),
            "STATE_TRANSITION" => Some(Self::StateTransition),
            "ERROR" => Some(Self::Error),
            "CHECKPOINT" => Some(Self::Checkpoint),
            "HUMAN_INPUT" => Some(Self::HumanInput),
            "COMMIT" => Some(Self::Commit),
            _ => None,
        }
    }
}

/// An immutable record appended to a session's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Gap-free sequence number, starting at 1 per session
    pub seq: u64,
    /// Kind of the event
    pub kind: EventKind,
    /// Wall-clock timestamp
    pub wall: DateTime<Utc>,
    /// Monotonic nanoseconds since the trace store opened
    pub mono_ns: u64,
    /// The span this event belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<SpanId>,
    /// Structured payload
    pub payload: Value,
}

impl Event {
    /// Get a payload field as string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key)?.as_str()
    }

    /// The correlation id, for TOOL_CALL / TOOL_RESULT / ERROR events.
    pub fn correlation(&self) -> Option<CorrelationId> {
        self.payload_str("correlation")
            .and_then(|s| CorrelationId::parse(s).ok())
    }

    /// Format as a single-line log entry.
    pub fn as_log_line(&self) -> String {
        let summary = self
            .payload_str("name")
            .or_else(|| self.payload_str("tool"))
            .or_else(|| self.payload_str("transition"))
            .or_else(|| self.payload_str("message"))
            .unwrap_or("");
        format!(
            "[{:>6}] {} {}: {}",
            self.seq,
            self.wall.format("%H:%M:%S%.3f"),
            self.kind,
            summary
        )
    }
}

/// Export format for trace data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// JSON Lines (one event per line)
    JsonLines,
    /// Pretty-printed JSON array
    JsonPretty,
    /// One-line log entries
    Log,
}

/// Serialize a list of events to the given format.
pub fn export_events(events: &[Event], format: ExportFormat) -> String {
    match format {
        ExportFormat::JsonLines => events
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n"),
        ExportFormat::JsonPretty => {
            serde_json::to_string_pretty(events).unwrap_or_else(|_| "[]".to_string())
        }
        ExportFormat::Log => events
            .iter()
            .map(Event::as_log_line)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(seq: u64, kind: EventKind, payload: Value) -> Event {
        Event {
            seq,
            kind,
            wall: Utc::now(),
            mono_ns: seq * 1_000,
            span: None,
            payload,
        }
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            EventKind::SpanStart,
            EventKind::SpanEnd,
            EventKind::ToolCall,
            EventKind::ToolResult,
            EventKind::LlmRequest,
            EventKind::LlmResponse,
            EventKind::StateTransition,
            EventKind::Error,
            EventKind::Checkpoint,
            EventKind::HumanInput,
            EventKind::Commit,
        ] {
            assert_eq!(EventKind::parse(&kind.to_string()), Some(kind));
        }
    }

    #[test]
    fn test_correlation_extraction() {
        let correlation = CorrelationId::new();
        let event = sample(
            1,
            EventKind::ToolCall,
            json!({"correlation": correlation.to_string(), "tool": "read_file"}),
        );
        assert_eq!(event.correlation(), Some(correlation));
    }

    #[test]
    fn test_log_line() {
        let event = sample(3, EventKind::ToolCall, json!({"tool": "bash"}));
        let line = event.as_log_line();
        assert!(line.contains("TOOL_CALL"));
        assert!(line.contains("bash"));
    }

    #[test]
    fn test_export_json_lines() {
        let events = vec![
            sample(1, EventKind::SpanStart, json!({"name": "turn"})),
            sample(2, EventKind::SpanEnd, json!({"name": "turn"})),
        ];
        let exported = export_events(&events, ExportFormat::JsonLines);
        assert_eq!(exported.lines().count(), 2);
    }
}
