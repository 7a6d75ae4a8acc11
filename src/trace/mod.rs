//! Append-only session traces and content-addressed artifacts.

pub mod artifact;
pub mod event;
pub mod schema;
pub mod store;

pub use artifact::{ArtifactId, ArtifactStore};
pub use event::{export_events, CorrelationId, Event, EventKind, ExportFormat, SpanId};
pub use store::TraceStore;
