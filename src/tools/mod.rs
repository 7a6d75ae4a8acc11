//! Tool catalog, visibility masking, and conflict classes.

pub mod builtin;
pub mod conflict;
pub mod mask;
pub mod registry;
pub mod spec;

pub use conflict::{conflicts, partition, ResourceKey};
pub use mask::{check_visible, is_meta, meta_schemas, prompt_schemas, META_TOOLS};
pub use registry::{Tool, ToolOutput, ToolRegistry};
pub use spec::{KeyTemplate, ParamSpec, ParamType, SideEffect, ToolSpec};
