//! Tool registry, schema sanitization and argument validation.
//!
//! Concrete leaf tools live outside this crate; they reach the registry as
//! [`ToolKit`]s. The only built-in kit holds the terminators.

mod registry;
pub mod sanitize;
mod terminator;
pub mod validate;

pub use agentcore_traits::{Tool, ToolError, ToolGroup, ToolKit, ToolOutput, ToolSchema, ToolSource};
pub use registry::{KitSelection, RegisteredTool, ToolRegistry};
pub use sanitize::sanitize_schema;
pub use terminator::{ASK_TOOL, COMPLETE_TOOL, MessageToolKit, is_terminator};
pub use validate::{coerce_arguments, validate_arguments};
