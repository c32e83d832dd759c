//! Agent core traits - shared definitions used across the workspace:
//! - Tool trait, ToolKit, ToolError, tool schema/output types
//! - Credits fixed-point amounts
//! - Thread and message records
//! - Store and collaborator traits (ThreadStore, CreditGate, KnowledgeBase)
//! - Sandbox interface with lazy per-project creation

pub mod credits;
pub mod error;
pub mod sandbox;
pub mod store;
pub mod thread;
pub mod tool;

pub use credits::Credits;
pub use error::{Result as ToolResult, ToolError};
pub use sandbox::{ExecRequest, ExecResult, FileInfo, LazySandbox, Sandbox, SandboxProvider};
pub use store::{Admission, CreditGate, KnowledgeBase, ThreadStore};
pub use thread::{MessageRecord, MessageType, NewMessage, RunStatus, ThreadRecord};
pub use tool::{Tool, ToolGroup, ToolKit, ToolOutput, ToolSchema, ToolSource};
