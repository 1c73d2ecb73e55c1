//! Tool system modules and re-exports.

// === Modules ===

pub mod file;
pub mod ledger;
pub mod registry;
pub mod search;
pub mod shell;
pub mod spec;
pub mod substitution;
pub mod task;
pub mod todo;
pub mod web_fetch;

// === Re-exports ===

pub use ledger::FileAccessLedger;
pub use registry::{ConfigurationError, ToolRegistry, ToolRegistryBuilder};
pub use spec::{ToolContext, ToolError, ToolResult, ToolSpec};
pub use todo::{SharedTodoList, TodoList, new_shared_todo_list};
