//! Built-in tool implementations.
//!
//! This set is illustrative, not exhaustive: the execution subsystem only
//! needs a tool invocation contract (name in, [`super::ToolResult`] out) to
//! dispatch an LLM's tool calls and feed the results back. Concrete tool
//! coverage belongs to whatever surface wires up [`super::ToolExecutor`].

mod glob;
mod grep;
mod list_directory;
mod read_file;
mod write_file;

pub use glob::GlobTool;
pub use grep::GrepTool;
pub use list_directory::ListDirectoryTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;
