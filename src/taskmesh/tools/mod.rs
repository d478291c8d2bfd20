//! Built-in tools.
//!
//! Concrete tool implementations are deliberately thin; the engine's
//! contract is the [`Tool`](crate::taskmesh::tool_protocol::Tool) trait, and
//! anything can be wired in at task construction. What ships here is the one
//! capability every task needs: workspace I/O, so agents can write the
//! artifacts their plan items name.

pub mod workspace_io;

pub use workspace_io::WorkspaceIoTool;
