//! Workspace I/O tool.
//!
//! Gives agents read/write/list access to their task's versioned workspace,
//! and nothing outside it. Path confinement is enforced by the workspace
//! itself; an escaping path comes back to the agent as a failed result, not
//! an exception.

use async_trait::async_trait;
use std::sync::Arc;

use crate::taskmesh::tool_protocol::{ArgSpec, ArgType, Tool, ToolError, ToolMetadata};
use crate::taskmesh::workspace::Workspace;

/// Workspace-bound file tool exposing `write_file`, `read_file`, and
/// `list_files`.
pub struct WorkspaceIoTool {
    workspace: Arc<Workspace>,
}

impl WorkspaceIoTool {
    /// Bind the tool to one task's workspace.
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WorkspaceIoTool {
    fn methods(&self) -> Vec<ToolMetadata> {
        vec![
            ToolMetadata::new(
                "write_file",
                "Write (or overwrite) a named artifact in the task workspace. \
                 Each write creates a new version.",
            )
            .with_arg(
                ArgSpec::new("path", ArgType::String)
                    .describe("Workspace-relative artifact name, e.g. report.md")
                    .required(),
            )
            .with_arg(
                ArgSpec::new("content", ArgType::String)
                    .describe("Full file content")
                    .required(),
            )
            .with_arg(
                ArgSpec::new("content_type", ArgType::String)
                    .describe("MIME type; defaults to text/plain"),
            ),
            ToolMetadata::new("read_file", "Read the latest version of a workspace artifact.")
                .with_arg(
                    ArgSpec::new("path", ArgType::String)
                        .describe("Workspace-relative artifact name")
                        .required(),
                ),
            ToolMetadata::new("list_files", "List the artifacts in the task workspace."),
        ]
    }

    async fn invoke(
        &self,
        method: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        match method {
            "write_file" => {
                let path = arguments["path"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidParameters("path must be a string".into()))?;
                let content = arguments["content"].as_str().ok_or_else(|| {
                    ToolError::InvalidParameters("content must be a string".into())
                })?;
                let content_type = arguments["content_type"].as_str().unwrap_or("text/plain");

                let version = self
                    .workspace
                    .write(path, content.as_bytes(), content_type, Some("agent write"))
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(serde_json::json!({
                    "path": version.name,
                    "version": version.version_id,
                    "bytes": version.size,
                }))
            }
            "read_file" => {
                let path = arguments["path"]
                    .as_str()
                    .ok_or_else(|| ToolError::InvalidParameters("path must be a string".into()))?;
                let bytes = self
                    .workspace
                    .read(path, None)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?
                    .ok_or_else(|| ToolError::Execution(format!("no such artifact: {}", path)))?;
                match String::from_utf8(bytes) {
                    Ok(text) => Ok(serde_json::json!({ "path": path, "content": text })),
                    Err(_) => Err(ToolError::Execution(format!(
                        "artifact {} is not text",
                        path
                    ))),
                }
            }
            "list_files" => {
                let entries = self
                    .workspace
                    .list()
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                let files: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "name": e.name,
                            "size": e.size,
                            "versions": e.version_count,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "files": files }))
            }
            other => Err(ToolError::NotFound(other.to_string())),
        }
    }
}
