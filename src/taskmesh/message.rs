//! Conversation history records.
//!
//! A [`Message`] is one entry in a task's append-only [`History`]: a role, an
//! optional agent attribution, and an ordered list of [`MessagePart`]s. Tool
//! calls and their results are first-class parts so the pairing invariant
//! (every `tool_call` answered by exactly one `tool_result` before the next
//! assistant turn) can be checked mechanically.
//!
//! Histories persist as newline-delimited JSON, one message per line,
//! append-only. Reloading a history file reconstructs the same sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use uuid::Uuid;

use crate::taskmesh::error::{EngineError, EngineResult};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// One ordered component of a message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePart {
    /// Plain text.
    Text { text: String },

    /// A tool invocation requested by the assistant.
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// The answer to a prior `ToolCall` with the same `call_id`.
    ToolResult {
        call_id: String,
        success: bool,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Reference to a workspace artifact standing in for inline content
    /// (e.g. an oversized tool result spilled to disk).
    AttachmentRef {
        artifact: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
}

/// A single conversation record. Immutable once appended to a [`History`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Opaque message id.
    pub id: String,
    /// Author role.
    pub role: MessageRole,
    /// Producing agent, for assistant and tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Ordered body parts.
    pub parts: Vec<MessagePart>,
    /// When the message was recorded.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn build(role: MessageRole, agent_name: Option<String>, parts: Vec<MessagePart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            agent_name,
            parts,
            timestamp: Utc::now(),
        }
    }

    /// A plain user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::build(
            MessageRole::User,
            None,
            vec![MessagePart::Text { text: text.into() }],
        )
    }

    /// A plain system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::build(
            MessageRole::System,
            None,
            vec![MessagePart::Text { text: text.into() }],
        )
    }

    /// A terminal assistant message attributed to an agent.
    pub fn assistant(agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self::build(
            MessageRole::Assistant,
            Some(agent.into()),
            vec![MessagePart::Text { text: text.into() }],
        )
    }

    /// An assistant message carrying tool calls, with optional leading text.
    pub fn assistant_tool_calls(
        agent: impl Into<String>,
        text: Option<String>,
        calls: Vec<(String, String, serde_json::Value)>,
    ) -> Self {
        let mut parts = Vec::new();
        if let Some(text) = text {
            if !text.is_empty() {
                parts.push(MessagePart::Text { text });
            }
        }
        for (call_id, name, arguments) in calls {
            parts.push(MessagePart::ToolCall {
                call_id,
                name,
                arguments,
            });
        }
        Self::build(MessageRole::Assistant, Some(agent.into()), parts)
    }

    /// A tool message answering one call.
    pub fn tool_result(
        agent: impl Into<String>,
        call_id: impl Into<String>,
        success: bool,
        payload: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self::build(
            MessageRole::Tool,
            Some(agent.into()),
            vec![MessagePart::ToolResult {
                call_id: call_id.into(),
                success,
                payload,
                error,
            }],
        )
    }

    /// Append an attachment reference part (builder pattern).
    pub fn with_attachment(mut self, artifact: impl Into<String>, version: Option<String>) -> Self {
        self.parts.push(MessagePart::AttachmentRef {
            artifact: artifact.into(),
            version,
        });
        self
    }

    /// Concatenated text of every `Text` part.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// The `call_id`s of every `ToolCall` part.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolCall { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Append-only ordered sequence of [`Message`]s with optional disk mirroring.
///
/// When opened with a file path, each appended message is written as one JSON
/// line immediately. Earlier lines are never rewritten.
pub struct History {
    messages: Vec<Message>,
    file_path: Option<PathBuf>,
}

impl History {
    /// An in-memory history with no persistence.
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            file_path: None,
        }
    }

    /// Open a history mirrored to `path`, loading any previously persisted
    /// messages.
    pub fn open(path: PathBuf) -> EngineResult<Self> {
        let messages = if path.exists() {
            let file = fs::File::open(&path)?;
            let reader = BufReader::new(file);
            let mut entries = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let message: Message = serde_json::from_str(&line)
                    .map_err(|e| EngineError::Storage(format!("bad history line: {}", e)))?;
                entries.push(message);
            }
            entries
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Vec::new()
        };

        Ok(Self {
            messages,
            file_path: Some(path),
        })
    }

    /// Append a message, mirroring it to disk when persistence is enabled.
    pub fn push(&mut self, message: Message) -> EngineResult<()> {
        if let Some(path) = &self.file_path {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            let json = serde_json::to_string(&message)?;
            writeln!(file, "{}", json)?;
        }
        self.messages.push(message);
        Ok(())
    }

    /// All messages in append order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages recorded.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Check the tool pairing invariant: every `tool_call` in an assistant
    /// message is answered by exactly one `tool_result` with a matching
    /// `call_id` before the next assistant message.
    pub fn tool_pairing_holds(&self) -> bool {
        let mut open: HashSet<String> = HashSet::new();
        for message in &self.messages {
            match message.role {
                MessageRole::Assistant => {
                    if !open.is_empty() {
                        return false;
                    }
                    for id in message.tool_call_ids() {
                        if !open.insert(id.to_string()) {
                            return false;
                        }
                    }
                }
                MessageRole::Tool => {
                    for part in &message.parts {
                        if let MessagePart::ToolResult { call_id, .. } = part {
                            if !open.remove(call_id) {
                                return false;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        open.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}
