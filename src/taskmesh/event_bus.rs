//! Per-task event fabric.
//!
//! Every task owns one [`EventBus`]. Producers publish typed [`TaskEvent`]s
//! without ever blocking; each subscriber receives events in publish order
//! from the moment it subscribed (no history replay). A subscriber that
//! cannot keep up loses only its own oldest events; the drop is counted on
//! that subscriber and nobody else is affected.
//!
//! ```text
//!  agent ─┐                         ┌─▶ EventSubscriber (SSE adapter)
//!  tools ─┼─▶ publish ─▶ fan-out ───┼─▶ EventSubscriber (test probe)
//!  orch  ─┘   (single               └─▶ EventSubscriber (logger)
//!              serialisation point)
//! ```
//!
//! [`EventBus::close`] ends the stream: every subscriber drains what it has
//! and then observes end-of-stream. `log_entry` events are additionally
//! mirrored to an append-only log file when a sink is attached.

use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::taskmesh::message::Message;
use crate::taskmesh::task::TaskStatus;

/// Coarse activity state reported per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentActivity {
    Idle,
    Working,
    Waiting,
}

/// The typed payload of a [`TaskEvent`].
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A complete message was appended to the task history.
    Message { message: Message },

    /// Incremental text from an assistant generation. The final chunk of a
    /// generation carries `is_final: true` and is followed by the full
    /// [`EventKind::Message`].
    StreamChunk {
        message_id: String,
        agent: String,
        delta: String,
        is_final: bool,
    },

    /// A tool invocation is about to execute.
    ToolCallStart {
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
    },

    /// A tool invocation finished (successfully or not).
    ToolCallResult {
        call_id: String,
        tool: String,
        success: bool,
        error: Option<String>,
    },

    /// An agent's activity state changed.
    AgentStatus {
        agent: String,
        activity: AgentActivity,
    },

    /// The task's status changed, or a status-relevant detail occurred.
    TaskUpdate {
        status: TaskStatus,
        detail: Option<String>,
    },

    /// A workspace artifact gained its first version.
    ArtifactCreated { name: String, version: String },

    /// A workspace artifact gained a new version.
    ArtifactUpdated { name: String, version: String },

    /// Free-form diagnostic record.
    LogEntry { level: String, message: String },
}

/// An immutable, timestamped event scoped to one task.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// The owning task.
    pub task_id: String,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub kind: EventKind,
}

/// Default bounded queue depth per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Per-task publish/subscribe fabric with bounded, independent subscriber
/// queues.
pub struct EventBus {
    task_id: String,
    capacity: usize,
    sender: Mutex<Option<broadcast::Sender<TaskEvent>>>,
    log_sink: Option<Mutex<File>>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber capacity.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self::with_capacity(task_id, DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber queue depth.
    pub fn with_capacity(task_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            task_id: task_id.into(),
            capacity: capacity.max(1),
            sender: Mutex::new(Some(sender)),
            log_sink: None,
        }
    }

    /// Mirror `log_entry` events to an append-only file (builder pattern).
    pub fn with_log_sink(mut self, path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.log_sink = Some(Mutex::new(file));
        Ok(self)
    }

    /// The task this bus belongs to.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Queue depth applied to each subscriber.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event. Never blocks: a subscriber with a full queue loses
    /// its own oldest events, counted on that subscriber's handle. Publishing
    /// after [`close`](EventBus::close) is a no-op.
    pub fn publish(&self, kind: EventKind) {
        let event = TaskEvent {
            task_id: self.task_id.clone(),
            timestamp: Utc::now(),
            kind,
        };

        if let EventKind::LogEntry { level, message } = &event.kind {
            if let Some(sink) = &self.log_sink {
                if let Ok(mut file) = sink.lock() {
                    let _ = writeln!(
                        file,
                        "{} [{}] {}",
                        event.timestamp.to_rfc3339(),
                        level,
                        message
                    );
                }
            }
        }

        if let Ok(guard) = self.sender.lock() {
            if let Some(sender) = guard.as_ref() {
                // Err here only means there are currently no subscribers.
                let _ = sender.send(event);
            }
        }
    }

    /// Shorthand for publishing a `log_entry` event.
    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.publish(EventKind::LogEntry {
            level: level.to_string(),
            message: message.into(),
        });
    }

    /// Register a new subscriber. The subscriber observes every event
    /// published after this call, in publish order, until the bus closes.
    /// Returns `None` if the bus is already closed.
    pub fn subscribe(&self) -> Option<EventSubscriber> {
        let guard = self.sender.lock().ok()?;
        guard.as_ref().map(|sender| EventSubscriber {
            receiver: sender.subscribe(),
            dropped: 0,
        })
    }

    /// Terminate the bus. Subscribers drain their queues and then observe
    /// end-of-stream; subsequent publishes are silently discarded.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    /// Whether [`close`](EventBus::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

/// Handle to one subscriber's ordered event stream.
///
/// Dropping the handle unsubscribes. When the subscriber falls behind its
/// queue depth, the oldest unseen events are discarded and counted in
/// [`dropped_events`](EventSubscriber::dropped_events).
pub struct EventSubscriber {
    receiver: broadcast::Receiver<TaskEvent>,
    dropped: u64,
}

impl EventSubscriber {
    /// Await the next event. Returns `None` once the bus has closed and the
    /// queue is drained. Lag (dropped oldest events) is absorbed into the
    /// drop counter and the stream continues with the next available event.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll. `Ok(Some)` yields an event, `Ok(None)` means the
    /// queue is currently empty, `Err(())` means end-of-stream.
    pub fn try_next_event(&mut self) -> Result<Option<TaskEvent>, ()> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(()),
            }
        }
    }

    /// How many events this subscriber has lost to queue overflow.
    pub fn dropped_events(&self) -> u64 {
        self.dropped
    }
}
