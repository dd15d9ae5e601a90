use crate::types::{AgentStatus, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered delivery priority. Higher is delivered first within a mailbox.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Background = 1,
    Low = 2,
    Normal = 3,
    High = 4,
    Urgent = 5,
}

/// Terminal outcome a worker reports for an executed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    /// The worker finished and produced a result.
    Completed {
        #[serde(default)]
        result: serde_json::Value,
    },
    /// The worker started but could not finish.
    Failed { error: String },
    /// The worker declined the task without starting it.
    Rejected { reason: String },
}

/// Typed payload of a [`CoordinationMessage`].
///
/// Known kinds carry typed payloads; `Custom` is the extension point for
/// worker-specific traffic the core does not interpret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Ask the receiving agent to execute the enclosed task.
    TaskRequest { task: Box<Task> },
    /// Worker callback with the outcome of a requested task.
    TaskResponse {
        task_id: Uuid,
        #[serde(flatten)]
        outcome: TaskOutcome,
    },
    /// An agent announcing its own status.
    StatusUpdate {
        agent_id: Uuid,
        status: AgentStatus,
    },
    /// Liveness ping.
    Heartbeat { agent_id: Uuid },
    /// Cooperative stop request.
    ShutdownSignal,
    /// Application-defined traffic, opaque to the core.
    Custom {
        kind: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl MessagePayload {
    /// Short label for logs and statistics.
    pub fn label(&self) -> &str {
        match self {
            MessagePayload::TaskRequest { .. } => "task_request",
            MessagePayload::TaskResponse { .. } => "task_response",
            MessagePayload::StatusUpdate { .. } => "status_update",
            MessagePayload::Heartbeat { .. } => "heartbeat",
            MessagePayload::ShutdownSignal => "shutdown_signal",
            MessagePayload::Custom { kind, .. } => kind,
        }
    }
}

/// A message exchanged between agents through the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub id: Uuid,
    pub payload: MessagePayload,
    /// Sender agent id. Stamped by the router on send.
    pub from: Uuid,
    /// Receiver agent id. `None` means broadcast; the router fills it in
    /// per recipient copy.
    pub to: Option<Uuid>,
    /// Correlates a response with the request that caused it.
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
}

impl CoordinationMessage {
    /// Creates a message with a fresh id and the given payload.
    pub fn new(from: Uuid, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            from,
            to: None,
            correlation_id: None,
            timestamp: Utc::now(),
            priority: MessagePriority::Normal,
        }
    }

    /// Creates a task-request message at the priority the task warrants:
    /// `Urgent` for critical tasks, `Normal` otherwise.
    pub fn task_request(from: Uuid, task: Task) -> Self {
        let priority = if task.priority == crate::types::TaskPriority::Critical {
            MessagePriority::Urgent
        } else {
            MessagePriority::Normal
        };
        Self::new(
            from,
            MessagePayload::TaskRequest {
                task: Box::new(task),
            },
        )
        .with_priority(priority)
    }

    /// Creates a task-response message. Responses ride at high priority so
    /// completions are not starved behind new work.
    pub fn task_response(from: Uuid, task_id: Uuid, outcome: TaskOutcome) -> Self {
        Self::new(from, MessagePayload::TaskResponse { task_id, outcome })
            .with_priority(MessagePriority::High)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
