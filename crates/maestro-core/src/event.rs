use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Well-known event topics emitted by the coordination core.
///
/// Consumers subscribe by topic string; the constants keep call sites and
/// subscribers in sync.
pub mod topic {
    /// An agent instance was created and stored.
    pub const AGENT_REGISTERED: &str = "agent:registered";
    /// An agent finished initialization and became active.
    pub const AGENT_INITIALIZED: &str = "agent:initialized";
    /// An agent was stopped and its tasks cancelled.
    pub const AGENT_STOPPED: &str = "agent:stopped";
    /// An agent failed initialization or hit an unrecoverable error.
    pub const AGENT_ERROR: &str = "agent:error";
    /// An agent refreshed its heartbeat timestamp.
    pub const AGENT_HEARTBEAT: &str = "agent:heartbeat";
    /// A task was created and stored.
    pub const TASK_CREATED: &str = "task:created";
    /// A task changed status.
    pub const TASK_UPDATED: &str = "task:updated";
    /// A task reached `Completed`.
    pub const TASK_COMPLETED: &str = "task:completed";
    /// A task reached `Failed` with no retries left.
    pub const TASK_FAILED: &str = "task:failed";
    /// A message exhausted its retries and was dead-lettered.
    pub const MESSAGE_DEAD_LETTER: &str = "message:dead_letter";
    /// A fresh health snapshot was computed for an agent.
    pub const HEALTH_UPDATED: &str = "health:updated";
    /// An agent was classified unhealthy.
    pub const HEALTH_CRITICAL: &str = "health:critical";
    /// Recommendation to take an agent offline (≥3 critical issues).
    pub const HEALTH_AGENT_OFFLINE: &str = "health:agent_offline";
    /// A performance metric trend degraded past the alert threshold.
    pub const PERFORMANCE_ALERT: &str = "performance:alert";
    /// A terminal task outcome was recorded by the tracker.
    pub const PERFORMANCE_TASK_COMPLETED: &str = "performance:task_completed";
    /// The orchestrator finished initialization.
    pub const SYSTEM_INITIALIZED: &str = "system:initialized";
    /// The orchestrator completed shutdown.
    pub const SYSTEM_SHUTDOWN: &str = "system:shutdown";
}

/// A named event published by a core component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Topic string, one of the [`topic`] constants.
    pub topic: String,
    /// UTC timestamp of emission.
    pub timestamp: DateTime<Utc>,
    /// The agent this event concerns, if any.
    pub agent_id: Option<Uuid>,
    /// The task this event concerns, if any.
    pub task_id: Option<Uuid>,
    /// Topic-specific detail payload.
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl SystemEvent {
    /// Creates an event on the given topic with an empty detail payload.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            timestamp: Utc::now(),
            agent_id: None,
            task_id: None,
            detail: serde_json::Value::Null,
        }
    }

    /// Attaches the agent this event concerns.
    #[must_use]
    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Attaches the task this event concerns.
    #[must_use]
    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attaches a detail payload.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A subscriber callback. Invoked synchronously on the publisher's task.
pub type EventHandler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Topic-based publish/subscribe dispatcher.
///
/// Subscribers for a topic are invoked synchronously, in registration
/// order, which keeps test assertions deterministic. Handlers must not
/// block; long-running reactions belong on their own tasks.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(String, EventHandler)>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an exact topic.
    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push((topic.into(), handler));
        }
    }

    /// Publishes an event to every handler subscribed to its topic.
    pub fn publish(&self, event: SystemEvent) {
        let Ok(subs) = self.subscribers.read() else {
            return;
        };
        for (topic, handler) in subs.iter() {
            if *topic == event.topic {
                handler(&event);
            }
        }
    }

    /// Number of registered handlers across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
