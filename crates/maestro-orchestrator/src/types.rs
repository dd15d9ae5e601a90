use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declared skill of an agent, with the quality signals the distributor
/// scores on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Nominal execution time for one invocation, in milliseconds.
    pub execution_time_ms: u64,
    /// Historical reliability, 0.0–1.0.
    pub reliability: f64,
    /// Parameter schema for payloads this capability accepts.
    #[serde(default)]
    pub parameters: Vec<CapabilityParameter>,
}

impl AgentCapability {
    pub fn new(name: impl Into<String>, execution_time_ms: u64, reliability: f64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            execution_time_ms,
            reliability,
            parameters: Vec::new(),
        }
    }
}

/// One declared parameter of a capability's payload schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityParameter {
    pub name: String,
    /// JSON kind expected: "string", "number", "boolean", "object", "array".
    pub kind: String,
    pub required: bool,
}

/// Resource bounds an agent declares for itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: f64,
    pub max_cpu_cores: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 1024.0,
            max_cpu_cores: 1.0,
        }
    }
}

/// Immutable description of a worker, supplied by whoever hosts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpecification {
    /// Worker type identifier, e.g. "builder" or "reviewer".
    pub agent_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    pub capabilities: Vec<AgentCapability>,
    pub max_concurrent_tasks: usize,
    /// Scheduling priority relative to other agents of the same type.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub resources: ResourceLimits,
}

impl AgentSpecification {
    pub fn new(agent_type: impl Into<String>, max_concurrent_tasks: usize) -> Self {
        let agent_type = agent_type.into();
        Self {
            name: agent_type.clone(),
            agent_type,
            description: String::new(),
            version: String::new(),
            capabilities: Vec::new(),
            max_concurrent_tasks,
            priority: 0,
            resources: ResourceLimits::default(),
        }
    }

    #[must_use]
    pub fn with_capability(mut self, capability: AgentCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }
}

/// Lifecycle state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Initializing,
    Active,
    Busy,
    Idle,
    Stopping,
    Inactive,
    Error,
    Maintenance,
}

impl AgentStatus {
    /// Whether the state machine allows moving to `next`.
    ///
    /// Initializing → Active; Active ⇄ Busy; Busy → Idle; Idle ⇄ Active;
    /// any → Stopping → Inactive; any → Error → Maintenance → Active.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if matches!(next, Stopping | Error) {
            return !matches!(self, Inactive);
        }
        matches!(
            (self, next),
            (Initializing, Active)
                | (Active, Busy)
                | (Busy, Active)
                | (Busy, Idle)
                | (Idle, Active)
                | (Active, Idle)
                | (Idle, Busy)
                | (Stopping, Inactive)
                | (Error, Maintenance)
                | (Maintenance, Active)
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Initializing => "INITIALIZING",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Stopping => "STOPPING",
            AgentStatus::Inactive => "INACTIVE",
            AgentStatus::Error => "ERROR",
            AgentStatus::Maintenance => "MAINTENANCE",
        };
        write!(f, "{s}")
    }
}

/// Mutable counters tracked per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_in_progress: u64,
    pub average_task_time_ms: f64,
    /// Percentage, 0–100. Starts at 100 until the first failure.
    pub success_rate: f64,
    pub error_count: u64,
    pub warning_count: u64,
    pub last_active: DateTime<Utc>,
    pub total_uptime_ms: u64,
    pub memory_usage_mb: f64,
    pub cpu_usage_pct: f64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_in_progress: 0,
            average_task_time_ms: 0.0,
            success_rate: 100.0,
            error_count: 0,
            warning_count: 0,
            last_active: Utc::now(),
            total_uptime_ms: 0,
            memory_usage_mb: 0.0,
            cpu_usage_pct: 0.0,
        }
    }
}

impl AgentMetrics {
    fn refresh_success_rate(&mut self) {
        let total = self.tasks_completed + self.error_count;
        self.success_rate = if total > 0 {
            (self.tasks_completed as f64 / total as f64) * 100.0
        } else {
            100.0
        };
    }
}

/// A live, registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: Uuid,
    pub spec: AgentSpecification,
    pub status: AgentStatus,
    /// Ids of tasks currently assigned to this agent. Never longer than
    /// `spec.max_concurrent_tasks`.
    pub current_tasks: Vec<Uuid>,
    pub metrics: AgentMetrics,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentInstance {
    pub fn new(spec: AgentSpecification) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: AgentStatus::Initializing,
            current_tasks: Vec::new(),
            metrics: AgentMetrics::default(),
            last_heartbeat: Utc::now(),
        }
    }

    /// Current task count over max concurrency, clamped to [0, 1].
    pub fn current_load(&self) -> f64 {
        if self.spec.max_concurrent_tasks == 0 {
            return 1.0;
        }
        (self.current_tasks.len() as f64 / self.spec.max_concurrent_tasks as f64).min(1.0)
    }

    /// Remaining concurrency headroom.
    pub fn available_capacity(&self) -> usize {
        self.spec
            .max_concurrent_tasks
            .saturating_sub(self.current_tasks.len())
    }

    /// Whether every required capability name is declared by this agent.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|req| self.spec.capabilities.iter().any(|cap| cap.name == *req))
    }

    pub fn capability(&self, name: &str) -> Option<&AgentCapability> {
        self.spec.capabilities.iter().find(|cap| cap.name == name)
    }

    /// Whether the agent could be handed this task right now: active or
    /// idle, capable, and below its concurrency limit.
    pub fn can_accept(&self, task: &Task) -> bool {
        matches!(self.status, AgentStatus::Active | AgentStatus::Idle)
            && self.has_capabilities(&task.required_capabilities)
            && self.available_capacity() > 0
    }

    /// Folds one successful task into the running counters.
    pub fn record_completion(&mut self, duration_ms: u64) {
        let total_time =
            self.metrics.average_task_time_ms * self.metrics.tasks_completed as f64
                + duration_ms as f64;
        self.metrics.tasks_completed += 1;
        self.metrics.average_task_time_ms = total_time / self.metrics.tasks_completed as f64;
        self.metrics.refresh_success_rate();
        self.metrics.last_active = Utc::now();
    }

    /// Folds one failed task into the running counters.
    pub fn record_failure(&mut self) {
        self.metrics.error_count += 1;
        self.metrics.refresh_success_rate();
        self.metrics.last_active = Utc::now();
    }
}

/// Ordered task priority. Higher wins ties in queues.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Background = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    Critical = 5,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Background => "BACKGROUND",
            TaskPriority::Low => "LOW",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::High => "HIGH",
            TaskPriority::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    OnHold,
    Blocked,
}

impl TaskStatus {
    /// Completed, Failed, and Cancelled admit no further transitions
    /// through the public API.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving to `next`.
    ///
    /// Pending → Queued → InProgress → Completed | Failed; Cancelled is
    /// reachable from any non-terminal state; OnHold/Blocked are manual
    /// holds that re-enter Queued. Retry and reassignment resets back to
    /// Pending go through dedicated internal paths, not this check.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, OnHold)
                | (Queued, InProgress)
                | (Queued, OnHold)
                | (Queued, Blocked)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (OnHold, Queued)
                | (Blocked, Queued)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::OnHold => "ON_HOLD",
            TaskStatus::Blocked => "BLOCKED",
        };
        write!(f, "{s}")
    }
}

/// A unit of work routed through the coordination core.
///
/// Tasks are never physically deleted; terminal tasks are retained for
/// metrics and audit, and callers prune externally if needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Opaque task type, meaningful to workers and reporting only.
    pub task_type: String,
    pub name: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub required_capabilities: Vec<String>,
    /// Opaque parameter bag handed to the executing worker.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Advisory predecessor task ids. Not enforced by a DAG scheduler.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    pub estimated_duration_ms: u64,
    pub actual_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    pub fn new(task_type: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            name: name.into(),
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            required_capabilities: Vec::new(),
            parameters: serde_json::Map::new(),
            dependencies: Vec::new(),
            estimated_duration_ms: 0,
            actual_duration_ms: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 0,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_estimated_duration(mut self, estimated_duration_ms: u64) -> Self {
        self.estimated_duration_ms = estimated_duration_ms;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Clears assignment state so the task can re-enter distribution.
    pub fn reset_for_redistribution(&mut self) {
        self.status = TaskStatus::Pending;
        self.assigned_agent_id = None;
        self.started_at = None;
        self.updated_at = Utc::now();
    }
}

/// Shared, lock-guarded registry of live agents, keyed by id.
///
/// All mutation goes through the orchestrator and distributor APIs; no
/// component reaches into another's maps directly.
pub type AgentRegistry =
    std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<Uuid, AgentInstance>>>;

/// Shared, lock-guarded registry of tasks, keyed by id. Terminal tasks
/// are retained for metrics and audit.
pub type TaskRegistry =
    std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<Uuid, Task>>>;

/// The active binding of a task to an agent. One per task; superseded on
/// reassignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
}
