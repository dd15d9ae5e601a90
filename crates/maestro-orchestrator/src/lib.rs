//! Multi-agent task-orchestration core.
//!
//! A single-process, in-memory coordinator: workers ("agents") register
//! with declared capabilities, tasks are matched to capable agents,
//! inter-agent messages flow through per-agent priority mailboxes, and
//! background loops keep health and performance metrics current. It is
//! designed to be embedded inside a larger service; durability,
//! cross-process delivery, and distributed consensus are out of scope.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Composition root: registries, lifecycle, events.
//! - [`TaskDistributor`] — Capability-matched task assignment and load balancing.
//! - [`MessageRouter`] — Per-agent priority mailboxes with retry/backoff.
//! - [`HealthMonitor`] — Periodic health classification per agent.
//! - [`PerformanceTracker`] — Snapshot history, trends, and alerts.
//! - [`OrchestratorConfig`] — Tuning for all of the above, TOML-loadable.

/// Configuration structs and TOML loading.
pub mod config;
/// Candidate filtering, selection strategies, and load balancing.
pub mod distributor;
/// Composition root and system lifecycle.
pub mod engine;
/// Agent health metrics, classification, and the probe seam.
pub mod health;
/// Coordination message envelope and typed payloads.
pub mod message;
/// Periodic performance snapshots, trends, and alerting.
pub mod perf;
/// Per-agent mailboxes and the delivery loop.
pub mod router;
/// Shared data model: agents, tasks, assignments, registries.
pub mod types;

pub use config::OrchestratorConfig;
pub use distributor::{
    AgentLoad, DistributionStrategy, SystemLoad, TaskDistributor, SYSTEM_SENDER,
};
pub use engine::{Orchestrator, SystemStatus};
pub use health::{
    HealthCheckConfig, HealthIssue, HealthIssueKind, HealthMetrics, HealthMonitor, HealthProbe,
    HealthState, HealthStatus, HealthThresholds, IssueSeverity, MetricsProbe, SystemHealth,
};
pub use message::{CoordinationMessage, MessagePayload, MessagePriority, TaskOutcome};
pub use perf::{
    AgentRanking, PerformanceAlert, PerformanceConfig, PerformanceSnapshot, PerformanceTracker,
    PerformanceTrend, Recommendation, SystemMetrics, TrendDirection,
};
pub use router::{MessageHandler, MessageRouter, RouterConfig, RouterStatistics};
pub use types::{
    AgentCapability, AgentInstance, AgentMetrics, AgentRegistry, AgentSpecification, AgentStatus,
    CapabilityParameter, ResourceLimits, Task, TaskAssignment, TaskPriority, TaskRegistry,
    TaskStatus,
};
