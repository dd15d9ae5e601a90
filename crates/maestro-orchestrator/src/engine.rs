use crate::config::OrchestratorConfig;
use crate::distributor::TaskDistributor;
use crate::health::HealthMonitor;
use crate::message::{CoordinationMessage, TaskOutcome};
use crate::perf::PerformanceTracker;
use crate::router::MessageRouter;
use crate::types::{
    AgentInstance, AgentRegistry, AgentSpecification, AgentStatus, Task, TaskRegistry, TaskStatus,
};
use chrono::Utc;
use maestro_core::event::topic;
use maestro_core::{EventBus, MaestroError, MaestroResult, SystemEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Aggregate agent and task counts. Read-only, no side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub is_running: bool,
    pub total_agents: usize,
    /// Agents in `Active` or `Busy` state.
    pub active_agents: usize,
    pub busy_agents: usize,
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

/// Composition root of the coordination core.
///
/// Owns the agent and task registries, wires the message router, task
/// distributor, health monitor, and performance tracker around them, and
/// owns the lifecycle of every background loop.
pub struct Orchestrator {
    config: OrchestratorConfig,
    agents: AgentRegistry,
    tasks: TaskRegistry,
    events: Arc<EventBus>,
    router: Arc<MessageRouter>,
    distributor: Arc<TaskDistributor>,
    health: Arc<HealthMonitor>,
    tracker: Arc<PerformanceTracker>,
    running: AtomicBool,
}

impl Orchestrator {
    /// Wires all components around shared registries. Call
    /// [`initialize`](Self::initialize) to start the background loops.
    pub fn new(config: OrchestratorConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let agents: AgentRegistry = Arc::new(RwLock::new(HashMap::new()));
        let tasks: TaskRegistry = Arc::new(RwLock::new(HashMap::new()));

        let router = Arc::new(MessageRouter::new(config.router.clone(), events.clone()));
        let distributor = Arc::new(TaskDistributor::new(
            agents.clone(),
            tasks.clone(),
            router.clone(),
            config.strategy,
        ));
        let health = Arc::new(HealthMonitor::new(config.health.clone(), events.clone()));
        let tracker = Arc::new(PerformanceTracker::new(
            config.performance.clone(),
            events.clone(),
        ));

        Self {
            config,
            agents,
            tasks,
            events,
            router,
            distributor,
            health,
            tracker,
            running: AtomicBool::new(false),
        }
    }

    /// Validates configuration and starts the message delivery, health
    /// check, and performance snapshot loops.
    ///
    /// A configuration failure here is fatal and propagated: no subsystem
    /// is safe to run partially initialized.
    pub async fn initialize(&self) -> MaestroResult<()> {
        self.config.validate()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Initializing orchestrator");
        self.router.clone().start().await;
        self.health.clone().start(self.agents.clone()).await;
        self.tracker
            .clone()
            .start(self.agents.clone(), self.tasks.clone())
            .await;

        self.events
            .publish(SystemEvent::new(topic::SYSTEM_INITIALIZED));
        info!("Orchestrator initialized");
        Ok(())
    }

    /// The event bus all components publish to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The task distributor.
    pub fn distributor(&self) -> &Arc<TaskDistributor> {
        &self.distributor
    }

    /// The health monitor.
    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The performance tracker.
    pub fn performance_tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    // --- agent lifecycle ---

    /// Registers a worker from its specification.
    ///
    /// The instance is stored in `Initializing` state and transitions to
    /// `Active` once validation succeeds; on failure it is left in
    /// `Error` state, `agent:error` fires, and the error is returned.
    /// Registration of a capable agent also re-enters distribution for
    /// any tasks still pending.
    pub async fn register_agent(&self, spec: AgentSpecification) -> MaestroResult<Uuid> {
        let agent = AgentInstance::new(spec);
        let agent_id = agent.id;
        let agent_type = agent.spec.agent_type.clone();

        self.agents.write().await.insert(agent_id, agent);
        self.router.register_agent(agent_id).await;
        info!(agent = %agent_id, agent_type = %agent_type, "Registered agent");
        self.events
            .publish(SystemEvent::new(topic::AGENT_REGISTERED).with_agent(agent_id));

        if let Err(e) = self.validate_registration(agent_id).await {
            if let Some(agent) = self.agents.write().await.get_mut(&agent_id) {
                agent.status = AgentStatus::Error;
            }
            error!(agent = %agent_id, error = %e, "Agent initialization failed");
            self.events.publish(
                SystemEvent::new(topic::AGENT_ERROR)
                    .with_agent(agent_id)
                    .with_detail(serde_json::json!({ "error": e.to_string() })),
            );
            return Err(e);
        }

        {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(&agent_id) {
                agent.status = AgentStatus::Active;
                agent.last_heartbeat = Utc::now();
            }
        }
        self.events
            .publish(SystemEvent::new(topic::AGENT_INITIALIZED).with_agent(agent_id));

        let redistributed = self.distributor.retry_pending().await;
        if redistributed > 0 {
            info!(
                agent = %agent_id,
                redistributed,
                "Pending tasks distributed after registration"
            );
        }

        Ok(agent_id)
    }

    async fn validate_registration(&self, agent_id: Uuid) -> MaestroResult<()> {
        let agents = self.agents.read().await;
        let agent = agents
            .get(&agent_id)
            .ok_or(MaestroError::AgentNotFound(agent_id))?;
        let spec = &agent.spec;

        if spec.max_concurrent_tasks == 0 {
            return Err(MaestroError::InvalidSpecification(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if spec.capabilities.is_empty() {
            return Err(MaestroError::InvalidSpecification(
                "at least one capability is required".to_string(),
            ));
        }
        for capability in &spec.capabilities {
            if !(0.0..=1.0).contains(&capability.reliability) {
                return Err(MaestroError::InvalidSpecification(format!(
                    "capability '{}' reliability {} outside 0..=1",
                    capability.name, capability.reliability
                )));
            }
        }
        Ok(())
    }

    /// Stops one agent: cancels its assigned tasks, removes its mailbox,
    /// and leaves the instance in `Inactive` state for status queries.
    pub async fn stop_agent(&self, agent_id: Uuid) -> MaestroResult<()> {
        let assigned: Vec<Uuid> = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&agent_id)
                .ok_or(MaestroError::AgentNotFound(agent_id))?;
            if agent.status == AgentStatus::Inactive {
                return Ok(());
            }
            agent.status = AgentStatus::Stopping;
            agent.current_tasks.clone()
        };

        for task_id in assigned {
            if let Err(e) = self
                .update_task_status(task_id, TaskStatus::Cancelled, None)
                .await
            {
                warn!(task = %task_id, error = %e, "Failed to cancel task during agent stop");
            }
        }

        {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(&agent_id) {
                agent.status = AgentStatus::Inactive;
                agent.current_tasks.clear();
            }
        }
        self.router.unregister_agent(agent_id).await;

        info!(agent = %agent_id, "Stopped agent");
        self.events
            .publish(SystemEvent::new(topic::AGENT_STOPPED).with_agent(agent_id));
        Ok(())
    }

    /// Moves an errored agent into `Maintenance` (manual intervention).
    pub async fn set_maintenance(&self, agent_id: Uuid) -> MaestroResult<()> {
        self.transition_agent(agent_id, AgentStatus::Maintenance)
            .await
    }

    /// Returns a maintained agent to `Active` and re-enters distribution
    /// for pending tasks.
    pub async fn reactivate_agent(&self, agent_id: Uuid) -> MaestroResult<()> {
        self.transition_agent(agent_id, AgentStatus::Active).await?;
        self.distributor.retry_pending().await;
        Ok(())
    }

    async fn transition_agent(&self, agent_id: Uuid, next: AgentStatus) -> MaestroResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(MaestroError::AgentNotFound(agent_id))?;
        if !agent.status.can_transition_to(next) {
            return Err(MaestroError::InvalidTransition {
                id: agent_id,
                from: agent.status.to_string(),
                to: next.to_string(),
            });
        }
        agent.status = next;
        Ok(())
    }

    /// Records an agent's sampled resource usage, typically reported by
    /// the worker host alongside heartbeats. The health monitor grades
    /// these against its CPU and memory thresholds.
    pub async fn record_resource_usage(
        &self,
        agent_id: Uuid,
        cpu_pct: f64,
        memory_mb: f64,
    ) -> MaestroResult<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(&agent_id)
            .ok_or(MaestroError::AgentNotFound(agent_id))?;
        agent.metrics.cpu_usage_pct = cpu_pct;
        agent.metrics.memory_usage_mb = memory_mb;
        Ok(())
    }

    /// Refreshes an agent's liveness timestamp.
    pub async fn record_heartbeat(&self, agent_id: Uuid) -> MaestroResult<()> {
        {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&agent_id)
                .ok_or(MaestroError::AgentNotFound(agent_id))?;
            agent.last_heartbeat = Utc::now();
        }
        self.events
            .publish(SystemEvent::new(topic::AGENT_HEARTBEAT).with_agent(agent_id));
        Ok(())
    }

    // --- task lifecycle ---

    /// Stores a new task and immediately attempts distribution.
    ///
    /// Finding no eligible agent is not an error: the task stays
    /// `Pending` and is retried when an agent registers or on the next
    /// load-balancing pass.
    pub async fn create_task(&self, mut task: Task) -> MaestroResult<Uuid> {
        task.status = TaskStatus::Pending;
        task.assigned_agent_id = None;
        let task_id = task.id;
        let task_type = task.task_type.clone();

        self.tasks.write().await.insert(task_id, task);
        info!(task = %task_id, task_type = %task_type, "Created task");
        self.events
            .publish(SystemEvent::new(topic::TASK_CREATED).with_task(task_id));

        match self.distributor.distribute_task(task_id).await {
            Ok(agent_id) => debug!(task = %task_id, agent = %agent_id, "Task distributed"),
            Err(MaestroError::NoEligibleAgent(_)) => {
                warn!(task = %task_id, "No eligible agent; task remains pending");
            }
            Err(e) => warn!(task = %task_id, error = %e, "Task distribution failed"),
        }

        Ok(task_id)
    }

    /// Records a status transition for a task.
    ///
    /// Fails with [`MaestroError::TaskNotFound`] for unknown ids and
    /// [`MaestroError::InvalidTransition`] for moves the state machine
    /// forbids. Terminal transitions run agent bookkeeping; `Completed`
    /// feeds the performance tracker; `Failed` re-enters distribution
    /// while retries remain.
    pub async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
    ) -> MaestroResult<()> {
        let now = Utc::now();
        let (previous, snapshot) = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .ok_or(MaestroError::TaskNotFound(task_id))?;
            let previous = task.status;
            if previous == status {
                return Ok(());
            }
            if !previous.can_transition_to(status) {
                return Err(MaestroError::InvalidTransition {
                    id: task_id,
                    from: previous.to_string(),
                    to: status.to_string(),
                });
            }

            task.status = status;
            task.updated_at = now;
            match status {
                TaskStatus::InProgress => task.started_at = Some(now),
                TaskStatus::Completed => {
                    task.completed_at = Some(now);
                    task.actual_duration_ms = task
                        .started_at
                        .map(|started| (now - started).num_milliseconds().max(0) as u64);
                    if let Some(value) = result.clone() {
                        task.result = Some(value);
                    }
                }
                TaskStatus::Failed => {
                    task.completed_at = Some(now);
                    if let Some(value) = &result {
                        task.error = Some(
                            value
                                .as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| value.to_string()),
                        );
                    }
                }
                TaskStatus::Cancelled => task.completed_at = Some(now),
                _ => {
                    if let Some(value) = result.clone() {
                        task.result = Some(value);
                    }
                }
            }
            (previous, task.clone())
        };

        info!(task = %task_id, from = %previous, to = %status, "Task status updated");

        if status.is_terminal() {
            self.finish_task(&snapshot, status).await;
        }

        match status {
            TaskStatus::Completed => {
                self.tracker.record_task_completion(&snapshot);
                self.events.publish(
                    SystemEvent::new(topic::TASK_COMPLETED)
                        .with_task(task_id)
                        .with_detail(serde_json::json!({
                            "duration_ms": snapshot.actual_duration_ms,
                        })),
                );
            }
            TaskStatus::Failed => {
                if snapshot.retry_count < snapshot.max_retries {
                    self.retry_task(task_id, snapshot.retry_count + 1).await;
                } else {
                    self.tracker.record_task_completion(&snapshot);
                    self.events.publish(
                        SystemEvent::new(topic::TASK_FAILED)
                            .with_task(task_id)
                            .with_detail(serde_json::json!({ "error": snapshot.error })),
                    );
                }
            }
            TaskStatus::Cancelled => self.tracker.record_task_completion(&snapshot),
            _ => {}
        }

        self.events.publish(
            SystemEvent::new(topic::TASK_UPDATED)
                .with_task(task_id)
                .with_detail(serde_json::json!({
                    "previous": previous.to_string(),
                    "status": status.to_string(),
                })),
        );
        Ok(())
    }

    /// Convenience wrapper: worker reports success.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> MaestroResult<()> {
        self.update_task_status(task_id, TaskStatus::Completed, Some(result))
            .await
    }

    /// Convenience wrapper: worker reports failure.
    pub async fn fail_task(&self, task_id: Uuid, error: impl Into<String>) -> MaestroResult<()> {
        self.update_task_status(
            task_id,
            TaskStatus::Failed,
            Some(serde_json::Value::String(error.into())),
        )
        .await
    }

    /// Applies a worker's task-response callback. Rejected tasks are
    /// reassigned to another agent.
    pub async fn apply_task_outcome(
        &self,
        task_id: Uuid,
        outcome: TaskOutcome,
    ) -> MaestroResult<()> {
        match outcome {
            TaskOutcome::Completed { result } => self.complete_task(task_id, result).await,
            TaskOutcome::Failed { error } => self.fail_task(task_id, error).await,
            TaskOutcome::Rejected { reason } => {
                self.distributor
                    .reassign_task(task_id, &reason)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Removes a terminal task from its agent and clears the assignment.
    async fn finish_task(&self, task: &Task, status: TaskStatus) {
        let Some(agent_id) = task.assigned_agent_id else {
            return;
        };
        {
            let mut agents = self.agents.write().await;
            if let Some(agent) = agents.get_mut(&agent_id) {
                agent.current_tasks.retain(|id| *id != task.id);
                agent.metrics.tasks_in_progress =
                    agent.metrics.tasks_in_progress.saturating_sub(1);
                match status {
                    TaskStatus::Completed => {
                        agent.record_completion(task.actual_duration_ms.unwrap_or(0));
                    }
                    TaskStatus::Failed => agent.record_failure(),
                    _ => {}
                }
                if agent.current_tasks.is_empty() && agent.status == AgentStatus::Busy {
                    agent.status = AgentStatus::Active;
                }
            }
        }
        self.distributor.clear_assignment(task.id).await;
    }

    /// Resets a failed task and re-enters distribution for another
    /// attempt, on whichever agent now scores best.
    async fn retry_task(&self, task_id: Uuid, attempt: u32) {
        {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            task.retry_count = attempt;
            task.reset_for_redistribution();
        }
        info!(task = %task_id, attempt, "Retrying failed task");

        match self.distributor.distribute_task(task_id).await {
            Ok(agent_id) => debug!(task = %task_id, agent = %agent_id, "Retry distributed"),
            Err(MaestroError::NoEligibleAgent(_)) => {
                warn!(task = %task_id, "No agent available for retry; task pending");
            }
            Err(e) => warn!(task = %task_id, error = %e, "Retry distribution failed"),
        }
    }

    // --- messaging ---

    /// Sends a message between agents through the router.
    pub async fn send_message(
        &self,
        from: Uuid,
        to: Uuid,
        message: CoordinationMessage,
    ) -> MaestroResult<()> {
        self.router.send_message(from, to, message).await
    }

    /// Broadcasts a message to every registered agent except the sender.
    pub async fn broadcast_message(
        &self,
        from: Uuid,
        message: CoordinationMessage,
    ) -> MaestroResult<usize> {
        self.router.broadcast_message(from, message).await
    }

    // --- introspection ---

    /// Aggregate counts. Read-only.
    pub async fn system_status(&self) -> SystemStatus {
        let (total_agents, active_agents, busy_agents) = {
            let agents = self.agents.read().await;
            let active = agents
                .values()
                .filter(|a| matches!(a.status, AgentStatus::Active | AgentStatus::Busy))
                .count();
            let busy = agents
                .values()
                .filter(|a| a.status == AgentStatus::Busy)
                .count();
            (agents.len(), active, busy)
        };

        let tasks = self.tasks.read().await;
        let count = |status: TaskStatus| tasks.values().filter(|t| t.status == status).count();

        SystemStatus {
            is_running: self.running.load(Ordering::SeqCst),
            total_agents,
            active_agents,
            busy_agents,
            total_tasks: tasks.len(),
            pending_tasks: count(TaskStatus::Pending),
            in_progress_tasks: count(TaskStatus::InProgress),
            completed_tasks: count(TaskStatus::Completed),
            failed_tasks: count(TaskStatus::Failed),
        }
    }

    /// One agent's current state.
    pub async fn agent(&self, agent_id: Uuid) -> Option<AgentInstance> {
        self.agents.read().await.get(&agent_id).cloned()
    }

    /// All registered agents.
    pub async fn agents(&self) -> Vec<AgentInstance> {
        self.agents.read().await.values().cloned().collect()
    }

    /// One task's current state.
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// All tasks, terminal ones included.
    pub async fn tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    // --- shutdown ---

    /// Stops everything: cancels in-flight tasks, stops all agents, then
    /// shuts down the health monitor, performance tracker, and message
    /// router, in that order. Idempotent; a second call is a no-op.
    pub async fn shutdown(&self) -> MaestroResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Orchestrator already shut down");
            return Ok(());
        }
        info!("Shutting down orchestrator");

        let agent_ids: Vec<Uuid> = self.agents.read().await.keys().copied().collect();
        for agent_id in agent_ids {
            if let Err(e) = self.stop_agent(agent_id).await {
                warn!(agent = %agent_id, error = %e, "Failed to stop agent during shutdown");
            }
        }

        self.health.shutdown().await;
        self.tracker.shutdown().await;
        self.router.shutdown().await;
        self.agents.write().await.clear();

        self.events.publish(SystemEvent::new(topic::SYSTEM_SHUTDOWN));
        info!("Orchestrator shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::AgentCapability;
    use std::sync::atomic::AtomicUsize;

    fn build_spec() -> AgentSpecification {
        AgentSpecification::new("builder", 2)
            .with_capability(AgentCapability::new("build", 5_000, 0.95))
    }

    fn build_task() -> Task {
        Task::new("BUILD", "compile")
            .with_required_capabilities(vec!["build".to_string()])
            .with_estimated_duration(10_000)
    }

    #[tokio::test]
    async fn test_register_agent_becomes_active() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();

        let agent = orchestrator.agent(agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_register_invalid_spec_fails_instance_to_error() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        orchestrator.events().subscribe(
            topic::AGENT_ERROR,
            Arc::new(move |_| {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let spec = AgentSpecification::new("broken", 0)
            .with_capability(AgentCapability::new("build", 5_000, 0.9));
        let result = orchestrator.register_agent(spec).await;

        assert!(matches!(result, Err(MaestroError::InvalidSpecification(_))));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        // The instance stays in the registry, in Error state.
        let agents = orchestrator.agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].status, AgentStatus::Error);
    }

    #[tokio::test]
    async fn test_create_task_distributes_immediately() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();
        let task_id = orchestrator.create_task(build_task()).await.unwrap();

        let task = orchestrator.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.assigned_agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn test_create_task_without_agent_stays_pending() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let task_id = orchestrator.create_task(build_task()).await.unwrap();

        let task = orchestrator.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn test_pending_task_distributed_on_registration() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let task_id = orchestrator.create_task(build_task()).await.unwrap();
        assert_eq!(
            orchestrator.task(task_id).await.unwrap().status,
            TaskStatus::Pending
        );

        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();
        let task = orchestrator.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.assigned_agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn test_update_unknown_task_fails() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let missing = Uuid::new_v4();
        let result = orchestrator
            .update_task_status(missing, TaskStatus::Completed, None)
            .await;
        assert!(matches!(result, Err(MaestroError::TaskNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let task_id = orchestrator.create_task(build_task()).await.unwrap();

        // Pending -> Completed skips the whole lifecycle.
        let result = orchestrator
            .update_task_status(task_id, TaskStatus::Completed, None)
            .await;
        assert!(matches!(result, Err(MaestroError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_completion_updates_agent_bookkeeping() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();
        let task_id = orchestrator.create_task(build_task()).await.unwrap();

        orchestrator
            .update_task_status(task_id, TaskStatus::InProgress, None)
            .await
            .unwrap();
        orchestrator
            .complete_task(task_id, serde_json::json!({ "ok": true }))
            .await
            .unwrap();

        let agent = orchestrator.agent(agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert!(agent.current_tasks.is_empty());
        assert_eq!(agent.metrics.tasks_completed, 1);
        assert_eq!(agent.metrics.tasks_in_progress, 0);

        let task = orchestrator.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_task_retries_until_exhausted() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let failed_events = Arc::new(AtomicUsize::new(0));
        let failed_clone = failed_events.clone();
        orchestrator.events().subscribe(
            topic::TASK_FAILED,
            Arc::new(move |_| {
                failed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        orchestrator.register_agent(build_spec()).await.unwrap();
        let task_id = orchestrator
            .create_task(build_task().with_max_retries(1))
            .await
            .unwrap();

        // First failure: retried, back to Queued on the same pool.
        orchestrator
            .update_task_status(task_id, TaskStatus::InProgress, None)
            .await
            .unwrap();
        orchestrator.fail_task(task_id, "boom").await.unwrap();

        let task = orchestrator.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(failed_events.load(Ordering::SeqCst), 0);

        // Second failure: retries exhausted, terminally failed.
        orchestrator
            .update_task_status(task_id, TaskStatus::InProgress, None)
            .await
            .unwrap();
        orchestrator.fail_task(task_id, "boom again").await.unwrap();

        let task = orchestrator.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(failed_events.load(Ordering::SeqCst), 1);
        assert_eq!(task.error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_resource_usage_feeds_health_checks() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();

        orchestrator
            .record_resource_usage(agent_id, 95.0, 128.0)
            .await
            .unwrap();

        let agent = orchestrator.agent(agent_id).await.unwrap();
        let health = orchestrator
            .health_monitor()
            .check_agent_health(&agent)
            .await;
        assert_eq!(health.state, crate::health::HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_timestamp() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();
        let before = orchestrator.agent(agent_id).await.unwrap().last_heartbeat;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        orchestrator.record_heartbeat(agent_id).await.unwrap();

        let after = orchestrator.agent(agent_id).await.unwrap().last_heartbeat;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_stop_agent_cancels_assigned_tasks() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();
        let task_id = orchestrator.create_task(build_task()).await.unwrap();

        orchestrator.stop_agent(agent_id).await.unwrap();

        let agent = orchestrator.agent(agent_id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Inactive);
        assert!(agent.current_tasks.is_empty());
        assert_eq!(
            orchestrator.task(task_id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_maintenance_cycle() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let agent_id = orchestrator.register_agent(build_spec()).await.unwrap();

        // Active -> Maintenance is not allowed directly.
        assert!(matches!(
            orchestrator.set_maintenance(agent_id).await,
            Err(MaestroError::InvalidTransition { .. })
        ));

        // Force an error state, then Maintenance -> Active works.
        orchestrator
            .transition_agent(agent_id, AgentStatus::Error)
            .await
            .unwrap();
        orchestrator.set_maintenance(agent_id).await.unwrap();
        orchestrator.reactivate_agent(agent_id).await.unwrap();
        assert_eq!(
            orchestrator.agent(agent_id).await.unwrap().status,
            AgentStatus::Active
        );
    }

    #[tokio::test]
    async fn test_system_status_counts() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        orchestrator.initialize().await.unwrap();
        orchestrator.register_agent(build_spec()).await.unwrap();
        orchestrator.create_task(build_task()).await.unwrap();

        let status = orchestrator.system_status().await;
        assert!(status.is_running);
        assert_eq!(status.total_agents, 1);
        assert_eq!(status.active_agents, 1);
        assert_eq!(status.busy_agents, 1);
        assert_eq!(status.total_tasks, 1);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_tasks() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        orchestrator.initialize().await.unwrap();
        orchestrator.register_agent(build_spec()).await.unwrap();
        let task_id = orchestrator.create_task(build_task()).await.unwrap();

        orchestrator.shutdown().await.unwrap();

        assert_eq!(
            orchestrator.task(task_id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert!(orchestrator.agents().await.is_empty());
        assert!(!orchestrator.system_status().await.is_running);
    }
}
