use crate::message::CoordinationMessage;
use crate::router::MessageRouter;
use crate::types::{
    AgentInstance, AgentRegistry, AgentStatus, Task, TaskAssignment, TaskPriority, TaskRegistry,
    TaskStatus,
};
use chrono::{Duration as ChronoDuration, Utc};
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender id the coordination core uses for its own traffic (task
/// requests, shutdown signals). The nil UUID never collides with an
/// agent id.
pub const SYSTEM_SENDER: Uuid = Uuid::nil();

/// Load above which an agent is considered overloaded by `balance_load`.
const OVERLOAD_THRESHOLD: f64 = 0.8;
/// Load below which an agent may receive rebalanced tasks.
const UNDERLOAD_THRESHOLD: f64 = 0.6;

/// How the distributor picks among eligible candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionStrategy {
    /// Timestamp-modulo index. Only sensible when all candidates are
    /// equally qualified.
    RoundRobin,
    /// Minimum current load.
    LeastLoaded,
    /// Reliability- and load-weighted capability score.
    #[default]
    CapabilityWeighted,
    /// `success_rate × (1 − load)` maximized.
    PerformanceWeighted,
}

/// Point-in-time load summary for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: Uuid,
    /// Task count over max concurrency, 0–1.
    pub current_load: f64,
    pub available_capacity: usize,
    pub active_tasks: usize,
    pub average_task_time_ms: f64,
    pub success_rate: f64,
    pub capabilities: Vec<String>,
}

impl AgentLoad {
    fn from_agent(agent: &AgentInstance) -> Self {
        Self {
            agent_id: agent.id,
            current_load: agent.current_load(),
            available_capacity: agent.available_capacity(),
            active_tasks: agent.current_tasks.len(),
            average_task_time_ms: agent.metrics.average_task_time_ms,
            success_rate: agent.metrics.success_rate,
            capabilities: agent
                .spec
                .capabilities
                .iter()
                .map(|cap| cap.name.clone())
                .collect(),
        }
    }

    fn can_take(&self, task: &Task) -> bool {
        self.available_capacity > 0
            && task
                .required_capabilities
                .iter()
                .all(|req| self.capabilities.contains(req))
    }
}

/// System-wide load distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLoad {
    pub total_tasks: usize,
    pub assigned_tasks: usize,
    pub average_load: f64,
    pub agent_loads: Vec<AgentLoad>,
    /// Agents above the overload threshold.
    pub bottlenecks: Vec<Uuid>,
}

/// Matches tasks to capable agents and keeps assignment bookkeeping.
pub struct TaskDistributor {
    agents: AgentRegistry,
    tasks: TaskRegistry,
    assignments: RwLock<HashMap<Uuid, TaskAssignment>>,
    router: Arc<MessageRouter>,
    strategy: DistributionStrategy,
}

impl TaskDistributor {
    pub fn new(
        agents: AgentRegistry,
        tasks: TaskRegistry,
        router: Arc<MessageRouter>,
        strategy: DistributionStrategy,
    ) -> Self {
        Self {
            agents,
            tasks,
            assignments: RwLock::new(HashMap::new()),
            router,
            strategy,
        }
    }

    /// Assigns a pending task to the best eligible agent and delivers a
    /// task-request message to that agent's mailbox.
    ///
    /// Fails with [`MaestroError::NoEligibleAgent`] when no active or
    /// idle agent has every required capability and spare capacity; the
    /// task is left `Pending` and can be retried later.
    pub async fn distribute_task(&self, task_id: Uuid) -> MaestroResult<Uuid> {
        let task = {
            let tasks = self.tasks.read().await;
            tasks
                .get(&task_id)
                .cloned()
                .ok_or(MaestroError::TaskNotFound(task_id))?
        };

        let mut candidates: Vec<AgentInstance> = {
            let agents = self.agents.read().await;
            agents
                .values()
                .filter(|agent| agent.can_accept(&task))
                .cloned()
                .collect()
        };

        if candidates.is_empty() {
            return Err(MaestroError::NoEligibleAgent(task_id));
        }
        candidates.sort_by_key(|agent| agent.id);

        let selected = self.select_agent(&task, &candidates);
        debug!(
            task = %task_id,
            agent = %selected,
            candidates = candidates.len(),
            strategy = ?self.strategy,
            "Selected agent for task"
        );

        self.assign(task_id, selected).await
    }

    /// Clears the current assignment, resets the task to `Pending`, and
    /// re-enters distribution. Used for failure recovery and rebalancing.
    pub async fn reassign_task(&self, task_id: Uuid, reason: &str) -> MaestroResult<Uuid> {
        info!(task = %task_id, reason, "Reassigning task");
        self.release_assignment(task_id).await?;
        self.distribute_task(task_id).await
    }

    /// One load-balancing pass. Moves at most one queued, non-critical
    /// task per overloaded agent (load > 0.8) to a capable underloaded
    /// agent (load < 0.6 with spare capacity), then retries distribution
    /// of any still-pending tasks. Returns the number of tasks moved.
    pub async fn balance_load(&self) -> MaestroResult<usize> {
        let load = self.system_load().await;

        let mut moved = 0;
        if load.bottlenecks.is_empty() {
            debug!("No bottlenecks detected, skipping rebalance");
        } else {
            let mut overloaded: Vec<AgentLoad> = load
                .agent_loads
                .iter()
                .filter(|l| l.current_load > OVERLOAD_THRESHOLD)
                .cloned()
                .collect();
            overloaded.sort_by(|a, b| {
                b.current_load
                    .partial_cmp(&a.current_load)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut underloaded: Vec<AgentLoad> = load
                .agent_loads
                .iter()
                .filter(|l| l.current_load < UNDERLOAD_THRESHOLD && l.available_capacity > 0)
                .cloned()
                .collect();
            underloaded.sort_by(|a, b| {
                a.current_load
                    .partial_cmp(&b.current_load)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            if underloaded.is_empty() {
                warn!("No underloaded agents available for rebalancing");
            } else {
                for over in &overloaded {
                    if let Some(task_moved) = self
                        .move_one_task(over, &mut underloaded)
                        .await?
                    {
                        info!(task = %task_moved, from = %over.agent_id, "Rebalanced task");
                        moved += 1;
                    }
                }
            }
        }

        let retried = self.retry_pending().await;
        if retried > 0 {
            info!(retried, "Redistributed pending tasks during rebalance");
        }
        Ok(moved)
    }

    /// Attempts distribution of every unassigned `Pending` task. Returns
    /// how many found an agent. `NoEligibleAgent` is not an error here;
    /// such tasks simply stay pending.
    pub async fn retry_pending(&self) -> usize {
        let pending: Vec<Uuid> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending && t.assigned_agent_id.is_none())
                .map(|t| t.id)
                .collect()
        };

        let mut distributed = 0;
        for task_id in pending {
            match self.distribute_task(task_id).await {
                Ok(_) => distributed += 1,
                Err(MaestroError::NoEligibleAgent(_)) => {}
                Err(e) => warn!(task = %task_id, error = %e, "Pending redistribution failed"),
            }
        }
        distributed
    }

    /// Load summary for one agent.
    pub async fn agent_load(&self, agent_id: Uuid) -> Option<AgentLoad> {
        let agents = self.agents.read().await;
        agents.get(&agent_id).map(AgentLoad::from_agent)
    }

    /// System-wide load distribution and bottleneck list.
    pub async fn system_load(&self) -> SystemLoad {
        let agent_loads: Vec<AgentLoad> = {
            let agents = self.agents.read().await;
            agents.values().map(AgentLoad::from_agent).collect()
        };
        let total_tasks = self.tasks.read().await.len();
        let assigned_tasks = self.assignments.read().await.len();

        let average_load = if agent_loads.is_empty() {
            0.0
        } else {
            agent_loads.iter().map(|l| l.current_load).sum::<f64>() / agent_loads.len() as f64
        };
        let bottlenecks = agent_loads
            .iter()
            .filter(|l| l.current_load > OVERLOAD_THRESHOLD)
            .map(|l| l.agent_id)
            .collect();

        SystemLoad {
            total_tasks,
            assigned_tasks,
            average_load,
            agent_loads,
            bottlenecks,
        }
    }

    /// Current assignment records.
    pub async fn assignments(&self) -> Vec<TaskAssignment> {
        self.assignments.read().await.values().cloned().collect()
    }

    /// Drops the assignment record for a task that reached a terminal
    /// state. Called by the orchestrator's bookkeeping.
    pub(crate) async fn clear_assignment(&self, task_id: Uuid) {
        self.assignments.write().await.remove(&task_id);
    }

    // --- selection strategies ---

    /// Picks one agent from a non-empty, id-sorted candidate list.
    fn select_agent(&self, task: &Task, candidates: &[AgentInstance]) -> Uuid {
        match self.strategy {
            DistributionStrategy::RoundRobin => {
                let index = Utc::now().timestamp_millis() as usize % candidates.len();
                candidates[index].id
            }
            DistributionStrategy::LeastLoaded => {
                let mut best = &candidates[0];
                for candidate in &candidates[1..] {
                    if candidate.current_load() < best.current_load() {
                        best = candidate;
                    }
                }
                best.id
            }
            DistributionStrategy::CapabilityWeighted => {
                let mut scored: Vec<(f64, f64, Uuid)> = candidates
                    .iter()
                    .map(|agent| {
                        (
                            Self::capability_score(task, agent),
                            agent.current_load(),
                            agent.id,
                        )
                    })
                    .collect();
                // Max score; ties broken by lowest load, then lowest id.
                scored.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(
                            a.1.partial_cmp(&b.1)
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                        .then(a.2.cmp(&b.2))
                });
                scored[0].2
            }
            DistributionStrategy::PerformanceWeighted => {
                let mut best = &candidates[0];
                let mut best_score =
                    best.metrics.success_rate * (1.0 - best.current_load());
                for candidate in &candidates[1..] {
                    let score =
                        candidate.metrics.success_rate * (1.0 - candidate.current_load());
                    if score > best_score {
                        best = candidate;
                        best_score = score;
                    }
                }
                best.id
            }
        }
    }

    fn capability_score(task: &Task, agent: &AgentInstance) -> f64 {
        let mut score = 0.0;
        for required in &task.required_capabilities {
            if let Some(capability) = agent.capability(required) {
                score += capability.reliability * 100.0;
                if capability.execution_time_ms < task.estimated_duration_ms {
                    score += 20.0;
                }
            }
        }
        score += (1.0 - agent.current_load()) * 50.0;
        score += agent.metrics.success_rate;
        score
    }

    // --- assignment bookkeeping ---

    /// Binds a task to an agent: task → `Queued`, agent bookkeeping
    /// updated, assignment recorded, task-request delivered.
    async fn assign(&self, task_id: Uuid, agent_id: Uuid) -> MaestroResult<Uuid> {
        let (request, assignment) = {
            // Lock order everywhere: tasks before agents.
            let mut tasks = self.tasks.write().await;
            let mut agents = self.agents.write().await;

            let task = tasks
                .get_mut(&task_id)
                .ok_or(MaestroError::TaskNotFound(task_id))?;
            let agent = agents
                .get_mut(&agent_id)
                .ok_or(MaestroError::AgentNotFound(agent_id))?;

            // The candidate snapshot may be stale; re-check under the lock
            // so `current_tasks` can never exceed the concurrency limit.
            if agent.available_capacity() == 0 {
                return Err(MaestroError::CapacityExceeded {
                    agent_id,
                    limit: agent.spec.max_concurrent_tasks,
                });
            }
            if task.status != TaskStatus::Pending {
                return Err(MaestroError::InvalidTransition {
                    id: task_id,
                    from: task.status.to_string(),
                    to: TaskStatus::Queued.to_string(),
                });
            }

            task.status = TaskStatus::Queued;
            task.assigned_agent_id = Some(agent_id);
            task.updated_at = Utc::now();

            agent.current_tasks.push(task_id);
            agent.metrics.tasks_in_progress += 1;
            if matches!(agent.status, AgentStatus::Active | AgentStatus::Idle) {
                agent.status = AgentStatus::Busy;
            }

            let assignment = TaskAssignment {
                task_id,
                agent_id,
                assigned_at: Utc::now(),
                estimated_completion: Utc::now()
                    + ChronoDuration::milliseconds(task.estimated_duration_ms as i64),
            };
            (
                CoordinationMessage::task_request(SYSTEM_SENDER, task.clone()),
                assignment,
            )
        };

        self.assignments.write().await.insert(task_id, assignment);
        self.router
            .send_message(SYSTEM_SENDER, agent_id, request)
            .await?;

        info!(task = %task_id, agent = %agent_id, "Assigned task");
        Ok(agent_id)
    }

    /// Detaches a task from its current agent and resets it to `Pending`.
    async fn release_assignment(&self, task_id: Uuid) -> MaestroResult<()> {
        {
            let mut tasks = self.tasks.write().await;
            let mut agents = self.agents.write().await;

            let task = tasks
                .get_mut(&task_id)
                .ok_or(MaestroError::TaskNotFound(task_id))?;
            if let Some(agent_id) = task.assigned_agent_id {
                if let Some(agent) = agents.get_mut(&agent_id) {
                    agent.current_tasks.retain(|id| *id != task_id);
                    agent.metrics.tasks_in_progress =
                        agent.metrics.tasks_in_progress.saturating_sub(1);
                    if agent.current_tasks.is_empty() && agent.status == AgentStatus::Busy {
                        agent.status = AgentStatus::Active;
                    }
                }
            }
            task.reset_for_redistribution();
        }
        self.assignments.write().await.remove(&task_id);
        Ok(())
    }

    /// Moves at most one queued, non-critical task away from an
    /// overloaded agent. Returns the moved task id, if any.
    async fn move_one_task(
        &self,
        over: &AgentLoad,
        underloaded: &mut Vec<AgentLoad>,
    ) -> MaestroResult<Option<Uuid>> {
        let movable: Vec<Task> = {
            let agents = self.agents.read().await;
            let Some(agent) = agents.get(&over.agent_id) else {
                return Ok(None);
            };
            let current = agent.current_tasks.clone();
            drop(agents);

            let tasks = self.tasks.read().await;
            current
                .iter()
                .filter_map(|id| tasks.get(id))
                .filter(|t| {
                    t.status == TaskStatus::Queued && t.priority != TaskPriority::Critical
                })
                .cloned()
                .collect()
        };

        for task in movable {
            let target = underloaded
                .iter()
                .position(|u| u.agent_id != over.agent_id && u.can_take(&task));
            let Some(index) = target else { continue };
            let target_id = underloaded[index].agent_id;

            self.release_assignment(task.id).await?;
            match self.assign(task.id, target_id).await {
                Ok(_) => {
                    let entry = &mut underloaded[index];
                    entry.available_capacity -= 1;
                    entry.active_tasks += 1;
                    if entry.available_capacity == 0 {
                        underloaded.remove(index);
                    }
                    return Ok(Some(task.id));
                }
                Err(e) => {
                    warn!(task = %task.id, target = %target_id, error = %e, "Rebalance move failed");
                    // The task was reset to Pending; normal retry paths
                    // will pick it up.
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::router::RouterConfig;
    use crate::types::{AgentCapability, AgentSpecification};
    use maestro_core::EventBus;
    use std::collections::HashMap;

    async fn setup(
        strategy: DistributionStrategy,
    ) -> (AgentRegistry, TaskRegistry, Arc<MessageRouter>, TaskDistributor) {
        let agents: AgentRegistry = Arc::new(RwLock::new(HashMap::new()));
        let tasks: TaskRegistry = Arc::new(RwLock::new(HashMap::new()));
        let router = Arc::new(MessageRouter::new(
            RouterConfig::default(),
            Arc::new(EventBus::new()),
        ));
        let distributor = TaskDistributor::new(
            agents.clone(),
            tasks.clone(),
            router.clone(),
            strategy,
        );
        (agents, tasks, router, distributor)
    }

    async fn add_agent(
        agents: &AgentRegistry,
        router: &Arc<MessageRouter>,
        capability: &str,
        reliability: f64,
        max_tasks: usize,
    ) -> Uuid {
        let mut agent = AgentInstance::new(
            AgentSpecification::new("worker", max_tasks)
                .with_capability(AgentCapability::new(capability, 5_000, reliability)),
        );
        agent.status = AgentStatus::Active;
        let id = agent.id;
        router.register_agent(id).await;
        agents.write().await.insert(id, agent);
        id
    }

    async fn add_task(tasks: &TaskRegistry, capability: &str, priority: TaskPriority) -> Uuid {
        let task = Task::new("BUILD", "job")
            .with_priority(priority)
            .with_required_capabilities(vec![capability.to_string()])
            .with_estimated_duration(10_000);
        let id = task.id;
        tasks.write().await.insert(id, task);
        id
    }

    #[tokio::test]
    async fn test_distribute_assigns_capable_agent() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        let agent_id = add_agent(&agents, &router, "build", 0.9, 2).await;
        let task_id = add_task(&tasks, "build", TaskPriority::Medium).await;

        let selected = distributor.distribute_task(task_id).await.unwrap();
        assert_eq!(selected, agent_id);

        let task = tasks.read().await[&task_id].clone();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.assigned_agent_id, Some(agent_id));

        let agent = agents.read().await[&agent_id].clone();
        assert_eq!(agent.current_tasks, vec![task_id]);
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.metrics.tasks_in_progress, 1);

        assert_eq!(distributor.assignments().await.len(), 1);
        // Task-request message landed in the agent's mailbox.
        assert_eq!(router.pending_messages(agent_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_eligible_agent_leaves_task_pending() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        add_agent(&agents, &router, "build", 0.9, 2).await;
        let task_id = add_task(&tasks, "deploy", TaskPriority::Medium).await;

        let result = distributor.distribute_task(task_id).await;
        assert!(matches!(result, Err(MaestroError::NoEligibleAgent(id)) if id == task_id));
        assert_eq!(tasks.read().await[&task_id].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_capacity_is_never_exceeded() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        let agent_id = add_agent(&agents, &router, "build", 0.9, 1).await;

        let first = add_task(&tasks, "build", TaskPriority::Medium).await;
        let second = add_task(&tasks, "build", TaskPriority::Medium).await;

        distributor.distribute_task(first).await.unwrap();
        let result = distributor.distribute_task(second).await;

        assert!(matches!(result, Err(MaestroError::NoEligibleAgent(_))));
        let agent = agents.read().await[&agent_id].clone();
        assert_eq!(agent.current_tasks.len(), 1);
        assert!(agent.current_tasks.len() <= agent.spec.max_concurrent_tasks);
    }

    #[tokio::test]
    async fn test_capability_weighted_prefers_reliable_agent() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        add_agent(&agents, &router, "build", 0.5, 2).await;
        let reliable = add_agent(&agents, &router, "build", 0.99, 2).await;
        let task_id = add_task(&tasks, "build", TaskPriority::Medium).await;

        let selected = distributor.distribute_task(task_id).await.unwrap();
        assert_eq!(selected, reliable);
    }

    #[tokio::test]
    async fn test_least_loaded_strategy() {
        let (agents, tasks, router, distributor) = setup(DistributionStrategy::LeastLoaded).await;
        let busy = add_agent(&agents, &router, "build", 0.9, 4).await;
        let idle = add_agent(&agents, &router, "build", 0.9, 4).await;

        // Preload the busy agent with synthetic work.
        agents
            .write()
            .await
            .get_mut(&busy)
            .unwrap()
            .current_tasks
            .push(Uuid::new_v4());

        let task_id = add_task(&tasks, "build", TaskPriority::Medium).await;
        let selected = distributor.distribute_task(task_id).await.unwrap();
        assert_eq!(selected, idle);
    }

    #[tokio::test]
    async fn test_reassign_returns_task_to_queue() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        let agent_id = add_agent(&agents, &router, "build", 0.9, 2).await;
        let task_id = add_task(&tasks, "build", TaskPriority::Medium).await;

        distributor.distribute_task(task_id).await.unwrap();
        let reassigned_to = distributor
            .reassign_task(task_id, "handler failure")
            .await
            .unwrap();

        // Only one capable agent exists, so it lands there again, through
        // a fresh assignment.
        assert_eq!(reassigned_to, agent_id);
        let task = tasks.read().await[&task_id].clone();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(agents.read().await[&agent_id].current_tasks.len(), 1);
        assert_eq!(distributor.assignments().await.len(), 1);
    }

    #[tokio::test]
    async fn test_balance_load_moves_at_most_one_task() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        let loaded = add_agent(&agents, &router, "build", 0.9, 10).await;
        let spare = add_agent(&agents, &router, "build", 0.9, 10).await;

        // Park the spare agent so all nine tasks land on the first one.
        agents.write().await.get_mut(&spare).unwrap().status = AgentStatus::Inactive;
        for _ in 0..9 {
            let task_id = add_task(&tasks, "build", TaskPriority::Medium).await;
            distributor.distribute_task(task_id).await.unwrap();
        }
        assert_eq!(agents.read().await[&loaded].current_tasks.len(), 9);

        agents.write().await.get_mut(&spare).unwrap().status = AgentStatus::Active;
        let moved = distributor.balance_load().await.unwrap();

        assert_eq!(moved, 1);
        assert_eq!(agents.read().await[&loaded].current_tasks.len(), 8);
        assert_eq!(agents.read().await[&spare].current_tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_balance_load_never_moves_critical_tasks() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        let loaded = add_agent(&agents, &router, "build", 0.9, 10).await;
        let spare = add_agent(&agents, &router, "build", 0.9, 10).await;

        agents.write().await.get_mut(&spare).unwrap().status = AgentStatus::Inactive;
        for _ in 0..9 {
            let task_id = add_task(&tasks, "build", TaskPriority::Critical).await;
            distributor.distribute_task(task_id).await.unwrap();
        }
        agents.write().await.get_mut(&spare).unwrap().status = AgentStatus::Active;

        let moved = distributor.balance_load().await.unwrap();
        assert_eq!(moved, 0);
        assert_eq!(agents.read().await[&loaded].current_tasks.len(), 9);
    }

    #[tokio::test]
    async fn test_retry_pending_picks_up_after_registration() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        let task_id = add_task(&tasks, "build", TaskPriority::Medium).await;

        assert!(matches!(
            distributor.distribute_task(task_id).await,
            Err(MaestroError::NoEligibleAgent(_))
        ));

        add_agent(&agents, &router, "build", 0.9, 2).await;
        let distributed = distributor.retry_pending().await;

        assert_eq!(distributed, 1);
        assert_eq!(tasks.read().await[&task_id].status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_system_load_reports_bottlenecks() {
        let (agents, tasks, router, distributor) =
            setup(DistributionStrategy::CapabilityWeighted).await;
        let agent_id = add_agent(&agents, &router, "build", 0.9, 1).await;
        let task_id = add_task(&tasks, "build", TaskPriority::Medium).await;
        distributor.distribute_task(task_id).await.unwrap();

        let load = distributor.system_load().await;
        assert_eq!(load.total_tasks, 1);
        assert_eq!(load.assigned_tasks, 1);
        assert_eq!(load.bottlenecks, vec![agent_id]);
        assert_eq!(load.average_load, 1.0);
    }
}
