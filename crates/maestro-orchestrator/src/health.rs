use crate::types::{AgentInstance, AgentRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::event::topic;
use maestro_core::{EventBus, MaestroError, MaestroResult, SystemEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Overall classification of one agent's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    /// The probe itself failed; nothing is known about the agent.
    Unknown,
}

/// Kind of detected health problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthIssueKind {
    HighCpuUsage,
    HighMemoryUsage,
    HighErrorRate,
    SlowResponse,
    ConnectionFailure,
    Timeout,
    ResourceExhaustion,
}

/// Severity of a health issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueSeverity {
    Warning,
    Critical,
}

/// One classified threshold breach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub kind: HealthIssueKind,
    pub severity: IssueSeverity,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

impl HealthIssue {
    fn new(kind: HealthIssueKind, severity: IssueSeverity, description: String) -> Self {
        Self {
            kind,
            severity,
            description,
            timestamp: Utc::now(),
            resolved: false,
        }
    }
}

/// Resource utilization percentages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub storage_pct: f64,
    pub network_pct: f64,
}

/// Sampled metrics a health classification is computed from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub response_time_ms: f64,
    pub error_rate_pct: f64,
    /// Completed operations per minute, derived from average task time.
    pub throughput_per_min: f64,
    pub availability_pct: f64,
    pub resources: ResourceUtilization,
}

/// Per-agent health snapshot. Recomputed every check; the previous
/// snapshot is replaced, not merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub agent_id: Uuid,
    pub state: HealthState,
    pub last_check: DateTime<Utc>,
    pub metrics: HealthMetrics,
    pub issues: Vec<HealthIssue>,
}

/// Warning/critical breakpoints for issue classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub response_time_warning_ms: f64,
    pub response_time_critical_ms: f64,
    pub error_rate_warning_pct: f64,
    pub error_rate_critical_pct: f64,
    pub cpu_warning_pct: f64,
    pub cpu_critical_pct: f64,
    pub memory_warning_pct: f64,
    pub memory_critical_pct: f64,
    pub availability_warning_pct: f64,
    pub availability_critical_pct: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            response_time_warning_ms: 5_000.0,
            response_time_critical_ms: 10_000.0,
            error_rate_warning_pct: 5.0,
            error_rate_critical_pct: 15.0,
            cpu_warning_pct: 70.0,
            cpu_critical_pct: 90.0,
            memory_warning_pct: 80.0,
            memory_critical_pct: 95.0,
            availability_warning_pct: 95.0,
            availability_critical_pct: 85.0,
        }
    }
}

/// Health monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Check tick, milliseconds.
    pub interval_ms: u64,
    pub thresholds: HealthThresholds,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Samples raw health metrics for one agent.
///
/// The default probe derives everything from the agent's own counters,
/// but a networked deployment can plug in a probe that actually calls
/// the worker.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, agent: &AgentInstance) -> MaestroResult<HealthMetrics>;
}

/// Default probe: derives health metrics from the agent's counters.
pub struct MetricsProbe;

#[async_trait]
impl HealthProbe for MetricsProbe {
    async fn probe(&self, agent: &AgentInstance) -> MaestroResult<HealthMetrics> {
        let metrics = &agent.metrics;

        let error_rate_pct = if metrics.error_count > 0 {
            let total = metrics.tasks_completed + metrics.error_count;
            ((metrics.error_count as f64 / total as f64) * 100.0).min(100.0)
        } else {
            0.0
        };

        let throughput_per_min = if metrics.average_task_time_ms > 0.0 {
            60_000.0 / metrics.average_task_time_ms
        } else {
            0.0
        };

        let availability_pct = if metrics.total_uptime_ms > 0 {
            let elapsed_ms = (Utc::now() - metrics.last_active).num_milliseconds();
            if elapsed_ms > 0 {
                ((metrics.total_uptime_ms as f64 / elapsed_ms as f64) * 100.0).clamp(0.0, 100.0)
            } else {
                100.0
            }
        } else {
            100.0
        };

        let memory_pct = if agent.spec.resources.max_memory_mb > 0.0 {
            (metrics.memory_usage_mb / agent.spec.resources.max_memory_mb) * 100.0
        } else {
            0.0
        };

        Ok(HealthMetrics {
            response_time_ms: 0.0, // stamped by the caller
            error_rate_pct,
            throughput_per_min,
            availability_pct,
            resources: ResourceUtilization {
                cpu_pct: metrics.cpu_usage_pct,
                memory_pct,
                storage_pct: 0.0,
                network_pct: 0.0,
            },
        })
    }
}

/// System-wide health rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthState,
    pub healthy_agents: usize,
    pub unhealthy_agents: usize,
    pub total_agents: usize,
    pub critical_issues: Vec<HealthIssue>,
    pub average_response_time_ms: f64,
    pub average_error_rate_pct: f64,
    pub average_throughput_per_min: f64,
    pub average_availability_pct: f64,
}

/// Periodically classifies every agent's health from its metrics.
///
/// The monitor only observes and recommends; it never stops an agent
/// itself.
pub struct HealthMonitor {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    statuses: Arc<RwLock<HashMap<Uuid, HealthStatus>>>,
    events: Arc<EventBus>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthCheckConfig, events: Arc<EventBus>) -> Self {
        Self::with_probe(config, events, Arc::new(MetricsProbe))
    }

    /// Creates a monitor with a custom probe implementation.
    pub fn with_probe(
        config: HealthCheckConfig,
        events: Arc<EventBus>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config,
            probe,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            events,
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    /// Starts the periodic check loop over the shared agent registry.
    pub async fn start(self: Arc<Self>, agents: AgentRegistry) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(tx);

        let monitor = Arc::clone(&self);
        let tick = Duration::from_millis(self.config.interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        monitor.run_checks(&agents).await;
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!(interval_ms = self.config.interval_ms, "Health monitor started");
    }

    /// One full pass over the registry. A failing probe produces an
    /// `Unknown` status for that agent and never aborts the pass.
    pub async fn run_checks(&self, agents: &AgentRegistry) {
        let snapshot: Vec<AgentInstance> = {
            let agents = agents.read().await;
            agents.values().cloned().collect()
        };
        for agent in &snapshot {
            self.check_agent_health(agent).await;
        }
    }

    /// Computes, stores, and returns a fresh health snapshot for one
    /// agent. Also callable on demand by ops tooling and tests.
    pub async fn check_agent_health(&self, agent: &AgentInstance) -> HealthStatus {
        let started = Instant::now();

        let status = match self.probe.probe(agent).await {
            Ok(mut metrics) => {
                metrics.response_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
                let issues = self.classify(&metrics);
                let state = Self::overall_state(&issues);
                HealthStatus {
                    agent_id: agent.id,
                    state,
                    last_check: Utc::now(),
                    metrics,
                    issues,
                }
            }
            Err(e) => {
                let failure = MaestroError::HealthCheckFailure {
                    agent_id: agent.id,
                    reason: e.to_string(),
                };
                error!(agent = %agent.id, error = %failure, "Health probe failed");
                HealthStatus {
                    agent_id: agent.id,
                    state: HealthState::Unknown,
                    last_check: Utc::now(),
                    metrics: HealthMetrics::default(),
                    issues: vec![HealthIssue::new(
                        HealthIssueKind::ConnectionFailure,
                        IssueSeverity::Critical,
                        format!("Health check failed: {e}"),
                    )],
                }
            }
        };

        self.statuses
            .write()
            .await
            .insert(agent.id, status.clone());

        self.events.publish(
            SystemEvent::new(topic::HEALTH_UPDATED)
                .with_agent(agent.id)
                .with_detail(serde_json::json!({ "state": status.state })),
        );

        if status.state == HealthState::Unhealthy {
            self.handle_unhealthy(&status);
        }

        status
    }

    /// Latest snapshot for one agent, if a check has run.
    pub async fn agent_health(&self, agent_id: Uuid) -> Option<HealthStatus> {
        self.statuses.read().await.get(&agent_id).cloned()
    }

    /// Latest snapshot for every checked agent.
    pub async fn all_health(&self) -> Vec<HealthStatus> {
        self.statuses.read().await.values().cloned().collect()
    }

    /// Rollup across all checked agents: Healthy with zero unhealthy
    /// agents, Degraded while the unhealthy fraction stays under 0.3,
    /// Unhealthy beyond that.
    pub async fn system_health(&self) -> SystemHealth {
        let statuses = self.statuses.read().await;
        let total = statuses.len();
        let healthy = statuses
            .values()
            .filter(|s| s.state == HealthState::Healthy)
            .count();
        let unhealthy = statuses
            .values()
            .filter(|s| s.state == HealthState::Unhealthy)
            .count();

        let overall = if unhealthy == 0 {
            HealthState::Healthy
        } else if (unhealthy as f64) / (total as f64) < 0.3 {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        };

        let critical_issues: Vec<HealthIssue> = statuses
            .values()
            .flat_map(|s| s.issues.iter())
            .filter(|issue| issue.severity == IssueSeverity::Critical && !issue.resolved)
            .cloned()
            .collect();

        let mean = |f: fn(&HealthMetrics) -> f64, default: f64| -> f64 {
            if total == 0 {
                default
            } else {
                statuses.values().map(|s| f(&s.metrics)).sum::<f64>() / total as f64
            }
        };

        SystemHealth {
            overall,
            healthy_agents: healthy,
            unhealthy_agents: unhealthy,
            total_agents: total,
            critical_issues,
            average_response_time_ms: mean(|m| m.response_time_ms, 0.0),
            average_error_rate_pct: mean(|m| m.error_rate_pct, 0.0),
            average_throughput_per_min: mean(|m| m.throughput_per_min, 0.0),
            average_availability_pct: mean(|m| m.availability_pct, 100.0),
        }
    }

    /// Stops the check loop and clears stored statuses. Idempotent.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                warn!("Health check loop did not stop in time");
            }
        }
        self.statuses.write().await.clear();
        info!("Health monitor shut down");
    }

    // --- classification ---

    fn classify(&self, metrics: &HealthMetrics) -> Vec<HealthIssue> {
        let t = &self.config.thresholds;
        let mut issues = Vec::new();

        let graded = |kind: HealthIssueKind,
                          value: f64,
                          warning: f64,
                          critical: f64,
                          issues: &mut Vec<HealthIssue>,
                          unit: &str| {
            if value > critical {
                issues.push(HealthIssue::new(
                    kind,
                    IssueSeverity::Critical,
                    format!("{value:.1}{unit} exceeds critical threshold {critical:.1}{unit}"),
                ));
            } else if value > warning {
                issues.push(HealthIssue::new(
                    kind,
                    IssueSeverity::Warning,
                    format!("{value:.1}{unit} exceeds warning threshold {warning:.1}{unit}"),
                ));
            }
        };

        graded(
            HealthIssueKind::SlowResponse,
            metrics.response_time_ms,
            t.response_time_warning_ms,
            t.response_time_critical_ms,
            &mut issues,
            "ms",
        );
        graded(
            HealthIssueKind::HighErrorRate,
            metrics.error_rate_pct,
            t.error_rate_warning_pct,
            t.error_rate_critical_pct,
            &mut issues,
            "%",
        );
        graded(
            HealthIssueKind::HighCpuUsage,
            metrics.resources.cpu_pct,
            t.cpu_warning_pct,
            t.cpu_critical_pct,
            &mut issues,
            "%",
        );
        graded(
            HealthIssueKind::HighMemoryUsage,
            metrics.resources.memory_pct,
            t.memory_warning_pct,
            t.memory_critical_pct,
            &mut issues,
            "%",
        );

        // Availability breaches downward.
        if metrics.availability_pct < t.availability_critical_pct {
            issues.push(HealthIssue::new(
                HealthIssueKind::ConnectionFailure,
                IssueSeverity::Critical,
                format!(
                    "Availability {:.1}% below critical threshold {:.1}%",
                    metrics.availability_pct, t.availability_critical_pct
                ),
            ));
        } else if metrics.availability_pct < t.availability_warning_pct {
            issues.push(HealthIssue::new(
                HealthIssueKind::ConnectionFailure,
                IssueSeverity::Warning,
                format!(
                    "Availability {:.1}% below warning threshold {:.1}%",
                    metrics.availability_pct, t.availability_warning_pct
                ),
            ));
        }

        issues
    }

    fn overall_state(issues: &[HealthIssue]) -> HealthState {
        if issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Critical)
        {
            HealthState::Unhealthy
        } else if issues.is_empty() {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        }
    }

    fn handle_unhealthy(&self, status: &HealthStatus) {
        warn!(agent = %status.agent_id, "Agent classified unhealthy");
        self.events.publish(
            SystemEvent::new(topic::HEALTH_CRITICAL)
                .with_agent(status.agent_id)
                .with_detail(serde_json::json!({ "issues": status.issues.len() })),
        );

        let critical = status
            .issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Critical)
            .count();
        // Recommendation only; stopping the agent is the caller's call.
        if critical >= 3 {
            self.events.publish(
                SystemEvent::new(topic::HEALTH_AGENT_OFFLINE)
                    .with_agent(status.agent_id)
                    .with_detail(serde_json::json!({
                        "reason": "multiple critical health issues",
                        "critical_issues": critical,
                    })),
            );
        }
    }
}
