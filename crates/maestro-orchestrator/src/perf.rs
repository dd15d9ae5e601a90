use crate::types::{AgentInstance, AgentMetrics, AgentRegistry, Task, TaskRegistry, TaskStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use maestro_core::event::topic;
use maestro_core::{EventBus, SystemEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metric keys used for trends and alerts.
pub mod metric {
    /// Completed tasks per minute, system wide.
    pub const THROUGHPUT: &str = "throughput";
    /// Failed tasks over all tasks, percent.
    pub const ERROR_RATE: &str = "error_rate";
    /// Mean duration of completed tasks, milliseconds.
    pub const AVERAGE_TASK_DURATION: &str = "average_task_duration";
}

/// Performance tracker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Snapshot tick, milliseconds.
    pub snapshot_interval_ms: u64,
    /// Ring-buffer cap on retained snapshots; oldest evicted first.
    pub history_cap: usize,
    /// Window trends are computed over, milliseconds.
    pub trend_window_ms: u64,
    /// |change rate| below this is STABLE, %/hour.
    pub stable_band_pct_per_hour: f64,
    /// Degrading faster than this raises an alert, %/hour.
    pub alert_threshold_pct_per_hour: f64,
    /// Degrading faster than this makes the alert high severity, %/hour.
    pub alert_high_severity_pct_per_hour: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 30_000,
            history_cap: 1_000,
            trend_window_ms: 3_600_000,
            stable_band_pct_per_hour: 5.0,
            alert_threshold_pct_per_hour: 20.0,
            alert_high_severity_pct_per_hour: 50.0,
        }
    }
}

/// Aggregated resource usage across all agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceAggregate {
    pub total_cpu_pct: f64,
    pub total_memory_mb: f64,
    pub average_cpu_pct: f64,
    pub average_memory_mb: f64,
    pub peak_cpu_pct: f64,
    pub peak_memory_mb: f64,
}

/// System-wide counters captured in a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub average_task_duration_ms: f64,
    pub throughput_per_min: f64,
    pub error_rate_pct: f64,
    pub resources: ResourceAggregate,
}

/// Per-bucket task counters (by type or by priority).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketMetrics {
    pub count: usize,
    pub average_duration_ms: f64,
    pub success_rate_pct: f64,
}

/// Per-agent task counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTaskBucket {
    pub tasks_assigned: usize,
    pub tasks_completed: usize,
    pub average_duration_ms: f64,
    pub success_rate_pct: f64,
}

/// Task metrics grouped three ways.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskBreakdown {
    pub by_type: HashMap<String, BucketMetrics>,
    pub by_priority: HashMap<String, BucketMetrics>,
    pub by_agent: HashMap<Uuid, AgentTaskBucket>,
}

/// One point-in-time capture of system, agent, and task metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub agents: HashMap<Uuid, AgentMetrics>,
    pub tasks: TaskBreakdown,
}

/// Direction a metric is moving over the trend window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendDirection {
    Improving,
    Degrading,
    Stable,
}

/// One sampled value inside a trend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A metric's movement over the trend window, normalized to percent
/// change per hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceTrend {
    pub metric: String,
    pub samples: Vec<TrendSample>,
    pub direction: TrendDirection,
    pub change_rate_pct_per_hour: f64,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

/// A degradation alert keyed by metric name. Auto-resolves once the
/// metric's trend is next computed as stable or improving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub metric: String,
    pub value: f64,
}

/// Weighted per-agent performance ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRanking {
    pub agent_id: Uuid,
    pub score: f64,
    /// 1 is best.
    pub rank: usize,
    pub metrics: AgentMetrics,
}

/// What a recommendation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationCategory {
    Performance,
    Resource,
    LoadBalancing,
    Capacity,
}

/// How urgent a recommendation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationPriority {
    High,
    Medium,
    Low,
}

/// Advisory optimization suggestion. Text only, no side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub category: RecommendationCategory,
    pub priority: RecommendationPriority,
    pub description: String,
    pub impact: String,
    pub action: String,
}

/// Tracks system performance over time: bounded snapshot history, trend
/// slopes, degradation alerts, agent rankings, and advisory
/// recommendations.
pub struct PerformanceTracker {
    config: PerformanceConfig,
    events: Arc<EventBus>,
    snapshots: Arc<RwLock<VecDeque<PerformanceSnapshot>>>,
    alerts: Arc<RwLock<HashMap<String, PerformanceAlert>>>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceTracker {
    pub fn new(config: PerformanceConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            events,
            snapshots: Arc::new(RwLock::new(VecDeque::new())),
            alerts: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    /// Starts the periodic snapshot loop over the shared registries.
    pub async fn start(self: Arc<Self>, agents: AgentRegistry, tasks: TaskRegistry) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(tx);

        let tracker = Arc::clone(&self);
        let tick = Duration::from_millis(self.config.snapshot_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let agent_list: Vec<AgentInstance> =
                            agents.read().await.values().cloned().collect();
                        let task_list: Vec<Task> =
                            tasks.read().await.values().cloned().collect();
                        tracker.take_snapshot(&agent_list, &task_list).await;
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!(
            interval_ms = self.config.snapshot_interval_ms,
            "Performance tracker started"
        );
    }

    /// Hook invoked by the orchestrator on every terminal task update.
    /// Emits a real-time metric event feeding dashboards and tests.
    pub fn record_task_completion(&self, task: &Task) {
        let duration_ms = task.actual_duration_ms.unwrap_or_else(|| {
            match (task.started_at, task.completed_at) {
                (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
                _ => 0,
            }
        });

        debug!(task = %task.id, duration_ms, "Recording task outcome");
        self.events.publish(
            SystemEvent::new(topic::PERFORMANCE_TASK_COMPLETED)
                .with_task(task.id)
                .with_detail(serde_json::json!({
                    "task_type": task.task_type,
                    "duration_ms": duration_ms,
                    "success": task.status == TaskStatus::Completed,
                    "agent_id": task.assigned_agent_id,
                })),
        );
    }

    /// Computes one snapshot, appends it to the bounded history, and
    /// re-evaluates trends and alerts.
    pub async fn take_snapshot(
        &self,
        agents: &[AgentInstance],
        tasks: &[Task],
    ) -> PerformanceSnapshot {
        let snapshot = PerformanceSnapshot {
            timestamp: Utc::now(),
            system: Self::system_metrics(agents, tasks),
            agents: agents
                .iter()
                .map(|agent| (agent.id, agent.metrics.clone()))
                .collect(),
            tasks: Self::task_breakdown(tasks),
        };

        {
            let mut history = self.snapshots.write().await;
            history.push_back(snapshot.clone());
            while history.len() > self.config.history_cap {
                history.pop_front();
            }
        }

        self.evaluate_alerts().await;
        snapshot
    }

    /// Latest snapshot's system metrics, if any snapshot exists.
    pub async fn current_metrics(&self) -> Option<SystemMetrics> {
        let history = self.snapshots.read().await;
        history.back().map(|s| s.system.clone())
    }

    /// Number of retained snapshots.
    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Trends for throughput, error rate, and average task duration over
    /// the given window. Empty until two snapshots fall inside it.
    pub async fn performance_trends(&self, window_ms: u64) -> Vec<PerformanceTrend> {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(window_ms as i64);
        let history = self.snapshots.read().await;
        let recent: Vec<&PerformanceSnapshot> =
            history.iter().filter(|s| s.timestamp >= cutoff).collect();
        if recent.len() < 2 {
            return Vec::new();
        }

        let tracked: [(&str, fn(&PerformanceSnapshot) -> f64); 3] = [
            (metric::THROUGHPUT, |s| s.system.throughput_per_min),
            (metric::ERROR_RATE, |s| s.system.error_rate_pct),
            (metric::AVERAGE_TASK_DURATION, |s| {
                s.system.average_task_duration_ms
            }),
        ];
        tracked
            .into_iter()
            .map(|(name, extract)| {
                let samples: Vec<TrendSample> = recent
                    .iter()
                    .copied()
                    .map(|s| TrendSample {
                        timestamp: s.timestamp,
                        value: extract(s),
                    })
                    .collect();
                self.metric_trend(name, samples)
            })
            .collect()
    }

    /// Agents ranked by a weighted score of success rate, speed,
    /// efficiency, and reliability. Rank 1 is best.
    pub async fn agent_performance_comparison(&self) -> Vec<AgentRanking> {
        let history = self.snapshots.read().await;
        let Some(latest) = history.back() else {
            return Vec::new();
        };

        let mut rankings: Vec<AgentRanking> = latest
            .agents
            .iter()
            .map(|(agent_id, metrics)| AgentRanking {
                agent_id: *agent_id,
                score: Self::performance_score(metrics),
                rank: 0,
                metrics: metrics.clone(),
            })
            .collect();

        rankings.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.agent_id.cmp(&b.agent_id))
        });
        for (index, ranking) in rankings.iter_mut().enumerate() {
            ranking.rank = index + 1;
        }
        rankings
    }

    /// Rule-based advisory suggestions derived from the latest snapshot
    /// and current trends.
    pub async fn optimization_recommendations(&self) -> Vec<Recommendation> {
        let Some(system) = self.current_metrics().await else {
            return Vec::new();
        };
        let mut recommendations = Vec::new();

        if system.error_rate_pct > 5.0 {
            recommendations.push(Recommendation {
                category: RecommendationCategory::Performance,
                priority: RecommendationPriority::High,
                description: format!("System error rate is {:.1}%", system.error_rate_pct),
                impact: "Reduced reliability of task execution".to_string(),
                action: "Investigate failing tasks and their assigned agents".to_string(),
            });
        }

        if system.resources.average_cpu_pct > 80.0 {
            recommendations.push(Recommendation {
                category: RecommendationCategory::Resource,
                priority: RecommendationPriority::High,
                description: "High CPU utilization across agents".to_string(),
                impact: "Task execution slows down under sustained load".to_string(),
                action: "Register more agent instances or reduce concurrency limits".to_string(),
            });
        }

        let trends = self.performance_trends(self.config.trend_window_ms).await;
        if trends
            .iter()
            .any(|t| t.metric == metric::THROUGHPUT && t.direction == TrendDirection::Degrading)
        {
            recommendations.push(Recommendation {
                category: RecommendationCategory::Performance,
                priority: RecommendationPriority::Medium,
                description: "System throughput is declining".to_string(),
                impact: "Slower task completion over time".to_string(),
                action: "Review task distribution and run a load-balancing pass".to_string(),
            });
        }

        let rankings = self.agent_performance_comparison().await;
        if rankings.len() > 1 {
            let best = &rankings[0];
            let worst = &rankings[rankings.len() - 1];
            if worst.score > 0.0 && best.score / worst.score > 2.0 {
                recommendations.push(Recommendation {
                    category: RecommendationCategory::LoadBalancing,
                    priority: RecommendationPriority::Medium,
                    description: "Significant performance gap between best and worst agent"
                        .to_string(),
                    impact: "Uneven utilization of the agent pool".to_string(),
                    action: "Redistribute tasks and review the slow agent's capabilities"
                        .to_string(),
                });
            }
        }

        recommendations
    }

    /// Unresolved alerts.
    pub async fn active_alerts(&self) -> Vec<PerformanceAlert> {
        self.alerts
            .read()
            .await
            .values()
            .filter(|alert| !alert.resolved)
            .cloned()
            .collect()
    }

    /// Stops the snapshot loop and clears history and alerts. Idempotent.
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
                warn!("Performance snapshot loop did not stop in time");
            }
        }
        self.snapshots.write().await.clear();
        self.alerts.write().await.clear();
        info!("Performance tracker shut down");
    }

    // --- metric computation ---

    fn system_metrics(agents: &[AgentInstance], tasks: &[Task]) -> SystemMetrics {
        let completed: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let active = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();

        let average_task_duration_ms = if completed.is_empty() {
            0.0
        } else {
            completed
                .iter()
                .map(|t| t.actual_duration_ms.unwrap_or(0) as f64)
                .sum::<f64>()
                / completed.len() as f64
        };

        // Completed count over wall-clock since the earliest completed
        // task was created, normalized to per-minute.
        let throughput_per_min = completed
            .iter()
            .map(|t| t.created_at)
            .min()
            .map(|earliest| {
                let elapsed_ms = (Utc::now() - earliest).num_milliseconds();
                if elapsed_ms > 0 {
                    (completed.len() as f64 / elapsed_ms as f64) * 60_000.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        let error_rate_pct = if tasks.is_empty() {
            0.0
        } else {
            (failed as f64 / tasks.len() as f64) * 100.0
        };

        SystemMetrics {
            total_tasks: tasks.len(),
            active_tasks: active,
            completed_tasks: completed.len(),
            failed_tasks: failed,
            average_task_duration_ms,
            throughput_per_min,
            error_rate_pct,
            resources: Self::resource_aggregate(agents),
        }
    }

    fn resource_aggregate(agents: &[AgentInstance]) -> ResourceAggregate {
        if agents.is_empty() {
            return ResourceAggregate::default();
        }
        let cpus: Vec<f64> = agents.iter().map(|a| a.metrics.cpu_usage_pct).collect();
        let memories: Vec<f64> = agents.iter().map(|a| a.metrics.memory_usage_mb).collect();
        let total_cpu: f64 = cpus.iter().sum();
        let total_memory: f64 = memories.iter().sum();
        ResourceAggregate {
            total_cpu_pct: total_cpu,
            total_memory_mb: total_memory,
            average_cpu_pct: total_cpu / agents.len() as f64,
            average_memory_mb: total_memory / agents.len() as f64,
            peak_cpu_pct: cpus.iter().copied().fold(0.0, f64::max),
            peak_memory_mb: memories.iter().copied().fold(0.0, f64::max),
        }
    }

    fn task_breakdown(tasks: &[Task]) -> TaskBreakdown {
        let mut by_type: HashMap<String, Vec<&Task>> = HashMap::new();
        let mut by_priority: HashMap<String, Vec<&Task>> = HashMap::new();
        let mut by_agent: HashMap<Uuid, Vec<&Task>> = HashMap::new();

        for task in tasks {
            by_type.entry(task.task_type.clone()).or_default().push(task);
            by_priority
                .entry(task.priority.to_string())
                .or_default()
                .push(task);
            if let Some(agent_id) = task.assigned_agent_id {
                by_agent.entry(agent_id).or_default().push(task);
            }
        }

        TaskBreakdown {
            by_type: by_type
                .into_iter()
                .map(|(key, bucket)| (key, Self::bucket_metrics(&bucket)))
                .collect(),
            by_priority: by_priority
                .into_iter()
                .map(|(key, bucket)| (key, Self::bucket_metrics(&bucket)))
                .collect(),
            by_agent: by_agent
                .into_iter()
                .map(|(agent_id, bucket)| {
                    let metrics = Self::bucket_metrics(&bucket);
                    let completed = bucket
                        .iter()
                        .filter(|t| t.status == TaskStatus::Completed)
                        .count();
                    (
                        agent_id,
                        AgentTaskBucket {
                            tasks_assigned: bucket.len(),
                            tasks_completed: completed,
                            average_duration_ms: metrics.average_duration_ms,
                            success_rate_pct: metrics.success_rate_pct,
                        },
                    )
                })
                .collect(),
        }
    }

    fn bucket_metrics(bucket: &[&Task]) -> BucketMetrics {
        let completed: Vec<&&Task> = bucket
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        let failed = bucket
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();

        let average_duration_ms = if completed.is_empty() {
            0.0
        } else {
            completed
                .iter()
                .map(|t| t.actual_duration_ms.unwrap_or(0) as f64)
                .sum::<f64>()
                / completed.len() as f64
        };
        let terminal = completed.len() + failed;
        let success_rate_pct = if terminal == 0 {
            100.0
        } else {
            (completed.len() as f64 / terminal as f64) * 100.0
        };

        BucketMetrics {
            count: bucket.len(),
            average_duration_ms,
            success_rate_pct,
        }
    }

    fn performance_score(metrics: &AgentMetrics) -> f64 {
        let success_score = metrics.success_rate;
        let speed_score = if metrics.average_task_time_ms > 0.0 {
            ((60_000.0 / metrics.average_task_time_ms) * 10.0).min(100.0)
        } else {
            0.0
        };
        let efficiency_score = if metrics.tasks_completed > 0 {
            ((metrics.tasks_completed as f64 / (metrics.tasks_in_progress.max(1)) as f64) * 20.0)
                .min(100.0)
        } else {
            0.0
        };
        let reliability_score = (100.0 - metrics.error_count as f64).max(0.0);

        success_score * 0.4 + speed_score * 0.3 + efficiency_score * 0.2 + reliability_score * 0.1
    }

    /// Two-point slope between the first and last sample, normalized to
    /// percent change per hour. For error rate a rising value is
    /// degrading; for the other metrics it is improving.
    fn metric_trend(&self, name: &str, samples: Vec<TrendSample>) -> PerformanceTrend {
        let change_rate = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) if samples.len() >= 2 => {
                let timespan_ms = (last.timestamp - first.timestamp).num_milliseconds();
                if timespan_ms > 0 && first.value.abs() > f64::EPSILON {
                    ((last.value - first.value) / first.value)
                        * (3_600_000.0 / timespan_ms as f64)
                        * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let direction = if change_rate.abs() < self.config.stable_band_pct_per_hour {
            TrendDirection::Stable
        } else if change_rate > 0.0 {
            if name == metric::ERROR_RATE {
                TrendDirection::Degrading
            } else {
                TrendDirection::Improving
            }
        } else if name == metric::ERROR_RATE {
            TrendDirection::Improving
        } else {
            TrendDirection::Degrading
        };

        PerformanceTrend {
            metric: name.to_string(),
            samples,
            direction,
            change_rate_pct_per_hour: change_rate,
        }
    }

    /// Raises an alert for every metric degrading past the threshold and
    /// resolves alerts whose metric has recovered.
    async fn evaluate_alerts(&self) {
        let trends = self.performance_trends(self.config.trend_window_ms).await;
        let mut alerts = self.alerts.write().await;

        for trend in &trends {
            let alert_id = format!("{}_trend_alert", trend.metric);
            let rate = trend.change_rate_pct_per_hour;

            if trend.direction == TrendDirection::Degrading
                && rate.abs() > self.config.alert_threshold_pct_per_hour
            {
                let severity = if rate.abs() > self.config.alert_high_severity_pct_per_hour {
                    AlertSeverity::High
                } else {
                    AlertSeverity::Medium
                };
                let alert = PerformanceAlert {
                    id: alert_id.clone(),
                    severity,
                    message: format!(
                        "{} is degrading at {:.1}% per hour",
                        trend.metric, rate
                    ),
                    timestamp: Utc::now(),
                    resolved: false,
                    metric: trend.metric.clone(),
                    value: trend.samples.last().map(|s| s.value).unwrap_or(0.0),
                };
                warn!(metric = %trend.metric, rate, "Performance degradation alert");
                self.events.publish(
                    SystemEvent::new(topic::PERFORMANCE_ALERT)
                        .with_detail(serde_json::json!({
                            "metric": alert.metric,
                            "severity": alert.severity,
                            "change_rate_pct_per_hour": rate,
                        })),
                );
                alerts.insert(alert_id, alert);
            } else if let Some(alert) = alerts.get_mut(&alert_id) {
                // Trend recovered; resolve the standing alert.
                if !alert.resolved {
                    debug!(metric = %trend.metric, "Resolving performance alert");
                    alert.resolved = true;
                }
            }
        }
    }
}
