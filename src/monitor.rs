//! Activity & Resource Monitor
//!
//! Periodically samples resource usage of running services, keeps a bounded
//! per-service metric history, and puts services to sleep when their
//! auto-shutdown policy says so. The decision logic is a pure function over a
//! policy, a last-accessed timestamp and a sample window, so the boundary
//! conditions are tested without any clock or engine in the loop.

use crate::orchestrator::Orchestrator;
use crate::config::MonitorConfig;
use crate::service::{AutoShutdownPolicy, ServiceState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One resource reading for a service
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of evaluating a service's auto-shutdown policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDecision {
    KeepRunning,
    /// No traffic within the inactivity timeout
    Inactive,
    /// Enough recent samples were low on both cpu and memory
    ConsistentlyIdle,
}

/// Aggregated view over a service's sample history
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub service_id: String,
    pub samples: usize,
    pub avg_cpu_percent: f64,
    pub max_cpu_percent: f64,
    pub avg_memory_bytes: u64,
    pub max_memory_bytes: u64,
}

/// Point-in-time rollup across all services
#[derive(Debug, Clone, Serialize)]
pub struct SystemOverview {
    pub services_total: usize,
    pub services_running: usize,
    pub total_cpu_percent: f64,
    pub total_memory_bytes: u64,
}

/// Decide whether a service should be put to sleep
///
/// The inactivity rule has priority: a service nobody has touched for its
/// full inactivity timeout sleeps regardless of what its resource samples
/// look like. The low-resource rule only fires once at least
/// [`AutoShutdownPolicy::MIN_SAMPLES`] samples fall inside the evaluation
/// window and the low-sample fraction reaches the policy ratio on **both**
/// the cpu and the memory dimension.
pub fn evaluate(
    policy: &AutoShutdownPolicy,
    last_accessed: DateTime<Utc>,
    samples: &[MetricSample],
    now: DateTime<Utc>,
) -> ShutdownDecision {
    let idle_for = now.signed_duration_since(last_accessed);
    if idle_for > chrono_duration(policy.inactivity_timeout) {
        return ShutdownDecision::Inactive;
    }

    let window_start = now - chrono_duration(policy.evaluation_window);
    let windowed: Vec<&MetricSample> = samples
        .iter()
        .filter(|s| s.timestamp >= window_start)
        .collect();
    if windowed.len() < AutoShutdownPolicy::MIN_SAMPLES {
        return ShutdownDecision::KeepRunning;
    }

    let total = windowed.len() as f64;
    let cpu_low = windowed
        .iter()
        .filter(|s| s.cpu_percent < policy.cpu_threshold_percent)
        .count() as f64;
    let memory_low = windowed
        .iter()
        .filter(|s| s.memory_bytes < policy.memory_threshold_bytes)
        .count() as f64;

    if cpu_low / total >= policy.low_sample_ratio && memory_low / total >= policy.low_sample_ratio
    {
        ShutdownDecision::ConsistentlyIdle
    } else {
        ShutdownDecision::KeepRunning
    }
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::MAX)
}

/// Polls running services and enforces their auto-shutdown policies
pub struct Monitor {
    orchestrator: Arc<Orchestrator>,
    config: MonitorConfig,
    history: DashMap<String, Mutex<VecDeque<MetricSample>>>,
}

impl Monitor {
    pub fn new(orchestrator: Arc<Orchestrator>, config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            config,
            history: DashMap::new(),
        })
    }

    /// Poll loop; returns when the shutdown channel flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.poll_interval_secs,
            "Monitor loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        warn!(error = %e, "Monitor cycle failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("Monitor loop stopping");
                    return;
                }
            }
        }
    }

    /// One polling pass over every service
    pub async fn cycle(&self) -> anyhow::Result<()> {
        let now = Utc::now();

        for id in self.orchestrator.registry().ids() {
            let Some(entry) = self.orchestrator.registry().get(&id) else {
                continue;
            };
            let (state, policy, last_accessed) = {
                let service = entry.lock().await;
                (service.state, service.policy.clone(), service.last_accessed)
            };

            self.prune_history(&id, now);

            if state != ServiceState::Running {
                continue;
            }

            match self.orchestrator.get_service_stats(&id).await {
                Ok(Some(stats)) => {
                    self.record(
                        &id,
                        MetricSample {
                            cpu_percent: stats.cpu_percent,
                            memory_bytes: stats.memory_usage,
                            memory_limit: stats.memory_limit,
                            timestamp: now,
                        },
                    );
                }
                Ok(None) => {
                    debug!(service = %id, "No stats this cycle");
                }
                Err(e) => {
                    warn!(service = %id, error = %e, "Stats collection failed");
                    continue;
                }
            }

            let decision = {
                let samples = self.samples(&id);
                evaluate(&policy, last_accessed, &samples, now)
            };

            match decision {
                ShutdownDecision::KeepRunning => {}
                ShutdownDecision::Inactive => {
                    info!(service = %id, "No recent activity, putting service to sleep");
                    if let Err(e) = self.orchestrator.sleep(&id).await {
                        warn!(service = %id, error = %e, "Auto-shutdown failed");
                    }
                }
                ShutdownDecision::ConsistentlyIdle => {
                    info!(service = %id, "Consistently idle resources, putting service to sleep");
                    if let Err(e) = self.orchestrator.sleep(&id).await {
                        warn!(service = %id, error = %e, "Auto-shutdown failed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Append a sample to a service's history
    pub fn record(&self, service_id: &str, sample: MetricSample) {
        let entry = self
            .history
            .entry(service_id.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        entry.lock().push_back(sample);
    }

    /// Drop samples older than the retention horizon
    fn prune_history(&self, service_id: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.history.get(service_id) {
            let horizon = now - chrono_duration(self.config.retention());
            let mut samples = entry.lock();
            while samples.front().is_some_and(|s| s.timestamp < horizon) {
                samples.pop_front();
            }
        }
    }

    fn samples(&self, service_id: &str) -> Vec<MetricSample> {
        self.history
            .get(service_id)
            .map(|entry| entry.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Samples for a service within the last `hours`, oldest first
    pub fn get_service_metrics(&self, service_id: &str, hours: u32) -> Vec<MetricSample> {
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(hours));
        self.samples(service_id)
            .into_iter()
            .filter(|s| s.timestamp >= cutoff)
            .collect()
    }

    /// Aggregate a service's samples within the last `hours`
    pub fn get_metrics_summary(&self, service_id: &str, hours: u32) -> Option<MetricsSummary> {
        let samples = self.get_service_metrics(service_id, hours);
        if samples.is_empty() {
            return None;
        }

        let count = samples.len();
        let mut cpu_sum = 0.0;
        let mut cpu_max = 0.0f64;
        let mut memory_sum = 0u64;
        let mut memory_max = 0u64;
        for sample in &samples {
            cpu_sum += sample.cpu_percent;
            cpu_max = cpu_max.max(sample.cpu_percent);
            memory_sum += sample.memory_bytes;
            memory_max = memory_max.max(sample.memory_bytes);
        }

        Some(MetricsSummary {
            service_id: service_id.to_string(),
            samples: count,
            avg_cpu_percent: cpu_sum / count as f64,
            max_cpu_percent: cpu_max,
            avg_memory_bytes: memory_sum / count as u64,
            max_memory_bytes: memory_max,
        })
    }

    /// Rollup of current state and latest samples across all services
    pub async fn get_system_overview(&self) -> SystemOverview {
        let infos = self.orchestrator.list_services().await;
        let services_total = infos.len();
        let services_running = infos
            .iter()
            .filter(|i| i.state == ServiceState::Running)
            .count();

        let mut total_cpu_percent = 0.0;
        let mut total_memory_bytes = 0u64;
        for info in &infos {
            if info.state != ServiceState::Running {
                continue;
            }
            if let Some(entry) = self.history.get(&info.id) {
                if let Some(latest) = entry.lock().back() {
                    total_cpu_percent += latest.cpu_percent;
                    total_memory_bytes += latest.memory_bytes;
                }
            }
        }

        SystemOverview {
            services_total,
            services_running,
            total_cpu_percent,
            total_memory_bytes,
        }
    }
}
