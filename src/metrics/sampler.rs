use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use sysinfo::{get_current_pid, System};
use tracing::{debug, warn};

use crate::agent::definition::{AgentId, AgentStatus};
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::registry::store::RegistryStore;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};

use super::series::{MetricsSeries, SystemSample};

pub const SAMPLER_THREAD_NAME: &str = "metrics sampler";

const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub sample_interval: Duration,
    pub retention: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            retention: super::series::DEFAULT_RETENTION,
        }
    }
}

/// The read-only view of core state the sampler consumes. Implemented by the
/// control plane facade.
pub trait ControlPlaneSnapshot: Send + Sync {
    fn agent_statuses(&self) -> Vec<(AgentId, AgentStatus)>;
    fn tasks_by_status(&self) -> BTreeMap<String, usize>;
    fn open_tasks_of(&self, agent_id: &AgentId) -> usize;
    fn pending_approvals(&self) -> usize;
    fn messages_enqueued_total(&self) -> u64;
}

/// Persisted per-agent time point.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AgentSample {
    pub timestamp: DateTime<Utc>,
    pub status: AgentStatus,
    pub open_tasks: usize,
}

/// Samples core state on an interval, retains bounded series (system-wide
/// and per-agent) and persists the metrics files.
pub struct MetricsSampler<S: ControlPlaneSnapshot> {
    snapshot: Arc<S>,
    series: Arc<MetricsSeries>,
    per_agent: std::sync::Mutex<std::collections::HashMap<AgentId, std::collections::VecDeque<AgentSample>>>,
    retention: usize,
    store: Arc<RegistryStore>,
    last_enqueued_total: AtomicU64,
    system: std::sync::Mutex<System>,
}

impl<S: ControlPlaneSnapshot + 'static> MetricsSampler<S> {
    pub fn new(snapshot: Arc<S>, series: Arc<MetricsSeries>, store: Arc<RegistryStore>) -> Self {
        Self {
            snapshot,
            series,
            per_agent: std::sync::Mutex::new(std::collections::HashMap::new()),
            retention: super::series::DEFAULT_RETENTION,
            store,
            last_enqueued_total: AtomicU64::new(0),
            system: std::sync::Mutex::new(System::new()),
        }
    }

    /// Per-agent samples within `[start, end]`, thinned to the first sample
    /// of each bucket.
    pub fn agent_series(
        &self,
        agent_id: &AgentId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: super::series::Interval,
    ) -> Vec<AgentSample> {
        let per_agent = self.per_agent.lock().unwrap();
        let Some(samples) = per_agent.get(agent_id) else {
            return Vec::new();
        };

        let mut result: Vec<AgentSample> = Vec::new();
        let mut last_bucket = None;
        for sample in samples
            .iter()
            .filter(|sample| sample.timestamp >= start && sample.timestamp <= end)
        {
            let bucket = interval.bucket_start(sample.timestamp);
            if last_bucket != Some(bucket) {
                result.push(sample.clone());
                last_bucket = Some(bucket);
            }
        }
        result
    }

    /// Takes one sample and persists the metrics files.
    pub fn sample_once(&self) {
        let statuses = self.snapshot.agent_statuses();
        let agents_running = statuses
            .iter()
            .filter(|(_, status)| *status == AgentStatus::Running)
            .count();

        let enqueued_total = self.snapshot.messages_enqueued_total();
        let previous = self
            .last_enqueued_total
            .swap(enqueued_total, Ordering::Relaxed);

        let (cpu_percent, memory_mb) = self.own_process_usage();

        let now = Utc::now();
        let sample = SystemSample {
            timestamp: now,
            agents_total: statuses.len(),
            agents_running,
            tasks_by_status: self.snapshot.tasks_by_status(),
            pending_approvals: self.snapshot.pending_approvals(),
            messages_enqueued: enqueued_total.saturating_sub(previous),
            cpu_percent,
            memory_mb,
        };
        debug!(
            agents = sample.agents_total,
            messages = sample.messages_enqueued,
            "metrics sample taken"
        );
        self.series.push(sample);

        if let Err(err) = self.store.save_system_metrics(&self.series.snapshot()) {
            warn!("could not persist system metrics: {err}");
        }
        for (agent_id, status) in statuses {
            let agent_sample = AgentSample {
                timestamp: now,
                status,
                open_tasks: self.snapshot.open_tasks_of(&agent_id),
            };
            if let Err(err) = self.store.save_agent_metrics(&agent_id, &agent_sample) {
                warn!(agent_id = %agent_id, "could not persist agent metrics: {err}");
            }
            let mut per_agent = self.per_agent.lock().unwrap();
            let ring = per_agent.entry(agent_id).or_default();
            if ring.len() == self.retention {
                ring.pop_front();
            }
            ring.push_back(agent_sample);
        }
    }

    fn own_process_usage(&self) -> (f32, u64) {
        let Ok(pid) = get_current_pid() else {
            return (0.0, 0);
        };
        let mut system = self.system.lock().unwrap();
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|process| (process.cpu_usage(), process.memory() / (1024 * 1024)))
            .unwrap_or((0.0, 0))
    }
}

/// Spawns the sampling thread.
pub fn start_sampler<S: ControlPlaneSnapshot + 'static>(
    sampler: Arc<MetricsSampler<S>>,
    interval: Duration,
) -> StartedThreadContext {
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| loop {
        sampler.sample_once();
        if stop_consumer.is_cancelled(interval) {
            break;
        }
    };
    NotStartedThreadContext::new(SAMPLER_THREAD_NAME, callback).start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedSnapshot;

    impl ControlPlaneSnapshot for FixedSnapshot {
        fn agent_statuses(&self) -> Vec<(AgentId, AgentStatus)> {
            vec![
                (AgentId::new("alpha").unwrap(), AgentStatus::Running),
                (AgentId::new("beta").unwrap(), AgentStatus::Stopped),
            ]
        }

        fn tasks_by_status(&self) -> BTreeMap<String, usize> {
            BTreeMap::from([("todo".to_string(), 3)])
        }

        fn open_tasks_of(&self, _: &AgentId) -> usize {
            1
        }

        fn pending_approvals(&self) -> usize {
            2
        }

        fn messages_enqueued_total(&self) -> u64 {
            40
        }
    }

    #[test]
    fn sample_counts_the_running_agents_and_diffs_messages() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RegistryStore::open(dir.path()).unwrap());
        let series = Arc::new(MetricsSeries::default());
        let sampler = MetricsSampler::new(Arc::new(FixedSnapshot), series.clone(), store);

        sampler.sample_once();
        let first = series.latest().unwrap();
        assert_eq!(first.agents_total, 2);
        assert_eq!(first.agents_running, 1);
        assert_eq!(first.pending_approvals, 2);
        // first sample sees the whole counter
        assert_eq!(first.messages_enqueued, 40);

        sampler.sample_once();
        // the counter did not move, so the bucket is empty
        assert_eq!(series.latest().unwrap().messages_enqueued, 0);

        assert!(dir.path().join("metrics/system-metrics.json").exists());
        assert!(dir.path().join("metrics/agents/alpha.json").exists());
    }
}
