use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, System};
use tracing::debug;

use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};

use crate::agent::definition::AgentId;

use super::supervisor::SupervisorEvent;

pub const HEALTH_MONITOR_THREAD_NAME: &str = "health monitor";

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource classifications attached to a health sample. Reported through
/// events; the monitor never terminates a process by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthFlag {
    Unresponsive,
    HighCpu,
    HighMemory,
}

/// One observation of a supervised worker process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub alive: bool,
    pub cpu_percent: f32,
    pub memory_mb: u64,
    /// Seconds since the worker last wrote to stdout/stderr, if it ever did.
    pub seconds_since_output: Option<u64>,
    pub flags: Vec<HealthFlag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub unresponsive_timeout: Duration,
    pub cpu_percent: f32,
    pub memory_mb: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            unresponsive_timeout: DEFAULT_UNRESPONSIVE_TIMEOUT,
            cpu_percent: 80.0,
            memory_mb: 500,
        }
    }
}

/// Samples cpu/rss of the current worker pid and classifies the observation
/// against the configured thresholds.
pub struct ProcessHealthChecker {
    pid: Arc<Mutex<Option<u32>>>,
    last_output: Arc<Mutex<Option<Instant>>>,
    thresholds: HealthThresholds,
    system: System,
}

impl ProcessHealthChecker {
    pub fn new(
        pid: Arc<Mutex<Option<u32>>>,
        last_output: Arc<Mutex<Option<Instant>>>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            pid,
            last_output,
            thresholds,
            system: System::new(),
        }
    }

    pub fn sample(&mut self) -> HealthSample {
        let Some(pid) = *self.pid.lock().unwrap() else {
            return HealthSample {
                alive: false,
                cpu_percent: 0.0,
                memory_mb: 0,
                seconds_since_output: None,
                flags: Vec::new(),
            };
        };

        let sys_pid = Pid::from_u32(pid);
        let alive = self.system.refresh_process(sys_pid);
        let (cpu_percent, memory_mb) = self
            .system
            .process(sys_pid)
            .map(|p| (p.cpu_usage(), p.memory() / (1024 * 1024)))
            .unwrap_or((0.0, 0));

        let seconds_since_output = self
            .last_output
            .lock()
            .unwrap()
            .map(|at| at.elapsed().as_secs());

        let mut flags = Vec::new();
        if alive {
            if seconds_since_output
                .is_some_and(|secs| secs >= self.thresholds.unresponsive_timeout.as_secs())
            {
                flags.push(HealthFlag::Unresponsive);
            }
            if cpu_percent > self.thresholds.cpu_percent {
                flags.push(HealthFlag::HighCpu);
            }
            if memory_mb > self.thresholds.memory_mb {
                flags.push(HealthFlag::HighMemory);
            }
        }

        HealthSample {
            alive,
            cpu_percent,
            memory_mb,
            seconds_since_output,
            flags,
        }
    }
}

/// Spawns the per-agent health monitor thread: samples on `interval` and
/// publishes the observation until cancelled.
pub(crate) fn spawn_health_monitor(
    agent_id: AgentId,
    mut checker: ProcessHealthChecker,
    publisher: EventPublisher<SupervisorEvent>,
    interval: Duration,
) -> StartedThreadContext {
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| loop {
        let sample = checker.sample();
        debug!(agent_id = %agent_id, alive = sample.alive, "health sample taken");
        if publisher
            .publish(SupervisorEvent::Health(agent_id.clone(), sample))
            .is_err()
        {
            break;
        }

        if stop_consumer.is_cancelled(interval) {
            break;
        }
    };
    NotStartedThreadContext::new(HEALTH_MONITOR_THREAD_NAME, callback).start()
}
