//! Process supervision: one supervised OS subprocess per running agent.

pub mod command;
pub mod error;
pub mod health;
pub mod restart;
pub mod shutdown;
pub mod stream;
#[allow(clippy::module_inception)]
pub mod supervisor;

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

use crate::agent::definition::Agent;
use crate::event::channel::EventPublisher;

use self::error::{CommandError, SupervisorError};
use self::health::HealthThresholds;
use self::restart::{Backoff, RestartPolicy};
use self::supervisor::{NotStartedSupervisor, SupervisorEvent};

/// Entry point of a built supervisor: `start` launches the supervision
/// threads and hands back the running handle.
pub trait SupervisorStarter {
    type Stopper: SupervisorStopper;

    fn start(
        self,
        publisher: EventPublisher<SupervisorEvent>,
    ) -> Result<Self::Stopper, SupervisorError>;
}

/// A running supervisor: can feed frames to the worker and be stopped.
pub trait SupervisorStopper {
    /// Cancels supervision and terminates the worker process gracefully.
    fn stop(self) -> Result<(), SupervisorError>;

    /// Writes one newline-terminated frame to the worker's stdin.
    fn send_line(&self, line: &str) -> Result<(), CommandError>;

    /// Blocks until the worker reports ready, up to `timeout`.
    fn wait_ready(&self, timeout: Duration) -> bool;
}

/// Builds supervisors for agents. The seam the Agent Manager is tested
/// through.
pub trait SupervisorBuilder {
    type Starter: SupervisorStarter;

    fn build(&self, agent: &Agent) -> Result<Self::Starter, SupervisorError>;
}

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub check_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub unresponsive_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub startup_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            unresponsive_timeout: DEFAULT_UNRESPONSIVE_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Builds [`NotStartedSupervisor`]s that run real OS processes. Health
/// thresholds come from the agent's resource limits.
pub struct ProcessSupervisorBuilder {
    config: SupervisorConfig,
}

impl ProcessSupervisorBuilder {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }
}

impl SupervisorBuilder for ProcessSupervisorBuilder {
    type Starter = NotStartedSupervisor;

    fn build(&self, agent: &Agent) -> Result<Self::Starter, SupervisorError> {
        let thresholds = HealthThresholds {
            unresponsive_timeout: self.config.unresponsive_timeout,
            cpu_percent: agent.resource_limits.max_cpu_percent,
            memory_mb: agent.resource_limits.max_memory_mb,
        };

        Ok(
            NotStartedSupervisor::new(agent.id.clone(), agent.command.clone())
                .with_restart_policy(RestartPolicy::new(
                    Backoff::default(),
                    restart::DEFAULT_MAX_ATTEMPTS,
                    restart::DEFAULT_WINDOW,
                ))
                .with_health(thresholds, self.config.check_interval)
                .with_stop_grace(self.config.stop_timeout),
        )
    }
}
