use crate::{Result, WorkerError};
use backq_adapter::{Endpoint, ReleasePolicy};
use backq_core::Priority;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker: Endpoint,
    pub queue: String,
    pub worker_id: Option<String>,
    pub runtime: RuntimeConfig,
    pub process: ProcessConfig,
    /// Publishers a serialized message may name, keyed by that name
    pub publishers: BTreeMap<String, PublisherConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            broker: Endpoint::default(),
            queue: "process".to_string(),
            worker_id: None,
            runtime: RuntimeConfig::default(),
            process: ProcessConfig::default(),
            publishers: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| WorkerError::Config(e.to_string()))
    }

    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let uuid = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &uuid[..8])
    }
}

/// Lease cadence and stop conditions of a worker runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long a lease request waits at the broker; 0 polls without waiting
    pub work_timeout_secs: u64,
    /// Pause after an empty poll when the lease request did not wait
    pub idle_backoff_ms: u64,
    /// Stop after this many settled jobs, 0 = never
    pub restart_threshold: u64,
    /// Stop after this long without a job
    pub max_idle_secs: Option<u64>,
    pub release_priority: u32,
    pub release_delay_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            work_timeout_secs: 5,
            idle_backoff_ms: 1000,
            restart_threshold: 0,
            max_idle_secs: None,
            release_priority: Priority::DEFAULT,
            release_delay_secs: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn work_timeout(&self) -> Duration {
        Duration::from_secs(self.work_timeout_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn max_idle(&self) -> Option<Duration> {
        self.max_idle_secs.map(Duration::from_secs)
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy {
            priority: Priority::new(self.release_priority),
            delay: Duration::from_secs(self.release_delay_secs),
        }
    }
}

/// Child process supervision knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub reap_poll_interval_ms: u64,
    pub shutdown_poll_interval_ms: u64,
    pub stop_grace_secs: u64,
    /// Applied when a message carries no timeout; 0 disables it
    pub default_timeout_secs: u64,
    /// Per stream cap on captured stdout/stderr
    pub max_output_bytes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            reap_poll_interval_ms: 200,
            shutdown_poll_interval_ms: 100,
            stop_grace_secs: 2,
            default_timeout_secs: 60,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl ProcessConfig {
    pub fn reap_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reap_poll_interval_ms)
    }

    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Timeout for a message: `Some(0)` disables it, `None` falls back to the default
    pub fn timeout_for(&self, requested: Option<u64>) -> Option<Duration> {
        match requested.unwrap_or(self.default_timeout_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub queue: String,
    /// Broker to publish to, defaults to the worker's own
    #[serde(default)]
    pub broker: Option<Endpoint>,
}
