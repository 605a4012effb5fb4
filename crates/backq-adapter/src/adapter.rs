use crate::Result;
use async_trait::async_trait;
use backq_core::{JobId, LeasedJob, Priority, PublishOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where and how to reach a broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Reconnect once and retry when a lease or enqueue hits a dropped connection
    pub persistent: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port: backq_protocol::DEFAULT_PORT,
            connect_timeout_secs: 1,
            persistent: false,
        }
    }
}

/// How failed jobs are handed back to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    pub priority: Priority,
    pub delay: Duration,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        ReleasePolicy {
            priority: Priority::default(),
            delay: Duration::ZERO,
        }
    }
}

/// Broker capabilities a worker or publisher relies on.
///
/// Implementations never panic on broker trouble: transport failures are
/// logged where they happen and surface as `Err` values.
#[async_trait]
pub trait QueueAdapter: Send {
    /// Broker family, used in logs
    fn name(&self) -> &'static str;

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()>;

    /// Subscribe to a queue for leasing. Idempotent per connection.
    async fn bind_read(&mut self, queue: &str) -> Result<()>;

    /// Select the queue `put_task` writes to. Idempotent per connection.
    async fn bind_write(&mut self, queue: &str) -> Result<()>;

    /// How long `pick_task` may block; `None` blocks until a job arrives
    fn set_work_timeout(&mut self, timeout: Option<Duration>);

    /// Lease the next job, `Ok(None)` when none became available in time
    async fn pick_task(&mut self) -> Result<Option<LeasedJob>>;

    async fn put_task(&mut self, payload: &[u8], options: &PublishOptions) -> Result<JobId>;

    /// Job processed: remove it from the broker
    async fn after_work_success(&mut self, id: JobId) -> Result<()>;

    /// Job not processed: hand it back for another attempt
    async fn after_work_failed(&mut self, id: JobId) -> Result<()>;

    /// Number of workers subscribed to `queue`
    async fn has_workers(&mut self, queue: &str) -> Result<u32>;

    /// Liveness probe; with `reconnect` a failed probe reconnects and probes once more
    async fn ping(&mut self, reconnect: bool) -> Result<()>;

    /// Close the connection. Calling it again is harmless.
    async fn disconnect(&mut self) -> Result<()>;
}
