use crate::Priority;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Broker-assigned job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    pub fn new(value: u64) -> Self {
        JobId(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        JobId(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job handed out by the broker, exclusively leased until acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    pub id: JobId,
    pub payload: Vec<u8>,
}

impl LeasedJob {
    pub fn new(id: JobId, payload: Vec<u8>) -> Self {
        LeasedJob { id, payload }
    }
}

/// Enqueue parameters understood by every adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Lower is more urgent
    pub priority: Priority,

    /// Seconds the job stays delayed before it can be leased
    pub readywait: u64,

    /// Time-to-run in seconds, after which a leased job is released again
    pub jobttr: u64,
}

impl PublishOptions {
    pub const DEFAULT_READYWAIT: u64 = 0;
    pub const DEFAULT_JOBTTR: u64 = 60;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn readywait(mut self, seconds: u64) -> Self {
        self.readywait = seconds;
        self
    }

    pub fn jobttr(mut self, seconds: u64) -> Self {
        self.jobttr = seconds;
        self
    }

    pub fn readywait_duration(&self) -> Duration {
        Duration::from_secs(self.readywait)
    }

    pub fn jobttr_duration(&self) -> Duration {
        Duration::from_secs(self.jobttr)
    }
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            priority: Priority::default(),
            readywait: Self::DEFAULT_READYWAIT,
            jobttr: Self::DEFAULT_JOBTTR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_option_defaults() {
        let options = PublishOptions::default();
        assert_eq!(options.priority.value(), 1024);
        assert_eq!(options.readywait, 0);
        assert_eq!(options.jobttr, 60);
        assert_eq!(options.jobttr_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_publish_option_builder() {
        let options = PublishOptions::new().priority(10u32).readywait(30).jobttr(120);

        assert_eq!(options.priority, Priority::new(10));
        assert_eq!(options.readywait_duration(), Duration::from_secs(30));
        assert_eq!(options.jobttr, 120);
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId::new(42).to_string(), "42");
        assert_eq!(JobId::from(7).value(), 7);
    }
}
