use serde::{Deserialize, Serialize};
use std::fmt;

/// Job priority as understood by the broker.
/// Lower numerical values are leased first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u32);

impl Priority {
    /// Jobs below this value are considered urgent by beanstalkd
    pub const URGENT_THRESHOLD: u32 = 1024;

    /// Default priority for published jobs
    pub const DEFAULT: u32 = 1024;

    /// Most urgent value
    pub const MOST_URGENT: u32 = 0;

    /// Create a new priority value
    pub fn new(value: u32) -> Self {
        Priority(value)
    }

    /// Most urgent priority (0)
    pub fn urgent() -> Self {
        Priority(Self::MOST_URGENT)
    }

    /// Get the raw priority value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Check if the broker will treat this job as urgent
    pub fn is_urgent(&self) -> bool {
        self.0 < Self::URGENT_THRESHOLD
    }

    /// Returns true if `self` is leased before `other`
    pub fn is_more_urgent_than(&self, other: &Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(Self::DEFAULT)
    }
}

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Priority(value)
    }
}

impl From<Priority> for u32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
