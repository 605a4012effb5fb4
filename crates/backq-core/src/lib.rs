mod error;
mod job;
mod message;
mod outcome;
mod priority;
mod publisher;

pub use error::{CoreError, Result};
pub use job::{JobId, LeasedJob, PublishOptions};
pub use message::{Commandline, Message, ProcessMessage, SerializedMessage};
pub use outcome::WorkOutcome;
pub use priority::Priority;
pub use publisher::{Publisher, PublisherRegistry};

pub const MAX_PAYLOAD_SIZE: usize = 65_535; // beanstalkd default max-job-size
