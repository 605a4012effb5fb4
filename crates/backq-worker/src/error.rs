use backq_core::JobId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker runtime is not started")]
    NotStarted,

    #[error("Lease for {0} has not been settled")]
    UnsettledLease(String),

    #[error("Lease for {0} was not issued by this runtime")]
    UnknownLease(String),

    #[error("Job {0} was dispatched but not committed")]
    Unreliable(JobId),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
