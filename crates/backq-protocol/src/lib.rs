mod client;
mod codec;
mod message;
mod stats;

pub use client::{BeanstalkClient, BrokerClient, ReservedJob};
pub use codec::BeanstalkCodec;
pub use message::{Command, Response};
pub use stats::Stats;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timed out")]
    Timeout,

    #[error("Job not found")]
    NotFound,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Bad frame: {0}")]
    BadFrame(String),

    #[error("Stats error: {0}")]
    Stats(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the connection can no longer be trusted after this error
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotConnected
                | ProtocolError::ConnectionClosed
                | ProtocolError::Timeout
                | ProtocolError::BadFrame(_)
                | ProtocolError::IoError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Longest command or response line beanstalkd accepts, terminator excluded
pub const MAX_LINE_LENGTH: usize = 224;

/// Largest job or stats body accepted from the server (beanstalkd's default max-job-size)
pub const MAX_BODY_LENGTH: usize = 65_535;

/// Port beanstalkd listens on by default
pub const DEFAULT_PORT: u16 = 11300;

/// Tube every connection uses and watches after connecting
pub const DEFAULT_TUBE: &str = "default";
