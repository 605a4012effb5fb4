mod adapter;
mod beanstalk;
pub mod memory;
mod publisher;

pub use adapter::{Endpoint, QueueAdapter, ReleasePolicy};
pub use beanstalk::BeanstalkAdapter;
pub use memory::{MemoryBroker, MemoryConnection};
pub use publisher::QueuePublisher;

use backq_core::CoreError;
use backq_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Adapter is not connected")]
    NotConnected,

    #[error("Broker error: {0}")]
    Broker(#[from] ProtocolError),

    #[error("Broker did not report {0}")]
    MissingStat(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] CoreError),
}

impl AdapterError {
    /// Whether the failure came from the connection rather than the request
    pub fn is_transport(&self) -> bool {
        match self {
            AdapterError::NotConnected => true,
            AdapterError::Broker(e) => e.is_transport(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
