use crate::{Endpoint, QueueAdapter};
use async_trait::async_trait;
use backq_core::{CoreError, Message, PublishOptions, Publisher};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Publisher that enqueues messages on one queue through a [`QueueAdapter`]
pub struct QueuePublisher<A: QueueAdapter> {
    adapter: Mutex<A>,
    endpoint: Endpoint,
    queue: String,
    started: AtomicBool,
}

impl<A: QueueAdapter> QueuePublisher<A> {
    pub fn new(adapter: A, endpoint: Endpoint, queue: impl Into<String>) -> Self {
        QueuePublisher {
            adapter: Mutex::new(adapter),
            endpoint,
            queue: queue.into(),
            started: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<A: QueueAdapter + 'static> Publisher for QueuePublisher<A> {
    async fn start(&self) -> bool {
        if self.is_started() {
            return true;
        }

        let mut adapter = self.adapter.lock().await;
        if adapter.connect(&self.endpoint).await.is_err() {
            return false;
        }
        if adapter.bind_write(&self.queue).await.is_err() {
            let _ = adapter.disconnect().await;
            return false;
        }

        debug!("Publisher for queue {} started on {}", self.queue, adapter.name());
        self.started.store(true, Ordering::Release);
        true
    }

    async fn publish(&self, message: &Message, options: &PublishOptions) -> backq_core::Result<String> {
        if !self.is_started() {
            return Err(CoreError::PublisherNotStarted(self.queue.clone()));
        }

        let payload = message.to_bytes()?;
        let mut adapter = self.adapter.lock().await;
        match adapter.put_task(&payload, options).await {
            Ok(id) => Ok(id.to_string()),
            Err(e) => {
                if e.is_transport() {
                    warn!("Publisher for queue {} lost its connection", self.queue);
                    self.started.store(false, Ordering::Release);
                }
                Err(CoreError::PublishFailed(e.to_string()))
            }
        }
    }
}
