use crate::runtime::{Lease, WorkerRuntime};
use crate::{Result, WorkerError};
use backq_adapter::QueueAdapter;
use backq_core::{JobId, Message, PublisherRegistry, SerializedMessage, WorkOutcome};
use tracing::{debug, error, warn, Instrument, Span};

/// Worker that republishes the message nested in a serialized message
/// through the publisher it names.
pub struct DispatchForwarder<A: QueueAdapter> {
    runtime: WorkerRuntime<A>,
    registry: PublisherRegistry,
    span: Span,
}

impl<A: QueueAdapter> DispatchForwarder<A> {
    pub fn new(runtime: WorkerRuntime<A>, registry: PublisherRegistry, span: Span) -> Self {
        DispatchForwarder {
            runtime,
            registry,
            span,
        }
    }

    pub fn runtime(&self) -> &WorkerRuntime<A> {
        &self.runtime
    }

    pub async fn run(&mut self) -> Result<()> {
        let span = self.span.clone();
        async {
            if !self.runtime.start().await {
                self.runtime.finish().await;
                return Err(WorkerError::NotStarted);
            }

            let result = self.work().await;
            if let Err(e) = &result {
                warn!("Dispatch worker stopped: {}", e);
            }
            self.runtime.finish().await;
            result
        }
        .instrument(span)
        .await
    }

    async fn work(&mut self) -> Result<()> {
        while let Some(lease) = self.runtime.next().await? {
            match lease {
                Lease::Idle(idle) => {
                    let outcome = self.runtime.idle_outcome();
                    self.runtime.settle_idle(idle, outcome).await?;
                }
                Lease::Job(job) => {
                    let outcome = self.handle(job.id(), job.payload()).await;
                    self.runtime.acknowledge(job, outcome).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, id: JobId, payload: &[u8]) -> WorkOutcome {
        match Message::from_bytes(payload) {
            Ok(Message::Serialized(envelope)) => self.forward(id, &envelope).await,
            Ok(other) => {
                warn!("Job {} carries a {} message, dropping it", id, other.kind());
                WorkOutcome::Commit
            }
            Err(e) => {
                warn!("Job {} has an undecodable payload, dropping it: {}", id, e);
                WorkOutcome::Commit
            }
        }
    }

    async fn forward(&self, id: JobId, envelope: &SerializedMessage) -> WorkOutcome {
        let publisher = envelope.publisher().and_then(|name| self.registry.get(name));
        let (publisher, message) = match (publisher, envelope.message()) {
            (Some(publisher), Some(message)) => (publisher, message),
            (publisher, message) => {
                if publisher.is_none() {
                    match envelope.publisher() {
                        Some(name) => error!("Job {} names unknown publisher {}", id, name),
                        None => error!("Job {} has no publisher", id),
                    }
                }
                if message.is_none() {
                    error!("Job {} has no message to forward", id);
                }
                return WorkOutcome::Fail;
            }
        };

        if !publisher.start().await {
            error!("Job {}: publisher {:?} failed to start", id, envelope.publisher());
            return WorkOutcome::Fail;
        }

        match publisher.publish(message, envelope.options()).await {
            Ok(published) if !published.is_empty() => {
                debug!("Job {} forwarded as {}", id, published);
                WorkOutcome::Commit
            }
            Ok(_) => {
                error!("Job {}: publisher returned no identifier", id);
                WorkOutcome::Fail
            }
            Err(e) => {
                error!("Job {} could not be forwarded: {}", id, e);
                WorkOutcome::Fail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use async_trait::async_trait;
    use backq_adapter::memory::JobStatus;
    use backq_adapter::{BeanstalkAdapter, Endpoint, MemoryBroker, MemoryConnection, QueuePublisher};
    use backq_core::{CoreError, ProcessMessage, PublishOptions, Publisher};
    use parking_lot::Mutex;
    use std::sync::Arc;

    const QUEUE: &str = "serialized";

    /// Publisher answering from a script and recording what it was given
    #[derive(Clone)]
    struct ScriptedPublisher {
        starts: bool,
        reply: std::result::Result<String, String>,
        published: Arc<Mutex<Vec<(Message, PublishOptions)>>>,
    }

    impl ScriptedPublisher {
        fn replying(reply: std::result::Result<&str, &str>) -> Self {
            ScriptedPublisher {
                starts: true,
                reply: reply.map(str::to_string).map_err(str::to_string),
                published: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn calls(&self) -> usize {
            self.published.lock().len()
        }
    }

    #[async_trait]
    impl Publisher for ScriptedPublisher {
        async fn start(&self) -> bool {
            self.starts
        }

        async fn publish(&self, message: &Message, options: &PublishOptions) -> backq_core::Result<String> {
            self.published.lock().push((message.clone(), *options));
            self.reply.clone().map_err(CoreError::PublishFailed)
        }
    }

    fn forwarder(broker: &MemoryBroker, registry: PublisherRegistry, jobs: u64) -> DispatchForwarder<BeanstalkAdapter<MemoryConnection>> {
        let runtime = WorkerRuntime::new(
            BeanstalkAdapter::with_client(broker.connection()),
            Endpoint::default(),
            QUEUE,
            RuntimeConfig {
                work_timeout_secs: 0,
                idle_backoff_ms: 10,
                restart_threshold: jobs,
                ..RuntimeConfig::default()
            },
        );
        DispatchForwarder::new(runtime, registry, Span::none())
    }

    // Urgent, so a released job queues behind the ones not yet leased
    fn enqueue(broker: &MemoryBroker, message: impl Into<Message>) -> u64 {
        broker.put(QUEUE, 0, &message.into().to_bytes().unwrap())
    }

    #[tokio::test]
    async fn test_forwards_and_commits() {
        let broker = MemoryBroker::new();
        let publisher = ScriptedPublisher::replying(Ok("id-123"));
        let registry = PublisherRegistry::new();
        registry.register("mailer", publisher.clone());

        let nested = Message::from(ProcessMessage::shell("send-mail"));
        let options = PublishOptions::new().priority(5u32).jobttr(30);
        let id = enqueue(
            &broker,
            SerializedMessage::new("mailer", nested.clone()).with_options(options),
        );

        forwarder(&broker, registry, 1).run().await.unwrap();

        assert_eq!(broker.job_status(id), None);
        let published = publisher.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0], (nested, options));
    }

    #[tokio::test]
    async fn test_missing_publisher_or_message_fails() {
        let broker = MemoryBroker::new();
        let publisher = ScriptedPublisher::replying(Ok("id-1"));
        let registry = PublisherRegistry::new();
        registry.register("mailer", publisher.clone());

        let unknown = enqueue(&broker, SerializedMessage::new("nobody", ProcessMessage::shell("true")));
        let mut anonymous = SerializedMessage::new("mailer", ProcessMessage::shell("true"));
        anonymous.publisher = None;
        let anonymous = enqueue(&broker, anonymous);
        let mut empty = SerializedMessage::new("mailer", ProcessMessage::shell("true"));
        empty.message = None;
        let empty = enqueue(&broker, empty);

        let mut forwarder = forwarder(&broker, registry, 3);
        forwarder.run().await.unwrap();

        assert_eq!(forwarder.runtime().stats().failed, 3);
        for id in [unknown, anonymous, empty] {
            assert_eq!(broker.releases(id), 1);
            assert_eq!(broker.job_status(id), Some(JobStatus::Ready));
        }
        assert_eq!(publisher.calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_problems_fail() {
        let broker = MemoryBroker::new();
        let mut not_starting = ScriptedPublisher::replying(Ok("id-1"));
        not_starting.starts = false;
        let registry = PublisherRegistry::new();
        registry.register("down", not_starting.clone());
        registry.register("empty", ScriptedPublisher::replying(Ok("")));
        registry.register("broken", ScriptedPublisher::replying(Err("queue full")));

        let ids: Vec<u64> = ["down", "empty", "broken"]
            .into_iter()
            .map(|name| enqueue(&broker, SerializedMessage::new(name, ProcessMessage::shell("true"))))
            .collect();

        let mut forwarder = forwarder(&broker, registry, 3);
        forwarder.run().await.unwrap();

        assert_eq!(forwarder.runtime().stats().failed, 3);
        assert_eq!(not_starting.calls(), 0);
        for id in ids {
            assert_eq!(broker.releases(id), 1);
        }
    }

    #[tokio::test]
    async fn test_foreign_and_undecodable_commit() {
        let broker = MemoryBroker::new();
        let garbage = broker.put(QUEUE, 0, b"\xff\xff\xff\xff");
        let process = enqueue(&broker, ProcessMessage::shell("true"));

        let mut forwarder = forwarder(&broker, PublisherRegistry::new(), 2);
        forwarder.run().await.unwrap();

        assert_eq!(forwarder.runtime().stats().committed, 2);
        assert_eq!(broker.releases(garbage) + broker.releases(process), 0);
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_forwards_through_queue_publisher() {
        let broker = MemoryBroker::new();
        let registry = PublisherRegistry::new();
        registry.register(
            "process",
            QueuePublisher::new(
                BeanstalkAdapter::with_client(broker.connection()),
                Endpoint::default(),
                "process",
            ),
        );

        let nested = Message::from(ProcessMessage::shell("true"));
        enqueue(&broker, SerializedMessage::new("process", nested.clone()));
        forwarder(&broker, registry, 1).run().await.unwrap();

        assert_eq!(broker.ready_count(QUEUE), 0);
        assert_eq!(broker.ready_count("process"), 1);
        assert_eq!(broker.len(), 1);
    }
}
