use crate::{AdapterError, Endpoint, QueueAdapter, ReleasePolicy, Result};
use async_trait::async_trait;
use backq_core::{JobId, LeasedJob, PublishOptions};
use backq_protocol::{BeanstalkClient, BrokerClient, DEFAULT_TUBE};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue adapter for beanstalkd-style brokers.
///
/// Generic over the connection so the same leasing logic runs against a
/// real beanstalkd (`BeanstalkClient`) or the in-process `MemoryBroker`.
pub struct BeanstalkAdapter<C: BrokerClient = BeanstalkClient> {
    client: C,
    endpoint: Option<Endpoint>,
    read_queues: Vec<String>,
    default_ignored: bool,
    write_queue: Option<String>,
    work_timeout: Option<Duration>,
    release: ReleasePolicy,
}

impl BeanstalkAdapter<BeanstalkClient> {
    pub fn new() -> Self {
        Self::with_client(BeanstalkClient::default())
    }
}

impl Default for BeanstalkAdapter<BeanstalkClient> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: BrokerClient> BeanstalkAdapter<C> {
    pub fn with_client(client: C) -> Self {
        BeanstalkAdapter {
            client,
            endpoint: None,
            read_queues: Vec::new(),
            default_ignored: false,
            write_queue: None,
            work_timeout: None,
            release: ReleasePolicy::default(),
        }
    }

    pub fn with_release_policy(mut self, release: ReleasePolicy) -> Self {
        self.release = release;
        self
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.release
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.client.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }

    fn persistent(&self) -> bool {
        self.endpoint.as_ref().is_some_and(|endpoint| endpoint.persistent)
    }

    /// Open a fresh connection to the remembered endpoint and restore the
    /// read and write bindings of the previous one.
    async fn reconnect(&mut self) -> Result<()> {
        let endpoint = self.endpoint.clone().ok_or(AdapterError::NotConnected)?;
        info!("Reconnecting to beanstalkd at {}", endpoint.address());

        self.client
            .connect(&endpoint.address(), endpoint.connect_timeout())
            .await?;

        let read_queues = std::mem::take(&mut self.read_queues);
        let write_queue = self.write_queue.take();
        self.default_ignored = false;

        for queue in &read_queues {
            self.watch(queue).await?;
        }
        if let Some(queue) = write_queue {
            self.client.use_tube(&queue).await?;
            self.write_queue = Some(queue);
        }
        Ok(())
    }

    async fn watch(&mut self, queue: &str) -> Result<()> {
        self.client.watch(queue).await?;
        if queue == DEFAULT_TUBE {
            self.default_ignored = false;
        } else if !self.default_ignored {
            self.client.ignore(DEFAULT_TUBE).await?;
            self.default_ignored = true;
        }
        self.read_queues.push(queue.to_string());
        Ok(())
    }

    async fn reserve(&mut self) -> Result<Option<LeasedJob>> {
        self.ensure_connected()?;
        let job = self.client.reserve(self.work_timeout).await?;
        Ok(job.map(|job| LeasedJob::new(JobId::new(job.id), job.body)))
    }

    async fn put(&mut self, payload: &[u8], options: &PublishOptions) -> Result<JobId> {
        self.ensure_connected()?;
        let id = self
            .client
            .put(
                options.priority.value(),
                options.readywait_duration(),
                options.jobttr_duration(),
                payload,
            )
            .await?;
        Ok(JobId::new(id))
    }
}

/// Log an adapter failure where it happens and hand it back as a value
fn logged<T>(operation: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        warn!("beanstalkd {} failed: {}", operation, e);
    }
    result
}

#[async_trait]
impl<C: BrokerClient> QueueAdapter for BeanstalkAdapter<C> {
    fn name(&self) -> &'static str {
        "beanstalkd"
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.endpoint = Some(endpoint.clone());
        self.read_queues.clear();
        self.write_queue = None;
        self.default_ignored = false;

        let result = self
            .client
            .connect(&endpoint.address(), endpoint.connect_timeout())
            .await
            .map_err(AdapterError::from);
        logged("connect", result)
    }

    async fn bind_read(&mut self, queue: &str) -> Result<()> {
        if self.read_queues.iter().any(|q| q == queue) {
            return Ok(());
        }
        let result = match self.ensure_connected() {
            Ok(()) => self.watch(queue).await,
            Err(e) => Err(e),
        };
        logged("watch", result)
    }

    async fn bind_write(&mut self, queue: &str) -> Result<()> {
        if self.write_queue.as_deref() == Some(queue) {
            return Ok(());
        }
        let result = match self.ensure_connected() {
            Ok(()) => self.client.use_tube(queue).await.map_err(AdapterError::from),
            Err(e) => Err(e),
        };
        if result.is_ok() {
            self.write_queue = Some(queue.to_string());
        }
        logged("use", result)
    }

    fn set_work_timeout(&mut self, timeout: Option<Duration>) {
        self.work_timeout = timeout;
    }

    async fn pick_task(&mut self) -> Result<Option<LeasedJob>> {
        let result = match self.reserve().await {
            Err(e) if e.is_transport() && self.persistent() => {
                warn!("beanstalkd reserve failed, retrying once: {}", e);
                match self.reconnect().await {
                    Ok(()) => self.reserve().await,
                    Err(e) => Err(e),
                }
            }
            result => result,
        };

        if let Ok(Some(job)) = &result {
            debug!("Leased job {}", job.id);
        }
        logged("reserve", result)
    }

    async fn put_task(&mut self, payload: &[u8], options: &PublishOptions) -> Result<JobId> {
        let result = match self.put(payload, options).await {
            Err(e) if e.is_transport() && self.persistent() => {
                warn!("beanstalkd put failed, retrying once: {}", e);
                match self.reconnect().await {
                    Ok(()) => self.put(payload, options).await,
                    Err(e) => Err(e),
                }
            }
            result => result,
        };
        logged("put", result)
    }

    async fn after_work_success(&mut self, id: JobId) -> Result<()> {
        let result = match self.ensure_connected() {
            Ok(()) => self.client.delete(id.value()).await.map_err(AdapterError::from),
            Err(e) => Err(e),
        };
        logged("delete", result)
    }

    async fn after_work_failed(&mut self, id: JobId) -> Result<()> {
        let release = self.release;
        let result = match self.ensure_connected() {
            Ok(()) => self
                .client
                .release(id.value(), release.priority.value(), release.delay)
                .await
                .map_err(AdapterError::from),
            Err(e) => Err(e),
        };
        logged("release", result)
    }

    async fn has_workers(&mut self, queue: &str) -> Result<u32> {
        let result = match self.ensure_connected() {
            Ok(()) => match self.client.stats(Some(queue)).await {
                Ok(stats) => stats
                    .get_u64("current-watching")
                    .map(|count| count as u32)
                    .ok_or_else(|| AdapterError::MissingStat("current-watching".to_string())),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        logged("stats-tube", result)
    }

    async fn ping(&mut self, reconnect: bool) -> Result<()> {
        let first = match self.ensure_connected() {
            Ok(()) => self.client.stats(None).await.map(|_| ()).map_err(AdapterError::from),
            Err(e) => Err(e),
        };

        let result = match first {
            Err(e) if reconnect => {
                debug!("beanstalkd ping failed, reconnecting: {}", e);
                match self.reconnect().await {
                    Ok(()) => self.client.stats(None).await.map(|_| ()).map_err(AdapterError::from),
                    Err(e) => Err(e),
                }
            }
            result => result,
        };
        logged("ping", result)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.read_queues.clear();
        self.write_queue = None;
        self.default_ignored = false;

        if !self.client.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        let result = self.client.disconnect().await.map_err(AdapterError::from);
        logged("quit", result)
    }
}
