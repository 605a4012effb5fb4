//! In-process broker with beanstalkd leasing semantics.
//!
//! `MemoryBroker` holds tubes, jobs and leases; every `MemoryConnection`
//! handed out by [`MemoryBroker::connection`] behaves like one beanstalkd
//! client connection. Used by tests and for embedding a worker without a
//! broker daemon.

use async_trait::async_trait;
use backq_protocol::{BrokerClient, ProtocolError, ReservedJob, Result, Stats, DEFAULT_TUBE};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RESERVE_POLL: Duration = Duration::from_millis(5);

/// Observable state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Ready,
    Delayed,
    Reserved,
}

#[derive(Debug, Clone, Copy)]
enum JobState {
    Ready,
    Delayed { until: Instant },
    Reserved { connection: u64, until: Instant },
}

#[derive(Debug, Clone)]
struct MemoryJob {
    tube: String,
    priority: u32,
    ttr: Duration,
    body: Vec<u8>,
    state: JobState,
    reserves: u32,
    releases: u32,
}

#[derive(Debug, Clone)]
struct Session {
    using: String,
    watching: Vec<String>,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            using: DEFAULT_TUBE.to_string(),
            watching: vec![DEFAULT_TUBE.to_string()],
        }
    }
}

#[derive(Default)]
struct BrokerState {
    next_job_id: u64,
    next_connection_id: u64,
    jobs: BTreeMap<u64, MemoryJob>,
    sessions: HashMap<u64, Session>,
    offline: bool,
}

impl BrokerState {
    /// Move delayed jobs whose delay elapsed and leases whose TTR expired back to ready
    fn promote(&mut self, now: Instant) {
        for job in self.jobs.values_mut() {
            match job.state {
                JobState::Delayed { until } | JobState::Reserved { until, .. } if until <= now => {
                    job.state = JobState::Ready;
                }
                _ => {}
            }
        }
    }

    fn release_leases_of(&mut self, connection: u64) {
        for job in self.jobs.values_mut() {
            if let JobState::Reserved { connection: owner, .. } = job.state {
                if owner == connection {
                    job.state = JobState::Ready;
                }
            }
        }
    }

    fn tube_exists(&self, tube: &str) -> bool {
        tube == DEFAULT_TUBE
            || self.jobs.values().any(|job| job.tube == tube)
            || self
                .sessions
                .values()
                .any(|session| session.using == tube || session.watching.iter().any(|t| t == tube))
    }

    fn count(&self, tube: Option<&str>, status: JobStatus) -> u64 {
        self.jobs
            .values()
            .filter(|job| tube.map_or(true, |tube| job.tube == tube))
            .filter(|job| status_of(job.state) == status)
            .count() as u64
    }
}

fn status_of(state: JobState) -> JobStatus {
    match state {
        JobState::Ready => JobStatus::Ready,
        JobState::Delayed { .. } => JobStatus::Delayed,
        JobState::Reserved { .. } => JobStatus::Reserved,
    }
}

/// Shared in-memory broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, not yet connected client connection
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            broker: self.clone(),
            id: None,
        }
    }

    /// Simulate the broker going away. Open connections are dropped on their next request.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Enqueue a job directly, bypassing any connection
    pub fn put(&self, tube: &str, priority: u32, body: &[u8]) -> u64 {
        let mut state = self.state.lock();
        insert_job(&mut state, tube, priority, Duration::ZERO, Duration::from_secs(60), body)
    }

    pub fn job_status(&self, id: u64) -> Option<JobStatus> {
        let mut state = self.state.lock();
        state.promote(Instant::now());
        state.jobs.get(&id).map(|job| status_of(job.state))
    }

    pub fn job_body(&self, id: u64) -> Option<Vec<u8>> {
        self.state.lock().jobs.get(&id).map(|job| job.body.clone())
    }

    pub fn job_priority(&self, id: u64) -> Option<u32> {
        self.state.lock().jobs.get(&id).map(|job| job.priority)
    }

    /// How often a job has been released back by a worker
    pub fn releases(&self, id: u64) -> u32 {
        self.state.lock().jobs.get(&id).map_or(0, |job| job.releases)
    }

    /// How often a job has been leased
    pub fn reserves(&self, id: u64) -> u32 {
        self.state.lock().jobs.get(&id).map_or(0, |job| job.reserves)
    }

    pub fn ready_count(&self, tube: &str) -> u64 {
        let mut state = self.state.lock();
        state.promote(Instant::now());
        state.count(Some(tube), JobStatus::Ready)
    }

    /// Number of jobs still held by the broker, in any state
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

fn insert_job(
    state: &mut BrokerState,
    tube: &str,
    priority: u32,
    delay: Duration,
    ttr: Duration,
    body: &[u8],
) -> u64 {
    state.next_job_id += 1;
    let id = state.next_job_id;
    let job_state = if delay.is_zero() {
        JobState::Ready
    } else {
        JobState::Delayed {
            until: Instant::now() + delay,
        }
    };

    state.jobs.insert(
        id,
        MemoryJob {
            tube: tube.to_string(),
            priority,
            ttr: ttr.max(Duration::from_secs(1)),
            body: body.to_vec(),
            state: job_state,
            reserves: 0,
            releases: 0,
        },
    );
    id
}

/// One client connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: Option<u64>,
}

impl MemoryConnection {
    /// Run `f` against the broker state for this connection's session
    fn session<T>(&mut self, f: impl FnOnce(&mut BrokerState, u64) -> Result<T>) -> Result<T> {
        let id = self.id.ok_or(ProtocolError::NotConnected)?;
        let mut state = self.broker.state.lock();

        if state.offline {
            state.sessions.remove(&id);
            state.release_leases_of(id);
            drop(state);
            self.id = None;
            return Err(ProtocolError::ConnectionClosed);
        }

        state.promote(Instant::now());
        f(&mut state, id)
    }

    fn try_reserve(&mut self) -> Result<Option<ReservedJob>> {
        self.session(|state, connection| {
            let watching = state
                .sessions
                .get(&connection)
                .map(|session| session.watching.clone())
                .unwrap_or_default();

            let next = state
                .jobs
                .iter()
                .filter(|(_, job)| matches!(job.state, JobState::Ready))
                .filter(|(_, job)| watching.contains(&job.tube))
                .min_by_key(|(id, job)| (job.priority, **id))
                .map(|(id, _)| *id);

            Ok(next.and_then(|id| {
                let job = state.jobs.get_mut(&id)?;
                job.state = JobState::Reserved {
                    connection,
                    until: Instant::now() + job.ttr,
                };
                job.reserves += 1;
                Some(ReservedJob {
                    id,
                    body: job.body.clone(),
                })
            }))
        })
    }
}

#[async_trait]
impl BrokerClient for MemoryConnection {
    async fn connect(&mut self, _address: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.broker.state.lock();
        if state.offline {
            return Err(ProtocolError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory broker is offline",
            )));
        }

        if let Some(previous) = self.id.take() {
            state.sessions.remove(&previous);
            state.release_leases_of(previous);
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.sessions.insert(id, Session::default());
        self.id = Some(id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.id.is_some()
    }

    async fn watch(&mut self, tube: &str) -> Result<u32> {
        self.session(|state, connection| {
            let session = state.sessions.entry(connection).or_default();
            if !session.watching.iter().any(|t| t == tube) {
                session.watching.push(tube.to_string());
            }
            Ok(session.watching.len() as u32)
        })
    }

    async fn ignore(&mut self, tube: &str) -> Result<u32> {
        self.session(|state, connection| {
            let session = state.sessions.entry(connection).or_default();
            if session.watching.len() == 1 && session.watching[0] == tube {
                return Err(ProtocolError::Server("NOT_IGNORED".to_string()));
            }
            session.watching.retain(|t| t != tube);
            Ok(session.watching.len() as u32)
        })
    }

    async fn use_tube(&mut self, tube: &str) -> Result<()> {
        self.session(|state, connection| {
            state.sessions.entry(connection).or_default().using = tube.to_string();
            Ok(())
        })
    }

    async fn reserve(&mut self, timeout: Option<Duration>) -> Result<Option<ReservedJob>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(job) = self.try_reserve()? {
                return Ok(Some(job));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL).await;
        }
    }

    async fn put(
        &mut self,
        priority: u32,
        delay: Duration,
        ttr: Duration,
        body: &[u8],
    ) -> Result<u64> {
        self.session(|state, connection| {
            let tube = state
                .sessions
                .get(&connection)
                .map(|session| session.using.clone())
                .unwrap_or_else(|| DEFAULT_TUBE.to_string());
            Ok(insert_job(state, &tube, priority, delay, ttr, body))
        })
    }

    async fn release(&mut self, id: u64, priority: u32, delay: Duration) -> Result<()> {
        self.session(|state, connection| {
            let job = state.jobs.get_mut(&id).ok_or(ProtocolError::NotFound)?;
            match job.state {
                JobState::Reserved { connection: owner, .. } if owner == connection => {
                    job.priority = priority;
                    job.releases += 1;
                    job.state = if delay.is_zero() {
                        JobState::Ready
                    } else {
                        JobState::Delayed {
                            until: Instant::now() + delay,
                        }
                    };
                    Ok(())
                }
                _ => Err(ProtocolError::NotFound),
            }
        })
    }

    async fn delete(&mut self, id: u64) -> Result<()> {
        self.session(|state, connection| {
            let job = state.jobs.get(&id).ok_or(ProtocolError::NotFound)?;
            if let JobState::Reserved { connection: owner, .. } = job.state {
                if owner != connection {
                    return Err(ProtocolError::NotFound);
                }
            }
            state.jobs.remove(&id);
            Ok(())
        })
    }

    async fn stats(&mut self, tube: Option<&str>) -> Result<Stats> {
        self.session(|state, _| {
            let mut stats = Stats::new();
            match tube {
                Some(tube) => {
                    if !state.tube_exists(tube) {
                        return Err(ProtocolError::NotFound);
                    }
                    let watching = state
                        .sessions
                        .values()
                        .filter(|session| session.watching.iter().any(|t| t == tube))
                        .count() as u64;
                    let using = state
                        .sessions
                        .values()
                        .filter(|session| session.using == tube)
                        .count() as u64;

                    stats.insert("name", tube.to_string());
                    stats.insert("current-jobs-ready", state.count(Some(tube), JobStatus::Ready));
                    stats.insert(
                        "current-jobs-reserved",
                        state.count(Some(tube), JobStatus::Reserved),
                    );
                    stats.insert(
                        "current-jobs-delayed",
                        state.count(Some(tube), JobStatus::Delayed),
                    );
                    stats.insert("current-using", using);
                    stats.insert("current-watching", watching);
                }
                None => {
                    stats.insert("current-jobs-ready", state.count(None, JobStatus::Ready));
                    stats.insert("current-jobs-reserved", state.count(None, JobStatus::Reserved));
                    stats.insert("current-connections", state.sessions.len() as u64);
                }
            }
            Ok(stats)
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        let id = self.id.take().ok_or(ProtocolError::NotConnected)?;
        let mut state = self.broker.state.lock();
        state.sessions.remove(&id);
        state.release_leases_of(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(broker: &MemoryBroker) -> MemoryConnection {
        let mut connection = broker.connection();
        connection.connect("memory", Duration::from_secs(1)).await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_put_reserve_delete() {
        let broker = MemoryBroker::new();
        let mut producer = connected(&broker).await;
        let mut consumer = connected(&broker).await;

        producer.use_tube("jobs").await.unwrap();
        let id = producer
            .put(1024, Duration::ZERO, Duration::from_secs(60), b"work")
            .await
            .unwrap();

        // Not watching "jobs" yet
        assert_eq!(consumer.reserve(Some(Duration::ZERO)).await.unwrap(), None);

        consumer.watch("jobs").await.unwrap();
        let job = consumer.reserve(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.body, b"work");
        assert_eq!(broker.job_status(id), Some(JobStatus::Reserved));

        // Only the lease holder may delete a reserved job
        assert!(matches!(producer.delete(id).await, Err(ProtocolError::NotFound)));
        consumer.delete(id).await.unwrap();
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_priority_order() {
        let broker = MemoryBroker::new();
        broker.put(DEFAULT_TUBE, 2048, b"late");
        let urgent = broker.put(DEFAULT_TUBE, 10, b"urgent");

        let mut consumer = connected(&broker).await;
        let job = consumer.reserve(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(job.id, urgent);
    }

    #[tokio::test]
    async fn test_release_and_disconnect_return_jobs() {
        let broker = MemoryBroker::new();
        let first = broker.put(DEFAULT_TUBE, 1024, b"a");
        let second = broker.put(DEFAULT_TUBE, 1024, b"b");

        let mut consumer = connected(&broker).await;
        consumer.reserve(Some(Duration::ZERO)).await.unwrap();
        consumer.release(first, 5, Duration::ZERO).await.unwrap();
        assert_eq!(broker.job_status(first), Some(JobStatus::Ready));
        assert_eq!(broker.job_priority(first), Some(5));
        assert_eq!(broker.releases(first), 1);

        // Releasing a job this connection does not hold is refused
        assert!(matches!(
            consumer.release(second, 5, Duration::ZERO).await,
            Err(ProtocolError::NotFound)
        ));

        consumer.reserve(Some(Duration::ZERO)).await.unwrap();
        consumer.disconnect().await.unwrap();
        assert_eq!(broker.ready_count(DEFAULT_TUBE), 2);
        assert!(matches!(consumer.disconnect().await, Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn test_delayed_job_becomes_ready() {
        let broker = MemoryBroker::new();
        let mut producer = connected(&broker).await;
        let id = producer
            .put(1024, Duration::from_millis(30), Duration::from_secs(60), b"later")
            .await
            .unwrap();

        assert_eq!(broker.job_status(id), Some(JobStatus::Delayed));
        let mut consumer = connected(&broker).await;
        let job = consumer
            .reserve(Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn test_offline_broker_drops_connection() {
        let broker = MemoryBroker::new();
        let mut connection = connected(&broker).await;

        broker.set_offline(true);
        assert!(matches!(
            connection.stats(None).await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(!connection.is_connected());
        assert!(connection.connect("memory", Duration::from_secs(1)).await.is_err());

        broker.set_offline(false);
        assert!(connection.connect("memory", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_tube_stats() {
        let broker = MemoryBroker::new();
        let mut worker = connected(&broker).await;
        worker.watch("jobs").await.unwrap();
        broker.put("jobs", 1024, b"x");

        let stats = worker.stats(Some("jobs")).await.unwrap();
        assert_eq!(stats.get_u64("current-watching"), Some(1));
        assert_eq!(stats.get_u64("current-jobs-ready"), Some(1));
        assert!(matches!(
            worker.stats(Some("nothing-here")).await,
            Err(ProtocolError::NotFound)
        ));
    }
}
