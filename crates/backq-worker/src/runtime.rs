//! Lease/acknowledge protocol shared by every worker.
//!
//! A worker drives the runtime with a loop of [`WorkerRuntime::next`] calls.
//! Each call yields either a [`JobLease`], which must be handed back through
//! [`WorkerRuntime::acknowledge`], or an [`IdleLease`] for an empty poll,
//! handed back through [`WorkerRuntime::settle_idle`]. The runtime refuses to
//! lease again while a previous lease is unsettled, so every job gets at most
//! one ack decision before the next lease on the connection.

use crate::config::RuntimeConfig;
use crate::{Result, WorkerError};
use backq_adapter::{Endpoint, QueueAdapter};
use backq_core::{JobId, WorkOutcome};
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A leased job awaiting its outcome
#[derive(Debug)]
pub struct JobLease {
    id: JobId,
    payload: Vec<u8>,
}

impl JobLease {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// An empty poll awaiting its outcome
#[derive(Debug)]
pub struct IdleLease {
    _private: (),
}

#[derive(Debug)]
pub enum Lease {
    Job(JobLease),
    Idle(IdleLease),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outstanding {
    Job(JobId),
    Idle,
}

impl fmt::Display for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outstanding::Job(id) => write!(f, "job {}", id),
            Outstanding::Idle => write!(f, "idle cycle"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub leased: u64,
    pub committed: u64,
    pub failed: u64,
    pub deferred: u64,
    pub idle_cycles: u64,
}

impl RuntimeStats {
    pub fn settled(&self) -> u64 {
        self.committed + self.failed + self.deferred
    }
}

pub struct WorkerRuntime<A: QueueAdapter> {
    adapter: A,
    endpoint: Endpoint,
    queue: String,
    config: RuntimeConfig,
    cancel: CancellationToken,
    outstanding: Option<Outstanding>,
    stats: RuntimeStats,
    last_job: Instant,
    poll_failed: bool,
    started: bool,
    finished: bool,
}

impl<A: QueueAdapter> WorkerRuntime<A> {
    pub fn new(adapter: A, endpoint: Endpoint, queue: impl Into<String>, config: RuntimeConfig) -> Self {
        WorkerRuntime {
            adapter,
            endpoint,
            queue: queue.into(),
            config,
            cancel: CancellationToken::new(),
            outstanding: None,
            stats: RuntimeStats::default(),
            last_job: Instant::now(),
            poll_failed: false,
            started: false,
            finished: false,
        }
    }

    /// Stop leasing once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    /// Connect and subscribe to the queue. Returns whether the worker may proceed.
    pub async fn start(&mut self) -> bool {
        if self.started {
            return true;
        }

        self.adapter.set_work_timeout(Some(self.config.work_timeout()));
        if self.adapter.connect(&self.endpoint).await.is_err() {
            warn!("Could not connect to {} at {}", self.adapter.name(), self.endpoint.address());
            return false;
        }
        if self.adapter.bind_read(&self.queue).await.is_err() {
            warn!("Could not subscribe to queue {}", self.queue);
            let _ = self.adapter.disconnect().await;
            return false;
        }

        info!(
            "Worker leasing from queue {} on {} at {}",
            self.queue,
            self.adapter.name(),
            self.endpoint.address()
        );
        self.started = true;
        self.finished = false;
        self.last_job = Instant::now();
        true
    }

    /// Lease the next job. `Ok(None)` means the worker should stop.
    ///
    /// A failed lease request counts as an empty poll, the adapter has
    /// already logged it. The runtime then tries one reconnect, and the
    /// idle cycle backs off since nothing waited at the broker.
    pub async fn next(&mut self) -> Result<Option<Lease>> {
        if !self.started || self.finished {
            return Err(WorkerError::NotStarted);
        }
        if let Some(outstanding) = self.outstanding {
            return Err(WorkerError::UnsettledLease(outstanding.to_string()));
        }
        if self.should_stop() {
            return Ok(None);
        }

        let cancel = self.cancel.clone();
        let picked = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            picked = self.adapter.pick_task() => picked,
        };

        self.poll_failed = picked.is_err();
        match picked {
            Ok(Some(job)) => {
                debug!("Leased job {} ({} bytes)", job.id, job.payload.len());
                self.stats.leased += 1;
                self.last_job = Instant::now();
                self.outstanding = Some(Outstanding::Job(job.id));
                Ok(Some(Lease::Job(JobLease {
                    id: job.id,
                    payload: job.payload,
                })))
            }
            Ok(None) | Err(_) => {
                if self.poll_failed {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = self.adapter.ping(true) => {}
                    }
                }
                self.stats.idle_cycles += 1;
                self.outstanding = Some(Outstanding::Idle);
                Ok(Some(Lease::Idle(IdleLease { _private: () })))
            }
        }
    }

    /// Translate a job's outcome into its ack
    pub async fn acknowledge(&mut self, lease: JobLease, outcome: WorkOutcome) -> Result<()> {
        match self.outstanding {
            Some(Outstanding::Job(id)) if id == lease.id => self.outstanding = None,
            _ => return Err(WorkerError::UnknownLease(Outstanding::Job(lease.id).to_string())),
        }

        debug!("Job {} settled: {}", lease.id, outcome.as_str());
        match outcome {
            WorkOutcome::Commit => {
                self.stats.committed += 1;
                // Failed acks are logged by the adapter; TTR expiry redelivers
                let _ = self.adapter.after_work_success(lease.id).await;
            }
            WorkOutcome::Fail => {
                self.stats.failed += 1;
                let _ = self.adapter.after_work_failed(lease.id).await;
            }
            WorkOutcome::Defer => {
                self.stats.deferred += 1;
            }
        }
        Ok(())
    }

    /// Outcome an empty poll resumes with: the lease request already waited
    /// when a work timeout is set and the broker answered, otherwise back off
    /// before polling again.
    pub fn idle_outcome(&self) -> WorkOutcome {
        if self.config.work_timeout_secs > 0 && !self.poll_failed {
            WorkOutcome::Commit
        } else {
            WorkOutcome::Fail
        }
    }

    pub async fn settle_idle(&mut self, _lease: IdleLease, outcome: WorkOutcome) -> Result<()> {
        match self.outstanding {
            Some(Outstanding::Idle) => self.outstanding = None,
            _ => return Err(WorkerError::UnknownLease(Outstanding::Idle.to_string())),
        }

        if outcome == WorkOutcome::Fail {
            let backoff = self.config.idle_backoff();
            debug!("No job available, backing off for {:?}", backoff);
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
        }
        Ok(())
    }

    /// Disconnect and release resources. Safe to call more than once.
    pub async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(Outstanding::Job(id)) = self.outstanding.take() {
            warn!("Stopping with job {} unsettled, it returns to the queue after its TTR", id);
        }
        if self.started {
            let _ = self.adapter.disconnect().await;
            self.started = false;
        }

        let stats = self.stats;
        info!(
            "Worker finished: {} leased, {} committed, {} failed, {} deferred, {} idle",
            stats.leased, stats.committed, stats.failed, stats.deferred, stats.idle_cycles
        );
    }

    fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            info!("Shutdown requested, stopping worker");
            return true;
        }
        if self.config.restart_threshold > 0 && self.stats.settled() >= self.config.restart_threshold {
            info!("Settled {} jobs, stopping worker for restart", self.stats.settled());
            return true;
        }
        if let Some(max_idle) = self.config.max_idle() {
            if self.last_job.elapsed() >= max_idle {
                info!("No job for {:?}, stopping worker", max_idle);
                return true;
            }
        }
        false
    }
}

impl<A: QueueAdapter> Drop for WorkerRuntime<A> {
    fn drop(&mut self) {
        if self.started && !self.finished {
            warn!("Worker runtime dropped without finish()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backq_adapter::memory::JobStatus;
    use std::time::Duration;
    use backq_adapter::{BeanstalkAdapter, MemoryBroker, MemoryConnection};

    const QUEUE: &str = "process";

    fn polling() -> RuntimeConfig {
        RuntimeConfig {
            work_timeout_secs: 0,
            idle_backoff_ms: 10,
            ..RuntimeConfig::default()
        }
    }

    fn runtime(broker: &MemoryBroker, config: RuntimeConfig) -> WorkerRuntime<BeanstalkAdapter<MemoryConnection>> {
        WorkerRuntime::new(
            BeanstalkAdapter::with_client(broker.connection()),
            Endpoint::default(),
            QUEUE,
            config,
        )
    }

    fn expect_job(lease: Option<Lease>) -> JobLease {
        match lease {
            Some(Lease::Job(job)) => job,
            other => panic!("expected a job lease, got {:?}", other),
        }
    }

    fn expect_idle(lease: Option<Lease>) -> IdleLease {
        match lease {
            Some(Lease::Idle(idle)) => idle,
            other => panic!("expected an idle lease, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_next_requires_start() {
        let broker = MemoryBroker::new();
        let mut runtime = runtime(&broker, polling());
        assert!(matches!(runtime.next().await, Err(WorkerError::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_fails_without_broker() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let mut runtime = runtime(&broker, polling());
        assert!(!runtime.start().await);
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_commit_fail_defer() {
        let broker = MemoryBroker::new();
        let committed = broker.put(QUEUE, 1, b"commit");
        let failed = broker.put(QUEUE, 2, b"fail");
        let deferred = broker.put(QUEUE, 3, b"defer");

        let mut runtime = runtime(&broker, polling());
        assert!(runtime.start().await);

        let job = expect_job(runtime.next().await.unwrap());
        assert_eq!(job.id().value(), committed);
        assert_eq!(job.payload(), b"commit");
        runtime.acknowledge(job, WorkOutcome::Commit).await.unwrap();
        assert_eq!(broker.job_status(committed), None);

        let job = expect_job(runtime.next().await.unwrap());
        runtime.acknowledge(job, WorkOutcome::Fail).await.unwrap();
        assert_eq!(broker.job_status(failed), Some(JobStatus::Ready));
        assert_eq!(broker.releases(failed), 1);

        // Released with the default release priority, so it now queues behind
        let job = expect_job(runtime.next().await.unwrap());
        assert_eq!(job.id().value(), deferred);
        runtime.acknowledge(job, WorkOutcome::Defer).await.unwrap();
        assert_eq!(broker.job_status(deferred), Some(JobStatus::Reserved));
        assert_eq!(broker.releases(deferred), 0);

        let job = expect_job(runtime.next().await.unwrap());
        assert_eq!(job.id().value(), failed);
        runtime.acknowledge(job, WorkOutcome::Commit).await.unwrap();

        let stats = runtime.stats();
        assert_eq!(stats.leased, 4);
        assert_eq!(stats.committed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.deferred, 1);

        runtime.finish().await;
        // Disconnecting hands the deferred job back to the broker
        assert_eq!(broker.job_status(deferred), Some(JobStatus::Ready));
    }

    #[tokio::test]
    async fn test_unsettled_lease_blocks_next() {
        let broker = MemoryBroker::new();
        broker.put(QUEUE, 1024, b"a");
        broker.put(QUEUE, 1024, b"b");

        let mut runtime = runtime(&broker, polling());
        assert!(runtime.start().await);

        let job = expect_job(runtime.next().await.unwrap());
        assert!(matches!(runtime.next().await, Err(WorkerError::UnsettledLease(_))));
        runtime.acknowledge(job, WorkOutcome::Commit).await.unwrap();
        assert!(runtime.next().await.unwrap().is_some());
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_foreign_lease_rejected() {
        let broker = MemoryBroker::new();
        broker.put(QUEUE, 1024, b"a");

        let mut first = runtime(&broker, polling());
        let mut second = runtime(&broker, polling());
        assert!(first.start().await);
        assert!(second.start().await);

        let job = expect_job(first.next().await.unwrap());
        let idle = expect_idle(second.next().await.unwrap());
        assert!(matches!(
            second.acknowledge(job, WorkOutcome::Commit).await,
            Err(WorkerError::UnknownLease(_))
        ));
        second.settle_idle(idle, WorkOutcome::Commit).await.unwrap();

        first.finish().await;
        second.finish().await;
    }

    #[tokio::test]
    async fn test_idle_outcome_follows_work_timeout() {
        let broker = MemoryBroker::new();
        assert_eq!(runtime(&broker, polling()).idle_outcome(), WorkOutcome::Fail);
        assert_eq!(
            runtime(&broker, RuntimeConfig::default()).idle_outcome(),
            WorkOutcome::Commit
        );
    }

    #[tokio::test]
    async fn test_idle_fail_backs_off() {
        let broker = MemoryBroker::new();
        let mut runtime = runtime(&broker, polling());
        assert!(runtime.start().await);

        let started = std::time::Instant::now();
        let idle = expect_idle(runtime.next().await.unwrap());
        let outcome = runtime.idle_outcome();
        runtime.settle_idle(idle, outcome).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(runtime.stats().idle_cycles, 1);
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_restart_threshold_stops_runtime() {
        let broker = MemoryBroker::new();
        for _ in 0..3 {
            broker.put(QUEUE, 1024, b"job");
        }

        let config = RuntimeConfig {
            restart_threshold: 2,
            ..polling()
        };
        let mut runtime = runtime(&broker, config);
        assert!(runtime.start().await);

        let mut settled = 0;
        while let Some(lease) = runtime.next().await.unwrap() {
            match lease {
                Lease::Job(job) => {
                    runtime.acknowledge(job, WorkOutcome::Commit).await.unwrap();
                    settled += 1;
                }
                Lease::Idle(idle) => runtime.settle_idle(idle, WorkOutcome::Fail).await.unwrap(),
            }
        }
        assert_eq!(settled, 2);
        assert_eq!(broker.len(), 1);
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_max_idle_stops_runtime() {
        let broker = MemoryBroker::new();
        let config = RuntimeConfig {
            max_idle_secs: Some(0),
            ..polling()
        };
        let mut runtime = runtime(&broker, config);
        assert!(runtime.start().await);
        assert!(runtime.next().await.unwrap().is_none());
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_lease_request() {
        let broker = MemoryBroker::new();
        let config = RuntimeConfig {
            work_timeout_secs: 30,
            ..RuntimeConfig::default()
        };
        let cancel = CancellationToken::new();
        let mut runtime = runtime(&broker, config).with_cancellation(cancel.clone());
        assert!(runtime.start().await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        assert!(runtime.next().await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_transport_error_is_idle_cycle() {
        let broker = MemoryBroker::new();
        let mut runtime = runtime(&broker, polling());
        assert!(runtime.start().await);

        broker.set_offline(true);
        let idle = expect_idle(runtime.next().await.unwrap());
        runtime.settle_idle(idle, WorkOutcome::Commit).await.unwrap();
        assert_eq!(runtime.stats().idle_cycles, 1);
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_lost_connection_backs_off_and_reconnects() {
        let broker = MemoryBroker::new();
        let config = RuntimeConfig {
            idle_backoff_ms: 50,
            ..RuntimeConfig::default()
        };
        let mut runtime = runtime(&broker, config);
        assert!(runtime.start().await);
        assert_eq!(runtime.idle_outcome(), WorkOutcome::Commit);

        broker.set_offline(true);
        let started = std::time::Instant::now();
        while started.elapsed() < Duration::from_millis(200) {
            let idle = expect_idle(runtime.next().await.unwrap());
            let outcome = runtime.idle_outcome();
            assert_eq!(outcome, WorkOutcome::Fail);
            runtime.settle_idle(idle, outcome).await.unwrap();
        }
        let cycles = runtime.stats().idle_cycles;
        assert!(cycles <= 5, "{} idle cycles in 200ms while offline", cycles);

        // Back online: a reconnect restores the subscription
        broker.set_offline(false);
        let id = broker.put(QUEUE, 1024, b"after");
        let mut leased = None;
        for _ in 0..3 {
            match runtime.next().await.unwrap() {
                Some(Lease::Job(job)) => {
                    leased = Some(job);
                    break;
                }
                Some(Lease::Idle(idle)) => {
                    let outcome = runtime.idle_outcome();
                    runtime.settle_idle(idle, outcome).await.unwrap();
                }
                None => panic!("runtime stopped while reconnecting"),
            }
        }
        let job = leased.expect("no job leased after reconnecting");
        assert_eq!(job.id().value(), id);
        runtime.acknowledge(job, WorkOutcome::Commit).await.unwrap();
        assert_eq!(runtime.idle_outcome(), WorkOutcome::Commit);
        assert_eq!(broker.job_status(id), None);
        runtime.finish().await;
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let broker = MemoryBroker::new();
        let mut runtime = runtime(&broker, polling());
        assert!(runtime.start().await);
        runtime.finish().await;
        runtime.finish().await;
        assert_eq!(broker.connection_count(), 0);
        assert!(matches!(runtime.next().await, Err(WorkerError::NotStarted)));
    }
}
