use crate::config::ProcessConfig;
use crate::process::{LaunchSpec, ManagedProcess, ProcessArena};
use crate::runtime::{Lease, WorkerRuntime};
use crate::{Result, WorkerError};
use backq_adapter::QueueAdapter;
use backq_core::{JobId, Message, ProcessMessage, WorkOutcome};
use chrono::Utc;
use std::process::ExitStatus;
use tracing::{debug, info, warn, Instrument, Span};

/// What became of one leased job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decision {
    outcome: WorkOutcome,
    dispatched: bool,
}

impl Decision {
    fn skip(outcome: WorkOutcome) -> Self {
        Decision {
            outcome,
            dispatched: false,
        }
    }

    fn dispatched() -> Self {
        Decision {
            outcome: WorkOutcome::Commit,
            dispatched: true,
        }
    }
}

/// Worker that runs process messages as child processes
pub struct ProcessSupervisor<A: QueueAdapter> {
    runtime: WorkerRuntime<A>,
    config: ProcessConfig,
    arena: ProcessArena,
    span: Span,
}

impl<A: QueueAdapter> ProcessSupervisor<A> {
    pub fn new(runtime: WorkerRuntime<A>, config: ProcessConfig, span: Span) -> Self {
        ProcessSupervisor {
            runtime,
            config,
            arena: ProcessArena::new(),
            span,
        }
    }

    pub fn runtime(&self) -> &WorkerRuntime<A> {
        &self.runtime
    }

    /// Number of children still tracked
    pub fn tracked(&self) -> usize {
        self.arena.len()
    }

    /// Lease and launch until the runtime stops, then stop every child.
    pub async fn run(&mut self) -> Result<()> {
        let span = self.span.clone();
        async {
            if !self.runtime.start().await {
                self.runtime.finish().await;
                return Err(WorkerError::NotStarted);
            }

            let result = self.work().await;
            if let Err(e) = &result {
                warn!("Process worker stopped: {}", e);
            }

            self.shutdown().await;
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
                    self.reap().await;
                    let outcome = self.runtime.idle_outcome();
                    self.runtime.settle_idle(idle, outcome).await?;
                }
                Lease::Job(job) => {
                    let id = job.id();
                    let decision = self.handle(id, job.payload()).await;
                    self.runtime.acknowledge(job, decision.outcome).await?;

                    if decision.dispatched && decision.outcome != WorkOutcome::Commit {
                        return Err(WorkerError::Unreliable(id));
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(&mut self, id: JobId, payload: &[u8]) -> Decision {
        let message = match Message::from_bytes(payload) {
            Ok(Message::Process(message)) => message,
            Ok(other) => {
                warn!("Job {} carries a {} message, dropping it", id, other.kind());
                self.reap().await;
                return Decision::skip(WorkOutcome::Commit);
            }
            Err(e) => {
                warn!("Job {} has an undecodable payload, dropping it: {}", id, e);
                self.reap().await;
                return Decision::skip(WorkOutcome::Commit);
            }
        };

        let now = Utc::now();
        if message.is_past_deadline(now) {
            info!("Job {} missed its deadline, dropping it", id);
            self.reap().await;
            return Decision::skip(WorkOutcome::Commit);
        }
        if !message.is_ready(now) {
            debug!("Job {} is not ready yet", id);
            return Decision::skip(WorkOutcome::Defer);
        }
        if message.is_expired(now) {
            info!("Job {} expired, not running it", id);
            return Decision::skip(WorkOutcome::Commit);
        }

        let spec = LaunchSpec::from_message(&message, &self.config);
        self.reap().await;
        self.launch(id, &message, spec).await;
        Decision::dispatched()
    }

    async fn launch(&mut self, id: JobId, message: &ProcessMessage, spec: LaunchSpec) {
        let process = match spec.spawn() {
            Ok(process) => process,
            Err(e) => {
                warn!("Job {} could not start {}: {}", id, message.commandline, e);
                return;
            }
        };

        let slot = self.arena.insert(process);
        debug!("Job {} running in slot {}", id, slot);
    }

    /// Enforce timeouts on running children, then collect every finished one
    async fn reap(&mut self) {
        for slot in self.arena.occupied() {
            let Some(process) = self.arena.get_mut(slot) else {
                continue;
            };

            if process.is_running() {
                if process.check_timeout() {
                    warn!("Process {} exceeded its timeout and was killed", process.commandline());
                }
                tokio::time::sleep(self.config.reap_poll_interval()).await;
            }
        }

        // Children that exit during the sleeps above are collected here too
        self.collect().await;
        if !self.arena.within_budget() {
            self.collect().await;
        }
    }

    /// Read the exit state of each finished child exactly once and free its slot
    async fn collect(&mut self) {
        for slot in self.arena.occupied() {
            let Some(process) = self.arena.get_mut(slot) else {
                continue;
            };
            if process.is_running() {
                continue;
            }

            process.settle_output().await;
            if let Some(status) = process.take_exit() {
                report_exit(process, status);
            }
            process.clear_output();
            self.arena.reap(slot);
        }
    }

    /// Interrupt every tracked child, escalating to a kill, and wait for all of them
    async fn shutdown(&mut self) {
        let slots = self.arena.occupied();
        if !slots.is_empty() {
            info!("Stopping {} tracked processes", slots.len());
        }

        for slot in slots {
            let Some(mut process) = self.arena.reap(slot) else {
                continue;
            };

            if process.is_running() {
                process.check_timeout();
                tokio::time::sleep(self.config.shutdown_poll_interval()).await;
                process.clear_output();
            }
            if let Err(e) = process.terminate(self.config.stop_grace()).await {
                warn!("Could not stop process {}: {}", process.commandline(), e);
            }
        }
    }
}

fn report_exit(process: &ManagedProcess, status: ExitStatus) {
    if let Some(code) = status.code() {
        if code != 0 {
            warn!(
                "Process {} exited with code {}: {}",
                process.commandline(),
                code,
                String::from_utf8_lossy(&process.stderr()).trim_end()
            );
        }
        return;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            warn!("Process {} was terminated by signal {}", process.commandline(), signal);
            return;
        }
    }
    warn!("Process {} ended with {}", process.commandline(), status);
}
