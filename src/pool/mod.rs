use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, SendError, Sender};
use serde_json::json;

use crate::jobs::{Job, JobHandler};
use crate::logging::{LogLevel, Logger};
use crate::utils::timing::ScopedExecutionTimer;

pub type WorkerId = usize;

#[derive(Debug)]
pub enum PoolError {
    InvalidWorkerCount { provided: usize },
    Spawn { thread: String, source: io::Error },
    JoinFailed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWorkerCount { provided } => {
                write!(f, "worker pool needs at least one worker, got {provided}")
            }
            Self::Spawn { thread, source } => {
                write!(f, "failed to spawn thread '{thread}': {source}")
            }
            Self::JoinFailed => write!(f, "dispatcher control thread join failed"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The control loop is gone; nothing will ever accept the job.
    PoolClosed,
    /// Shutdown began while the job was waiting for an idle worker.
    ShuttingDown,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolClosed => write!(f, "worker pool is closed"),
            Self::ShuttingDown => write!(f, "worker pool is shutting down"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// A worker announcing it can take exactly one job through `intake`.
struct IdleWorker {
    worker_id: WorkerId,
    intake: Sender<Job>,
}

struct Handoff {
    job: Job,
    accepted: Sender<Result<WorkerId, DispatchError>>,
}

struct WorkerSlot {
    worker_id: WorkerId,
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Cloneable submission side of a [`WorkDispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    intake: Sender<Handoff>,
}

impl DispatcherHandle {
    /// Blocks until an idle worker has received `job`.
    ///
    /// Nothing is queued locally: with every worker busy the caller waits, which
    /// is what keeps the consumer from pulling more than the pool can run.
    pub fn submit(&self, job: Job) -> Result<WorkerId, DispatchError> {
        let (accepted_tx, accepted_rx) = bounded(0);
        self.intake
            .send(Handoff {
                job,
                accepted: accepted_tx,
            })
            .map_err(|_| DispatchError::PoolClosed)?;

        accepted_rx.recv().unwrap_or(Err(DispatchError::ShuttingDown))
    }
}

/// Fixed-size worker pool fed through an idle-worker rendezvous.
///
/// Workers put their own intake sender on the idle channel whenever they are
/// free; the control thread pairs each submitted job with the next idle
/// worker. Only the control thread reads the idle channel.
pub struct WorkDispatcher {
    handle: DispatcherHandle,
    worker_count: usize,
    shutdown_signal: Option<Sender<()>>,
    control: Option<JoinHandle<()>>,
    logger: Arc<Logger>,
}

impl WorkDispatcher {
    pub fn spawn(
        worker_count: usize,
        handler: Arc<dyn JobHandler>,
        logger: Arc<Logger>,
    ) -> Result<Self, PoolError> {
        if worker_count == 0 {
            return Err(PoolError::InvalidWorkerCount {
                provided: worker_count,
            });
        }

        let (idle_tx, idle_rx) = unbounded::<IdleWorker>();
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            match spawn_worker(worker_id, idle_tx.clone(), Arc::clone(&handler), Arc::clone(&logger)) {
                Ok(slot) => workers.push(slot),
                Err(error) => {
                    // Disconnecting the stop channels releases the workers already running.
                    drop(idle_rx);
                    for slot in workers {
                        drop(slot.stop);
                        let _ = slot.thread.join();
                    }
                    return Err(error);
                }
            }
        }
        drop(idle_tx);

        let (intake_tx, intake_rx) = bounded::<Handoff>(0);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let control_logger = Arc::clone(&logger);
        let control_name = "jobrelay-dispatcher".to_owned();
        let control = thread::Builder::new()
            .name(control_name.clone())
            .spawn(move || run_control_loop(intake_rx, idle_rx, shutdown_rx, workers, control_logger))
            .map_err(|source| PoolError::Spawn {
                thread: control_name,
                source,
            })?;

        logger.log(
            LogLevel::Info,
            Some("pool::spawn"),
            "Worker pool started",
            Some(json!({ "worker_count": worker_count })),
        );

        Ok(Self {
            handle: DispatcherHandle { intake: intake_tx },
            worker_count,
            shutdown_signal: Some(shutdown_tx),
            control: Some(control),
            logger,
        })
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn submit(&self, job: Job) -> Result<WorkerId, DispatchError> {
        self.handle.submit(job)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stops accepting jobs, lets running jobs finish and joins every thread.
    pub fn shutdown(&mut self) -> Result<(), PoolError> {
        // Dropping the sender disconnects the channel, which the control loop reads as the signal.
        if self.shutdown_signal.take().is_none() {
            return Ok(());
        }

        if let Some(control) = self.control.take() {
            control.join().map_err(|_| PoolError::JoinFailed)?;
        }

        self.logger.info(Some("pool::shutdown"), "Worker pool stopped");
        Ok(())
    }
}

impl Drop for WorkDispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn spawn_worker(
    worker_id: WorkerId,
    idle: Sender<IdleWorker>,
    handler: Arc<dyn JobHandler>,
    logger: Arc<Logger>,
) -> Result<WorkerSlot, PoolError> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let name = format!("jobrelay-worker-{worker_id}");

    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_worker(worker_id, idle, stop_rx, handler, logger))
        .map_err(|source| PoolError::Spawn {
            thread: name,
            source,
        })?;

    Ok(WorkerSlot {
        worker_id,
        stop: stop_tx,
        thread,
    })
}

fn run_worker(
    worker_id: WorkerId,
    idle: Sender<IdleWorker>,
    stop: Receiver<()>,
    handler: Arc<dyn JobHandler>,
    logger: Arc<Logger>,
) {
    let (intake_tx, intake_rx) = bounded::<Job>(0);

    loop {
        let announced = idle.send(IdleWorker {
            worker_id,
            intake: intake_tx.clone(),
        });
        if announced.is_err() {
            break;
        }

        select! {
            recv(stop) -> _ => break,
            recv(intake_rx) -> job => match job {
                Ok(job) => run_job(worker_id, &job, handler.as_ref(), &logger),
                Err(_) => break,
            },
        }
    }

    logger.log(
        LogLevel::Debug,
        Some("pool::worker"),
        "Worker exiting",
        Some(json!({ "worker_id": worker_id })),
    );
}

fn run_job(worker_id: WorkerId, job: &Job, handler: &dyn JobHandler, logger: &Logger) {
    let task_name = format!("job {} on worker {worker_id}", job.job_id);
    let _timer = ScopedExecutionTimer::new(&task_name, Some("pool::worker"), logger);

    match catch_unwind(AssertUnwindSafe(|| handler.process(job))) {
        Ok(Ok(())) => logger.log(
            LogLevel::Info,
            Some("pool::worker"),
            "Job completed",
            Some(json!({ "worker_id": worker_id, "job_id": job.job_id })),
        ),
        Ok(Err(error)) => logger.log(
            LogLevel::Error,
            Some("pool::worker"),
            "Job failed",
            Some(json!({
                "worker_id": worker_id,
                "job_id": job.job_id,
                "error": error.to_string()
            })),
        ),
        Err(_) => logger.log(
            LogLevel::Error,
            Some("pool::worker"),
            "Job handler panicked",
            Some(json!({ "worker_id": worker_id, "job_id": job.job_id })),
        ),
    }
}

fn run_control_loop(
    intake: Receiver<Handoff>,
    idle: Receiver<IdleWorker>,
    shutdown: Receiver<()>,
    workers: Vec<WorkerSlot>,
    logger: Arc<Logger>,
) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(intake) -> handoff => {
                let Ok(handoff) = handoff else {
                    break;
                };
                let result = hand_to_idle_worker(handoff.job, &idle, &shutdown);
                if let Err(error) = &result {
                    logger.log(
                        LogLevel::Warn,
                        Some("pool::dispatch"),
                        "Job not handed to a worker",
                        Some(json!({ "error": error.to_string() })),
                    );
                }
                let _ = handoff.accepted.send(result);
            },
        }
    }

    // Refuse new handoffs before waiting on workers.
    drop(intake);
    for slot in &workers {
        let _ = slot.stop.try_send(());
    }
    drop(idle);

    for slot in workers {
        if slot.thread.join().is_err() {
            logger.log(
                LogLevel::Error,
                Some("pool::shutdown"),
                "Worker thread join failed",
                Some(json!({ "worker_id": slot.worker_id })),
            );
        }
    }
}

fn hand_to_idle_worker(
    mut job: Job,
    idle: &Receiver<IdleWorker>,
    shutdown: &Receiver<()>,
) -> Result<WorkerId, DispatchError> {
    loop {
        let worker = select! {
            recv(shutdown) -> _ => return Err(DispatchError::ShuttingDown),
            recv(idle) -> worker => worker.map_err(|_| DispatchError::PoolClosed)?,
        };

        // A worker that exited since announcing itself hands the job back.
        match worker.intake.send(job) {
            Ok(()) => return Ok(worker.worker_id),
            Err(SendError(returned)) => job = returned,
        }
    }
}
