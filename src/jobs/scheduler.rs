use super::{JobKind, JobRegistry};
use crate::error::{Result, UpdateError};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Executes one job. Lines passed to `log` land in the job's output.
pub trait JobHandler: Send + Sync {
    fn handle(&self, kind: &JobKind, log: &mut dyn FnMut(&str)) -> Result<()>;
}

/// Cloneable producer side of the queue.
#[derive(Clone)]
pub struct JobSubmitter {
    registry: Arc<JobRegistry>,
    queue: Sender<u64>,
}

impl JobSubmitter {
    pub fn submit(&self, kind: JobKind) -> Result<u64> {
        let seq = self.registry.register(kind);
        if self.queue.send(seq).is_err() {
            self.registry.finish(seq);
            return Err(UpdateError::InvalidInput("Job scheduler is not running".into()));
        }
        Ok(seq)
    }
}

/// Single-consumer FIFO job queue.
///
/// One worker thread claims and runs jobs in submission order, one at a time, so at
/// most one configuration mutation is ever in flight. A failing or panicking job is
/// recorded in its output and the worker moves on.
pub struct JobScheduler {
    registry: Arc<JobRegistry>,
    submitter: Option<JobSubmitter>,
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn start(handler: Arc<dyn JobHandler>) -> Result<Self> {
        let registry = Arc::new(JobRegistry::new());
        let (queue_tx, queue_rx) = unbounded::<u64>();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();

        let worker_registry = registry.clone();
        let worker = thread::Builder::new()
            .name("stackbump-jobs".into())
            .spawn(move || consume(&worker_registry, handler.as_ref(), &queue_rx, &shutdown_rx))?;

        Ok(Self {
            submitter: Some(JobSubmitter {
                registry: registry.clone(),
                queue: queue_tx,
            }),
            registry,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn submitter(&self) -> Result<JobSubmitter> {
        self.submitter
            .clone()
            .ok_or_else(|| UpdateError::InvalidInput("Job scheduler is shutting down".into()))
    }

    pub fn submit(&self, kind: JobKind) -> Result<u64> {
        self.submitter()?.submit(kind)
    }

    /// Close the queue and wait until every job submitted so far has run.
    ///
    /// Blocks until all cloned [`JobSubmitter`]s are dropped as well.
    pub fn drain(mut self) {
        self.submitter = None;
        self.join();
    }

    /// Stop between jobs; queued jobs are abandoned.
    pub fn shutdown(mut self) {
        self.shutdown = None;
        self.join();
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("job worker terminated abnormally");
            }
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown = None;
        self.join();
    }
}

fn consume(registry: &JobRegistry, handler: &dyn JobHandler, queue: &Receiver<u64>, shutdown: &Receiver<()>) {
    info!("job worker started");
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(queue) -> msg => match msg {
                Ok(seq) => run_job(registry, handler, seq),
                Err(_) => break,
            },
        }
    }
    info!("job worker stopped");
}

fn run_job(registry: &JobRegistry, handler: &dyn JobHandler, seq: u64) {
    if !registry.try_claim(seq) {
        warn!(seq, "job already claimed or gone");
        return;
    }
    let Some(job) = registry.get(seq) else {
        return;
    };

    info!(seq, kind = %job.kind, "job started");
    let mut log = |line: &str| registry.append_output(seq, line);
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&job.kind, &mut log)));

    match outcome {
        Ok(Ok(())) => info!(seq, kind = %job.kind, "job finished"),
        Ok(Err(err)) => {
            registry.append_output(seq, &format!("Error: {err}"));
            error!(seq, kind = %job.kind, error = %err, "job failed");
        }
        Err(_) => {
            registry.append_output(seq, "Error: job panicked");
            error!(seq, kind = %job.kind, "job panicked");
        }
    }

    registry.finish(seq);
}
