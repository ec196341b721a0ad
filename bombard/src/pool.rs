use std::{any::Any, fmt::Display, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, future::join_all};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use typed_builder::TypedBuilder;

/// Jobs waiting in the queue plus jobs a worker has dequeued but not finished.
///
/// Both counters live in one watch value so a drain is observed atomically:
/// a job that submits children bumps `queued` before its own `in_flight`
/// slot is released, and the pair never reads `(0, 0)` in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    pub queued: usize,
    pub in_flight: usize,
}

impl Backlog {
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }
}

struct Queue<J> {
    tx: mpsc::UnboundedSender<J>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<J>>>,
}

impl<J> Default for Queue<J> {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Fixed-size set of tokio workers pulling jobs from one unbounded queue.
///
/// - [`WorkerPool::submit`] never blocks and may be called from inside a job.
/// - [`WorkerPool::start`] spawns the workers and returns once the backlog drains.
/// - [`WorkerPool::stop`] signals the workers and joins them.
///
/// A job that returns an error or panics is logged and still counts as done.
#[derive(TypedBuilder)]
pub struct WorkerPool<J> {
    #[builder(default = 10)]
    pub workers: usize,
    #[builder(default, setter(skip))]
    queue: Queue<J>,
    #[builder(default = Arc::new(watch::Sender::new(Backlog::default())), setter(skip))]
    backlog: Arc<watch::Sender<Backlog>>,
    #[builder(default = watch::Sender::new(false), setter(skip))]
    shutdown: watch::Sender<bool>,
    #[builder(default, setter(skip))]
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<J> WorkerPool<J>
where
    J: Send + 'static,
{
    /// Enqueue a job.
    pub fn submit(&self, job: J) {
        self.backlog.send_modify(|b| b.queued += 1);
        if self.queue.tx.send(job).is_err() {
            // The receiver lives as long as the pool, so this only happens
            // while the pool itself is being torn down.
            self.backlog.send_modify(|b| b.queued -= 1);
            tracing::warn!("Job submitted to a closed queue was dropped");
        }
    }

    pub fn backlog(&self) -> Backlog {
        *self.backlog.borrow()
    }

    /// Spawn the workers and wait until every queued job, including the jobs
    /// those jobs submit, has finished.
    pub async fn start<F, Fut, E>(&self, worker_fn: F)
    where
        F: Fn(J) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        // A previous `stop` leaves the signal raised
        self.shutdown.send_replace(false);
        tracing::info!("Spawning {} workers...", self.workers);
        let handles: Vec<_> = (0..self.workers)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    self.queue.rx.clone(),
                    self.backlog.clone(),
                    self.shutdown.subscribe(),
                    worker_fn.clone(),
                ))
            })
            .collect();
        self.handles.lock().extend(handles);

        let mut backlog = self.backlog.subscribe();
        if backlog.wait_for(Backlog::is_drained).await.is_err() {
            tracing::warn!("Backlog channel closed before the queue drained");
            return;
        }
        tracing::info!("Queue drained");
    }

    /// Signal the workers to exit and wait for them.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock());
        for res in join_all(handles).await {
            if let Err(e) = res {
                tracing::error!("Worker task failed: {e}");
            }
        }
        tracing::info!("Workers stopped");
    }
}

async fn worker_loop<J, F, Fut, E>(
    worker: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<J>>>,
    backlog: Arc<watch::Sender<Backlog>>,
    mut shutdown: watch::Receiver<bool>,
    worker_fn: F,
) where
    F: Fn(J) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    loop {
        let job = tokio::select! {
            _ = shutdown.wait_for(|s| *s) => break,
            job = async { queue.lock().await.recv().await } => job,
        };
        let Some(job) = job else { break };
        backlog.send_modify(|b| {
            b.queued -= 1;
            b.in_flight += 1;
        });

        match AssertUnwindSafe(async { worker_fn(job).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(worker, "Job failed: {e}"),
            Err(panic) => tracing::error!(worker, "Job panicked: {}", panic_message(&panic)),
        }

        backlog.send_modify(|b| b.in_flight -= 1);
    }
    tracing::debug!(worker, "Worker exiting");
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
