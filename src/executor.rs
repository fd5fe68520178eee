use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

/// Output of one job, tagged with the ticket it was submitted under.
#[derive(Debug)]
pub struct Completed<R> {
    pub ticket: usize,
    pub output: R,
}

/// Fixed-size worker pool draining a bounded job queue.
///
/// At most `concurrency_limit` jobs run at once. The queue holds no more than
/// one job per worker, so submission is paced by completions rather than by a
/// raw counting primitive.
pub struct HarvesterExecutor {
    workers: usize,
}

/// Handle over a running batch. Dropping it aborts every worker.
pub struct Submission<R> {
    completions: mpsc::Receiver<Completed<R>>,
    tasks: JoinSet<()>,
}

impl<R> Submission<R> {
    /// Next finished job, in completion order. `None` once all workers exit.
    pub async fn next(&mut self) -> Option<Completed<R>> {
        self.completions.recv().await
    }

    /// Reaps the worker tasks, reporting any that panicked.
    pub async fn finish(mut self) -> usize {
        let mut panicked = 0;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
                panicked += 1;
            }
        }
        panicked
    }
}

impl HarvesterExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            workers: concurrency_limit.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queues `items` and starts the workers. Each item is handed to `task`
    /// together with its ticket (its index in `items`).
    #[instrument(skip(self, items, task), fields(items = items.len(), workers = self.workers))]
    pub fn submit<T, R, F, Fut>(&self, items: Vec<T>, task: F) -> Submission<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<(usize, T)>(self.workers);
        let (done_tx, done_rx) = mpsc::channel(self.workers);
        let queue = Arc::new(Mutex::new(job_rx));
        let task = Arc::new(task);
        let mut tasks = JoinSet::new();

        tasks.spawn(async move {
            for (ticket, item) in items.into_iter().enumerate() {
                if job_tx.send((ticket, item)).await.is_err() {
                    break;
                }
            }
        });

        for worker in 0..self.workers {
            let queue = Arc::clone(&queue);
            let task = Arc::clone(&task);
            let done_tx = done_tx.clone();
            tasks.spawn(async move {
                loop {
                    let job = queue.lock().await.recv().await;
                    let Some((ticket, item)) = job else {
                        break;
                    };
                    debug!(worker, ticket, "Job started");
                    let output = task(ticket, item).await;
                    if done_tx.send(Completed { ticket, output }).await.is_err() {
                        break;
                    }
                }
            });
        }

        Submission {
            completions: done_rx,
            tasks,
        }
    }
}
