//! Bounded worker pool for one action name.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::action::RunnableAction;
use crate::database::models::JobDbModel;
use crate::database::repositories::{JobRepository, JobStepRepository};
use crate::worker::action_job::{ActionJob, ActionJobHandle};

pub(crate) struct ActionManager<V> {
    action: Arc<dyn RunnableAction<V>>,
    jobs: Arc<dyn JobRepository>,
    steps: Arc<dyn JobStepRepository>,
    vars: Arc<V>,
    client_id: String,
    pool: Arc<Semaphore>,
    tracker: TaskTracker,
    running: Arc<DashMap<String, ActionJobHandle>>,
    stopped: AtomicBool,
}

impl<V: Send + Sync + 'static> ActionManager<V> {
    pub fn new(
        action: Arc<dyn RunnableAction<V>>,
        jobs: Arc<dyn JobRepository>,
        steps: Arc<dyn JobStepRepository>,
        vars: Arc<V>,
        client_id: String,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            action,
            jobs,
            steps,
            vars,
            client_id,
            pool: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            tracker: TaskTracker::new(),
            running: Arc::new(DashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn action(&self) -> &Arc<dyn RunnableAction<V>> {
        &self.action
    }

    /// Schedule one claimed job. Execution is bounded by the action-level
    /// concurrency limit; excess jobs queue on the pool semaphore.
    pub fn push(&self, job: JobDbModel) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!(job_id = %job.id, "action manager stopped; dropping push");
            return;
        }

        let action = Arc::clone(&self.action);
        let jobs = Arc::clone(&self.jobs);
        let steps = Arc::clone(&self.steps);
        let vars = Arc::clone(&self.vars);
        let client_id = self.client_id.clone();
        let pool = Arc::clone(&self.pool);
        let running = Arc::clone(&self.running);

        self.tracker.spawn(async move {
            let job_id = job.id.clone();
            let (action_job, handle) =
                ActionJob::new(job, action, jobs, steps, vars, client_id);
            // Registered before the pool gate so queued jobs are cancellable.
            running.insert(job_id.clone(), handle);

            let permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    running.remove(&job_id);
                    return;
                }
            };

            if let Err(err) = action_job.run().await {
                debug!(job_id = %job_id, "job run ended with error: {err}");
            }

            running.remove(&job_id);
            drop(permit);
        });
    }

    /// Abort an in-flight job. Returns whether it was found here.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.running.get(job_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every in-flight job.
    pub fn abort_all(&self) {
        for entry in self.running.iter() {
            entry.value().cancel();
        }
    }

    /// Make a stopped manager accept work again.
    pub fn reopen(&self) {
        self.tracker.reopen();
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Stop the pool: no new pushes, abort everything, await per-job
    /// completion.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.abort_all();

        let handles: Vec<_> = self
            .running
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            handle.wait_done().await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!(action = %self.action.name(), "action manager stopped");
    }
}
