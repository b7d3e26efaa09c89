//! One execution of an action handler.
//!
//! The handler runs as its own task and races the action-level cancellation
//! token and the job timeout. Once the outcome is determined the job row is
//! finalised; the handler then keeps running until its step callbacks observe
//! the cancellation, and the step manager is drained before completion is
//! signalled.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::action::{JobError, JobResult, RunEnv, RunnableAction};
use crate::database::models::JobDbModel;
use crate::database::repositories::{JobRepository, JobStepRepository};
use crate::worker::StepManager;

/// Handle to an in-flight action job.
#[derive(Clone)]
pub(crate) struct ActionJobHandle {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ActionJobHandle {
    /// Abort the run.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait until the run has finalised and drained.
    pub async fn wait_done(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

pub(crate) struct ActionJob<V> {
    job: JobDbModel,
    action: Arc<dyn RunnableAction<V>>,
    jobs: Arc<dyn JobRepository>,
    steps: Arc<dyn JobStepRepository>,
    vars: Arc<V>,
    client_id: String,
    token: CancellationToken,
    done_tx: watch::Sender<bool>,
}

enum Outcome {
    Finished(Result<JobResult<String>, tokio::task::JoinError>),
    Cancelled,
    TimedOut,
}

impl<V: Send + Sync + 'static> ActionJob<V> {
    pub fn new(
        job: JobDbModel,
        action: Arc<dyn RunnableAction<V>>,
        jobs: Arc<dyn JobRepository>,
        steps: Arc<dyn JobStepRepository>,
        vars: Arc<V>,
        client_id: String,
    ) -> (Self, ActionJobHandle) {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ActionJobHandle {
            token: token.clone(),
            done: done_rx,
        };
        (
            Self {
                job,
                action,
                jobs,
                steps,
                vars,
                client_id,
                token,
                done_tx,
            },
            handle,
        )
    }

    /// Execute the job to its terminal status. The returned error is for
    /// caller-side logging only; the store already holds the outcome.
    pub async fn run(self) -> JobResult<()> {
        let span = tracing::info_span!(
            "action_job",
            job_id = %self.job.id,
            action = %self.job.action_name
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> JobResult<()> {
        let step_manager = Arc::new(StepManager::new(
            self.job.id.clone(),
            self.client_id.clone(),
            Arc::clone(&self.steps),
            self.action.step_settings(),
            self.token.clone(),
        ));

        let env = RunEnv {
            job_id: self.job.id.clone(),
            group_key: self.job.group_key.clone(),
            vars: Arc::clone(&self.vars),
            steps: Arc::clone(&step_manager),
            cancel: self.token.clone(),
        };

        let timeout = Duration::from_millis(self.job.timeout_ms.max(1) as u64);
        let mut handler = tokio::spawn(self.action.run(self.job.input.clone(), env));

        let outcome = tokio::select! {
            res = &mut handler => Outcome::Finished(res),
            _ = self.token.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        };

        let result: JobResult<()> = match outcome {
            Outcome::Finished(Ok(Ok(output_json))) => {
                match self
                    .jobs
                    .complete_job(&self.job.id, &self.client_id, &output_json)
                    .await
                {
                    Ok(true) => {
                        debug!("job completed");
                        Ok(())
                    }
                    Ok(false) => {
                        // Concurrently cancelled or expired; best-effort no-op.
                        debug!("job finalisation skipped; lease no longer held");
                        Ok(())
                    }
                    Err(e) => {
                        warn!("failed to record job completion: {e}");
                        Ok(())
                    }
                }
            }
            Outcome::Finished(Ok(Err(err))) => {
                if err.is_cancel() {
                    if let Err(e) = self.jobs.cancel_job(&self.job.id).await {
                        warn!("failed to record job cancellation: {e}");
                    }
                } else if let Err(e) = self
                    .jobs
                    .fail_job(&self.job.id, &self.client_id, &err.serialized())
                    .await
                {
                    warn!("failed to record job failure: {e}");
                }
                Err(err)
            }
            Outcome::Finished(Err(join_err)) => {
                let err = JobError::failed(format!("handler aborted: {join_err}"));
                if let Err(e) = self
                    .jobs
                    .fail_job(&self.job.id, &self.client_id, &err.serialized())
                    .await
                {
                    warn!("failed to record job failure: {e}");
                }
                Err(err)
            }
            Outcome::Cancelled => {
                // Outcome is determined now; the handler keeps running until
                // its step callbacks observe the abort.
                if let Err(e) = self.jobs.cancel_job(&self.job.id).await {
                    warn!("failed to record job cancellation: {e}");
                }
                let _ = (&mut handler).await;
                Err(JobError::ActionCancel)
            }
            Outcome::TimedOut => {
                let err = JobError::ActionTimeout {
                    timeout_ms: self.job.timeout_ms,
                };
                if let Err(e) = self
                    .jobs
                    .fail_job(&self.job.id, &self.client_id, &err.serialized())
                    .await
                {
                    warn!("failed to record job timeout: {e}");
                }
                self.token.cancel();
                let _ = (&mut handler).await;
                Err(err)
            }
        };

        // In-flight step writes settle before anyone observes completion.
        step_manager.drain().await;
        let _ = self.done_tx.send(true);

        result
    }
}
