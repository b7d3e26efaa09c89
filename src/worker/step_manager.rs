//! Per-job step lifecycle.
//!
//! One StepManager exists per in-flight job run. It owns the executed-name
//! set, bounds concurrent step callbacks, and drives each step through
//! create-or-recover, timeout, retry with exponential backoff, and terminal
//! persistence. Step bodies run on tracked tasks so a dropped handler future
//! can never lose an in-flight step write.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::action::{JobError, JobResult, RetryPolicy, SerializedError, StepOptions, StepSettings};
use crate::database::models::JobStepStatus;
use crate::database::repositories::JobStepRepository;

pub struct StepManager {
    job_id: String,
    client_id: String,
    repo: Arc<dyn JobStepRepository>,
    settings: StepSettings,
    action_token: CancellationToken,
    dispatch: Arc<Semaphore>,
    executed: Mutex<HashSet<String>>,
    tracker: TaskTracker,
}

impl StepManager {
    pub(crate) fn new(
        job_id: String,
        client_id: String,
        repo: Arc<dyn JobStepRepository>,
        settings: StepSettings,
        action_token: CancellationToken,
    ) -> Self {
        let dispatch = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            job_id,
            client_id,
            repo,
            settings,
            action_token,
            dispatch,
            executed: Mutex::new(HashSet::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Run one named step. See [`crate::ActionContext::step`].
    pub async fn run_step<T, F, Fut>(&self, name: &str, options: StepOptions, f: F) -> JobResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<T>> + Send + 'static,
    {
        // An active run must not replay a step name.
        if !self.executed.lock().insert(name.to_string()) {
            return Err(JobError::StepAlreadyExecuted(name.to_string()));
        }

        let retry = options.retry.unwrap_or(self.settings.retry);
        let expire = options.expire.unwrap_or(self.settings.expire);
        let expire_ms = expire.as_millis() as i64;

        let permit = self
            .dispatch
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JobError::ActionCancel)?;

        let row = self
            .repo
            .create_or_recover_job_step(&self.job_id, name, expire_ms, retry.limit as i64)
            .await?;

        // The owning job is no longer active (cancelled, finished elsewhere,
        // or lease expired); nothing was written.
        let Some(row) = row else {
            return Err(JobError::ActionCancel);
        };

        match row.status {
            JobStepStatus::Completed => {
                // The step already ran in a prior worker life; return its
                // stored output without invoking the callback.
                debug!(job_id = %self.job_id, step = name, "step recovered as completed");
                return parse_output(row.output.as_deref());
            }
            JobStepStatus::Failed | JobStepStatus::Cancelled => {
                let stored = row
                    .error
                    .as_deref()
                    .map(SerializedError::from_json)
                    .unwrap_or_else(|| {
                        SerializedError::new("Error", "step previously reached a terminal failure")
                    });
                return Err(JobError::NonRetriable(stored));
            }
            JobStepStatus::Active => {}
        }

        let attempt_loop = StepAttemptLoop {
            repo: Arc::clone(&self.repo),
            job_id: self.job_id.clone(),
            client_id: self.client_id.clone(),
            step_id: row.id,
            name: name.to_string(),
            retry,
            expire,
            step_token: self.action_token.child_token(),
        };

        let handle = self.tracker.spawn(async move {
            let result = attempt_loop.run(f).await;
            drop(permit);
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(JobError::failed(format!("step '{name}' aborted: {join_err}"))),
        }
    }

    /// Block until every dispatched step has settled its writes.
    pub(crate) async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct StepAttemptLoop {
    repo: Arc<dyn JobStepRepository>,
    job_id: String,
    client_id: String,
    step_id: String,
    name: String,
    retry: RetryPolicy,
    expire: std::time::Duration,
    step_token: CancellationToken,
}

impl StepAttemptLoop {
    async fn run<T, F, Fut>(self, mut f: F) -> JobResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<T>> + Send + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = self.run_attempt(&mut f).await;

            match result {
                Ok(value) => {
                    let output_json = serde_json::to_string(&value)
                        .map_err(|e| JobError::Validation(format!("invalid step output: {e}")))?;
                    let recorded = self
                        .repo
                        .complete_job_step(&self.step_id, &self.client_id, &output_json)
                        .await?;
                    if !recorded {
                        warn!(
                            job_id = %self.job_id,
                            step = %self.name,
                            "step result not recorded; job lost its lease"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_cancel() => {
                    let _ = self
                        .repo
                        .cancel_job_step(&self.step_id, &self.client_id, Some(&err.serialized()))
                        .await;
                    return Err(err);
                }
                Err(err) if err.is_non_retriable() || !self.retry.should_retry(attempt) => {
                    let _ = self
                        .repo
                        .fail_job_step(&self.step_id, &self.client_id, &err.serialized())
                        .await;
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        job_id = %self.job_id,
                        step = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "step attempt failed; delaying for retry"
                    );

                    let delayed = self
                        .repo
                        .delay_job_step(
                            &self.step_id,
                            &self.client_id,
                            &err.serialized(),
                            delay.as_millis() as i64,
                        )
                        .await?;
                    if !delayed {
                        // The owning job went away mid-flight.
                        return Err(JobError::ActionCancel);
                    }

                    tokio::select! {
                        _ = self.step_token.cancelled() => {
                            let cancel = JobError::ActionCancel;
                            let _ = self
                                .repo
                                .cancel_job_step(
                                    &self.step_id,
                                    &self.client_id,
                                    Some(&cancel.serialized()),
                                )
                                .await;
                            return Err(cancel);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                }
            }
        }
    }

    async fn run_attempt<T, F, Fut>(&self, f: &mut F) -> JobResult<T>
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<T>> + Send + 'static,
    {
        let callback = f(self.step_token.clone());
        tokio::select! {
            _ = self.step_token.cancelled() => Err(JobError::ActionCancel),
            outcome = tokio::time::timeout(self.expire, callback) => match outcome {
                Ok(result) => result,
                Err(_) => Err(JobError::StepTimeout {
                    name: self.name.clone(),
                    timeout_ms: self.expire.as_millis() as i64,
                }),
            },
        }
    }
}

fn parse_output<T: DeserializeOwned>(output: Option<&str>) -> JobResult<T> {
    let raw = output.unwrap_or("null");
    serde_json::from_str(raw)
        .map_err(|e| JobError::Validation(format!("stored step output does not match: {e}")))
}
