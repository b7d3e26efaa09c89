//! Handler execution context.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::action::{JobResult, RunEnv, StepOptions};
use crate::worker::StepManager;

/// Context handed to an action handler for one job run.
///
/// `vars` is the typed configuration record supplied by the owning client;
/// `step` routes named, retryable units through the step manager.
pub struct ActionContext<I, V> {
    /// The validated input for this job.
    pub input: I,
    /// The job id.
    pub job_id: String,
    /// The resolved group key.
    pub group_key: String,
    /// Shared variables supplied by the client.
    pub vars: Arc<V>,
    steps: Arc<StepManager>,
    cancel: CancellationToken,
}

impl<I, V> ActionContext<I, V> {
    pub(crate) fn new(input: I, env: RunEnv<V>) -> Self {
        Self {
            input,
            job_id: env.job_id,
            group_key: env.group_key,
            vars: env.vars,
            steps: env.steps,
            cancel: env.cancel,
        }
    }

    /// The action-level cancellation token. Handlers doing long work outside
    /// of steps can observe it directly.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a named step with the action's default step settings.
    ///
    /// The callback receives a step-scoped cancellation token linked to the
    /// action scope and is expected to honour it. On recovery of an already
    /// completed step the stored output is returned without invoking the
    /// callback.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> JobResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<T>> + Send + 'static,
    {
        self.steps
            .run_step(name, StepOptions::default(), f)
            .await
    }

    /// Run a named step with per-call overrides.
    pub async fn step_with<T, F, Fut>(
        &self,
        name: &str,
        options: StepOptions,
        f: F,
    ) -> JobResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = JobResult<T>> + Send + 'static,
    {
        self.steps.run_step(name, options, f).await
    }
}
