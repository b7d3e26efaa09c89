//! Action definitions.
//!
//! An [`Action`] is a named, typed handler. Registration erases the types
//! behind [`RunnableAction`] so the client and worker pool can dispatch
//! uniformly; handler authorship stays fully typed.

pub mod context;
pub mod error;
pub mod retry;

pub use context::ActionContext;
pub use error::{JobError, JobResult, SerializedError, NON_RETRIABLE_NAME};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::worker::StepManager;
use crate::{Error, Result};

/// Group key used when an action does not group its jobs.
pub const DEFAULT_GROUP_KEY: &str = "@default";

/// Default job timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_millis(900_000);

/// Default step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Default per-job step concurrency.
pub const DEFAULT_STEP_CONCURRENCY: usize = 10;

/// Step execution settings carried by an action.
#[derive(Debug, Clone)]
pub struct StepSettings {
    /// How many step callbacks may run concurrently within one job.
    pub concurrency: usize,
    /// Retry policy applied to each step.
    pub retry: RetryPolicy,
    /// Step timeout.
    pub expire: Duration,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_STEP_CONCURRENCY,
            retry: RetryPolicy::default(),
            expire: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// Per-call step overrides.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub expire: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// A named, schema-validated handler.
///
/// `Input` doubles as the action's input schema: untyped payloads are
/// validated by deserializing into it, and `Input::default()` provides the
/// deterministic mock input for action metadata. `Vars` is the typed
/// configuration record shared by the owning client.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    type Input: Serialize + DeserializeOwned + Default + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Vars: Send + Sync + 'static;

    /// Unique action name.
    fn name(&self) -> &str;

    /// Optional version; bump it when handler semantics change so recovery
    /// discards stale step history.
    fn version(&self) -> Option<&str> {
        None
    }

    /// Group key for admission concurrency.
    fn group_key(&self, _input: &Self::Input) -> String {
        DEFAULT_GROUP_KEY.to_string()
    }

    /// Group admission limit; `None` falls back to the client default.
    fn group_concurrency(&self, _input: &Self::Input) -> Option<i64> {
        None
    }

    /// Job-level timeout, measured from admission.
    fn job_timeout(&self) -> Duration {
        DEFAULT_JOB_TIMEOUT
    }

    /// Step execution settings.
    fn step_settings(&self) -> StepSettings {
        StepSettings::default()
    }

    /// Execute one job.
    async fn handle(
        &self,
        ctx: ActionContext<Self::Input, Self::Vars>,
    ) -> JobResult<Self::Output>;
}

/// Execution environment handed from the worker to an erased action run.
pub(crate) struct RunEnv<V> {
    pub job_id: String,
    pub group_key: String,
    pub vars: Arc<V>,
    pub steps: Arc<StepManager>,
    pub cancel: tokio_util::sync::CancellationToken,
}

type BoxedRunFuture = Pin<Box<dyn Future<Output = JobResult<String>> + Send + 'static>>;

/// Object-safe view of a registered action.
pub(crate) trait RunnableAction<V>: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> Option<&str>;
    fn checksum(&self) -> &str;
    fn job_timeout(&self) -> Duration;
    fn step_settings(&self) -> StepSettings;

    /// Validate an untyped input and return its canonical JSON.
    fn validate_input(&self, input: &serde_json::Value) -> Result<String>;

    /// Deterministic sample input, cached at registration.
    fn mock_input(&self) -> &serde_json::Value;

    /// Resolve `(group_key, group_concurrency)` for a validated input.
    fn resolve_group(&self, input: &serde_json::Value) -> Result<(String, Option<i64>)>;

    /// Run the handler; returns the serialized, schema-checked output.
    fn run(&self, input_json: String, env: RunEnv<V>) -> BoxedRunFuture;
}

/// Derive the action checksum stored on every job.
///
/// There is no handler source text to hash in a compiled language; the
/// handler's type path stands in for it, and `version` is the deliberate
/// cross-deployment signal.
pub(crate) fn action_checksum(name: &str, version: Option<&str>, handler_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(version.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(handler_type.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Typed action + cached registration data.
pub(crate) struct RegisteredAction<A: Action> {
    action: Arc<A>,
    checksum: String,
    mock_input: serde_json::Value,
}

impl<A: Action> RegisteredAction<A> {
    pub fn new(action: A) -> Self {
        let checksum = action_checksum(
            action.name(),
            action.version(),
            std::any::type_name::<A>(),
        );
        let mock_input =
            serde_json::to_value(A::Input::default()).unwrap_or(serde_json::Value::Null);
        Self {
            action: Arc::new(action),
            checksum,
            mock_input,
        }
    }
}

impl<A: Action> RunnableAction<A::Vars> for RegisteredAction<A> {
    fn name(&self) -> &str {
        self.action.name()
    }

    fn version(&self) -> Option<&str> {
        self.action.version()
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn job_timeout(&self) -> Duration {
        self.action.job_timeout()
    }

    fn step_settings(&self) -> StepSettings {
        self.action.step_settings()
    }

    fn validate_input(&self, input: &serde_json::Value) -> Result<String> {
        let typed: A::Input = serde_json::from_value(input.clone())
            .map_err(|e| Error::validation(format!("invalid input: {e}")))?;
        Ok(serde_json::to_string(&typed)?)
    }

    fn mock_input(&self) -> &serde_json::Value {
        &self.mock_input
    }

    fn resolve_group(&self, input: &serde_json::Value) -> Result<(String, Option<i64>)> {
        let typed: A::Input = serde_json::from_value(input.clone())
            .map_err(|e| Error::validation(format!("invalid input: {e}")))?;
        Ok((
            self.action.group_key(&typed),
            self.action.group_concurrency(&typed),
        ))
    }

    fn run(&self, input_json: String, env: RunEnv<A::Vars>) -> BoxedRunFuture {
        let action = Arc::clone(&self.action);
        Box::pin(async move {
            let input: A::Input = serde_json::from_str(&input_json)
                .map_err(|e| JobError::Validation(format!("invalid input: {e}")))?;

            let ctx = ActionContext::new(input, env);
            let output = action.handle(ctx).await?;

            serde_json::to_string(&output)
                .map_err(|e| JobError::Validation(format!("invalid output: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_and_distinct() {
        let a = action_checksum("send-email", Some("1"), "handler::SendEmail");
        let b = action_checksum("send-email", Some("1"), "handler::SendEmail");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let bumped = action_checksum("send-email", Some("2"), "handler::SendEmail");
        assert_ne!(a, bumped);

        let renamed = action_checksum("send-sms", Some("1"), "handler::SendEmail");
        assert_ne!(a, renamed);
    }

    #[test]
    fn test_step_settings_defaults() {
        let settings = StepSettings::default();
        assert_eq!(settings.concurrency, 10);
        assert_eq!(settings.retry.limit, 4);
        assert_eq!(settings.expire, Duration::from_millis(300_000));
    }
}
