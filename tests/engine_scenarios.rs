//! End-to-end engine scenarios over a shared WAL database file.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use duron::database::repositories::{JobRepository, SqlxJobRepository};
use duron::database::{open_read_pool, open_write_pool};
use duron::{
    Action, ActionContext, Client, ClientConfig, JobError, JobResult, JobStatus, JobStepStatus,
    Pagination, RetryPolicy, StepOptions, StepSettings, SyncPattern, WaitOptions,
};
use serde::{Deserialize, Serialize};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duron=info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn db_url(dir: &TempDir) -> String {
    let path = dir.path().join("engine.db");
    format!(
        "sqlite:{}?mode=rwc",
        path.to_string_lossy().replace('\\', "/")
    )
}

fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::new()
        .with_pull_interval(Duration::from_millis(200))
        .with_batch_size(10);
    config.notifier_poll_interval_ms = 25;
    config
}

async fn wait_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if probe().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Empty {}

struct Noop;

#[async_trait::async_trait]
impl Action for Noop {
    type Input = Empty;
    type Output = serde_json::Value;
    type Vars = ();

    fn name(&self) -> &str {
        "noop"
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_millis(60_000)
    }

    fn step_settings(&self) -> StepSettings {
        StepSettings {
            expire: Duration::from_millis(10_000),
            ..Default::default()
        }
    }

    async fn handle(&self, _ctx: ActionContext<Empty, ()>) -> JobResult<serde_json::Value> {
        Ok(serde_json::json!({"ok": true}))
    }
}

#[tokio::test]
async fn s1_happy_path_completes_with_output() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client.register(Noop).unwrap();
    client.start().await.unwrap();

    let job_id = client
        .run_action("noop", serde_json::json!({}))
        .await
        .unwrap();

    let job = client
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap()
        .expect("job should settle");

    assert_eq!(job.get_status(), Some(JobStatus::Completed));
    assert_eq!(job.output.as_deref(), Some("{\"ok\":true}"));
    assert!(job.finished_at.is_some());

    client.stop().await;
}

struct FatalStep {
    calls: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Action for FatalStep {
    type Input = Empty;
    type Output = serde_json::Value;
    type Vars = ();

    fn name(&self) -> &str {
        "fatal-step"
    }

    async fn handle(&self, ctx: ActionContext<Empty, ()>) -> JobResult<serde_json::Value> {
        let calls = Arc::clone(&self.calls);
        let options = StepOptions::new().with_retry(RetryPolicy {
            limit: 3,
            factor: 2.0,
            min_timeout_ms: 10,
            max_timeout_ms: 100,
        });
        ctx.step_with::<(), _, _>("explode", options, move |_token| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobError::non_retriable("stop"))
            }
        })
        .await?;
        Ok(serde_json::Value::Null)
    }
}

#[tokio::test]
async fn s3_non_retriable_fails_after_one_attempt() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client
        .register(FatalStep {
            calls: Arc::clone(&calls),
        })
        .unwrap();
    client.start().await.unwrap();

    let job_id = client
        .run_action("fatal-step", serde_json::json!({}))
        .await
        .unwrap();
    let job = client
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap()
        .expect("job should settle");

    assert_eq!(job.get_status(), Some(JobStatus::Failed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (steps, total) = client
        .get_job_steps(&job_id, &Pagination::default(), None)
        .await
        .unwrap();
    assert_eq!(total, 1);
    let step = &steps[0];
    assert_eq!(step.get_status(), Some(JobStepStatus::Failed));
    assert_eq!(step.retries_count, 0);
    assert!(step.get_history().is_empty());

    client.stop().await;
}

struct FlakyStep {
    calls: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl Action for FlakyStep {
    type Input = Empty;
    type Output = u32;
    type Vars = ();

    fn name(&self) -> &str {
        "flaky-step"
    }

    async fn handle(&self, ctx: ActionContext<Empty, ()>) -> JobResult<u32> {
        let calls = Arc::clone(&self.calls);
        let options = StepOptions::new().with_retry(RetryPolicy {
            limit: 3,
            factor: 2.0,
            min_timeout_ms: 10,
            max_timeout_ms: 100,
        });
        let value = ctx
            .step_with("settle", options, move |_token| {
                let calls = Arc::clone(&calls);
                async move {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(JobError::failed("transient glitch"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await?;
        Ok(value)
    }
}

#[tokio::test]
async fn s4_retriable_backoff_then_success() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client
        .register(FlakyStep {
            calls: Arc::clone(&calls),
        })
        .unwrap();
    client.start().await.unwrap();

    let job_id = client
        .run_action("flaky-step", serde_json::json!({}))
        .await
        .unwrap();
    let job = client
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap()
        .expect("job should settle");

    assert_eq!(job.get_status(), Some(JobStatus::Completed));
    assert_eq!(job.output.as_deref(), Some("2"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let (steps, _) = client
        .get_job_steps(&job_id, &Pagination::default(), None)
        .await
        .unwrap();
    let step = &steps[0];
    assert_eq!(step.get_status(), Some(JobStepStatus::Completed));
    assert_eq!(step.retries_count, 2);
    assert_eq!(step.get_history().len(), 2);

    client.stop().await;
}

struct Sleepy {
    aborted: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Action for Sleepy {
    type Input = Empty;
    type Output = bool;
    type Vars = ();

    fn name(&self) -> &str {
        "sleepy"
    }

    async fn handle(&self, ctx: ActionContext<Empty, ()>) -> JobResult<bool> {
        let aborted = Arc::clone(&self.aborted);
        let value = ctx
            .step("sleep", move |token| {
                let aborted = Arc::clone(&aborted);
                async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            aborted.store(true, Ordering::SeqCst);
                            Err(JobError::ActionCancel)
                        }
                        _ = tokio::time::sleep(Duration::from_millis(500)) => Ok(true),
                    }
                }
            })
            .await?;
        Ok(value)
    }
}

#[tokio::test]
async fn s5_cancel_mid_step_cancels_job_and_step() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let aborted = Arc::new(AtomicBool::new(false));
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client
        .register(Sleepy {
            aborted: Arc::clone(&aborted),
        })
        .unwrap();
    client.start().await.unwrap();

    let job_id = client
        .run_action("sleepy", serde_json::json!({}))
        .await
        .unwrap();

    // The step row appearing means the callback is in flight.
    wait_until("step to start", || {
        let client = Arc::clone(&client);
        let job_id = job_id.clone();
        async move {
            let (_, total) = client
                .get_job_steps(&job_id, &Pagination::default(), None)
                .await
                .unwrap();
            total == 1
        }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.cancel_job(&job_id).await.unwrap());

    let job = client
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap()
        .expect("job should settle");
    assert_eq!(job.get_status(), Some(JobStatus::Cancelled));

    wait_until("step to finalise", || {
        let client = Arc::clone(&client);
        let job_id = job_id.clone();
        async move {
            let (steps, _) = client
                .get_job_steps(&job_id, &Pagination::default(), None)
                .await
                .unwrap();
            steps
                .first()
                .is_some_and(|s| s.get_status() == Some(JobStepStatus::Cancelled))
        }
    })
    .await;
    assert!(aborted.load(Ordering::SeqCst));

    client.stop().await;
}

struct Recoverable;

#[async_trait::async_trait]
impl Action for Recoverable {
    type Input = Empty;
    type Output = serde_json::Value;
    type Vars = ();

    fn name(&self) -> &str {
        "recoverable"
    }

    async fn handle(&self, _ctx: ActionContext<Empty, ()>) -> JobResult<serde_json::Value> {
        Ok(serde_json::json!({"done": true}))
    }
}

#[tokio::test]
async fn s6_dead_worker_jobs_are_recovered_and_rerun() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let url = db_url(&dir);

    // Client A claims the job and then "dies": it never starts, so it never
    // answers liveness pings.
    let mut config_a = fast_config().with_id("client-a");
    config_a.sync_pattern = SyncPattern::Disabled;
    config_a.recover_jobs_on_start = false;
    let client_a = Client::connect(&url, config_a).await.unwrap();
    client_a.register(Recoverable).unwrap();

    // Migrations normally run on start; A never starts.
    let pool = open_read_pool(&url, 2).await.unwrap();
    duron::database::run_migrations(&pool).await.unwrap();

    let job_id = client_a
        .run_action("recoverable", serde_json::json!({}))
        .await
        .unwrap();

    let write_pool = open_write_pool(&url).await.unwrap();
    let repo = SqlxJobRepository::new(pool.clone(), write_pool);
    let claimed = repo.fetch_and_admit(1, "client-a", None).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, job_id);

    // Client B knows the same action, pings A, gets silence, recovers.
    let mut config_b = fast_config().with_id("client-b").with_multi_process_mode(true);
    config_b.process_timeout_ms = 300;
    let client_b = Client::connect(&url, config_b).await.unwrap();
    client_b.register(Recoverable).unwrap();
    client_b.start().await.unwrap();

    let job = client_b
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap()
        .expect("recovered job should settle");

    assert_eq!(job.get_status(), Some(JobStatus::Completed));
    assert_eq!(job.client_id.as_deref(), Some("client-b"));

    client_b.stop().await;
}

#[tokio::test]
async fn live_workers_are_not_recovered() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let url = db_url(&dir);

    // Client A is alive and answering pings; its lease must survive.
    let mut config_a = fast_config().with_id("client-a");
    config_a.sync_pattern = SyncPattern::Disabled;
    config_a.recover_jobs_on_start = false;
    let client_a = Client::connect(&url, config_a).await.unwrap();
    client_a.register(Recoverable).unwrap();
    client_a.start().await.unwrap();

    let job_id = client_a
        .run_action("recoverable", serde_json::json!({}))
        .await
        .unwrap();

    let pool = open_read_pool(&url, 2).await.unwrap();
    let write_pool = open_write_pool(&url).await.unwrap();
    let repo = SqlxJobRepository::new(pool, write_pool);
    repo.fetch_and_admit(1, "client-a", None).await.unwrap();

    let mut config_b = fast_config().with_id("client-b").with_multi_process_mode(true);
    config_b.process_timeout_ms = 2000;
    let client_b = Client::connect(&url, config_b).await.unwrap();
    client_b.register(Recoverable).unwrap();
    client_b.start().await.unwrap();

    let status = client_b.get_job_status(&job_id).await.unwrap();
    assert_eq!(status, Some(JobStatus::Active));

    client_a.stop().await;
    client_b.stop().await;
}

struct DoubleStep;

#[async_trait::async_trait]
impl Action for DoubleStep {
    type Input = Empty;
    type Output = serde_json::Value;
    type Vars = ();

    fn name(&self) -> &str {
        "double-step"
    }

    async fn handle(&self, ctx: ActionContext<Empty, ()>) -> JobResult<serde_json::Value> {
        ctx.step("same-name", |_token| async move { Ok(1u32) }).await?;
        ctx.step("same-name", |_token| async move { Ok(2u32) }).await?;
        Ok(serde_json::Value::Null)
    }
}

#[tokio::test]
async fn replaying_a_step_name_fails_the_job() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client.register(DoubleStep).unwrap();
    client.start().await.unwrap();

    let job_id = client
        .run_action("double-step", serde_json::json!({}))
        .await
        .unwrap();
    let job = client
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap()
        .expect("job should settle");

    assert_eq!(job.get_status(), Some(JobStatus::Failed));
    let error = job.error.expect("stored error");
    assert!(error.contains("StepAlreadyExecuted"), "error was: {error}");

    client.stop().await;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TypedInput {
    name: String,
    #[serde(default)]
    attempts: u32,
}

struct Typed;

#[async_trait::async_trait]
impl Action for Typed {
    type Input = TypedInput;
    type Output = String;
    type Vars = ();

    fn name(&self) -> &str {
        "typed"
    }

    fn version(&self) -> Option<&str> {
        Some("2")
    }

    async fn handle(&self, ctx: ActionContext<TypedInput, ()>) -> JobResult<String> {
        Ok(ctx.input.name)
    }
}

#[tokio::test]
async fn invalid_input_is_rejected_before_enqueue() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client.register(Typed).unwrap();
    client.start().await.unwrap();

    let err = client
        .run_action("typed", serde_json::json!({"name": 42}))
        .await
        .unwrap_err();
    assert!(matches!(err, duron::Error::Validation(_)));

    let err = client
        .run_action("unregistered", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, duron::Error::UnknownAction(_)));

    client.stop().await;
}

#[tokio::test]
async fn actions_metadata_exposes_deterministic_mock_input() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client.register(Typed).unwrap();
    client.register(Noop).unwrap();

    let metadata = client.get_actions_metadata();
    assert_eq!(metadata.len(), 2);
    assert_eq!(metadata[0].name, "noop");
    assert_eq!(metadata[1].name, "typed");
    assert_eq!(metadata[1].version.as_deref(), Some("2"));
    assert_eq!(
        metadata[1].mock_input,
        serde_json::json!({"name": "", "attempts": 0})
    );
    assert_eq!(metadata[1].checksum.len(), 64);
}

#[tokio::test]
async fn wait_for_job_times_out_to_none() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.sync_pattern = SyncPattern::Disabled;
    let client = Client::connect(&db_url(&dir), config).await.unwrap();
    client.register(Noop).unwrap();
    client.start().await.unwrap();

    // Nothing fetches in disabled mode, so the job never settles.
    let job_id = client
        .run_action("noop", serde_json::json!({}))
        .await
        .unwrap();
    let waited = client
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert!(waited.is_none());

    client.stop().await;
}

struct SlowJob;

#[async_trait::async_trait]
impl Action for SlowJob {
    type Input = Empty;
    type Output = bool;
    type Vars = ();

    fn name(&self) -> &str {
        "slow-job"
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_millis(250)
    }

    async fn handle(&self, ctx: ActionContext<Empty, ()>) -> JobResult<bool> {
        ctx.step("long-haul", |token| async move {
            tokio::select! {
                _ = token.cancelled() => Err(JobError::ActionCancel),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(true),
            }
        })
        .await
    }
}

#[tokio::test]
async fn job_timeout_fails_the_job() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let client = Client::connect(&db_url(&dir), fast_config()).await.unwrap();
    client.register(SlowJob).unwrap();
    client.start().await.unwrap();

    let job_id = client
        .run_action("slow-job", serde_json::json!({}))
        .await
        .unwrap();
    let job = client
        .wait_for_job(
            &job_id,
            WaitOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .unwrap()
        .expect("job should settle");

    assert_eq!(job.get_status(), Some(JobStatus::Failed));
    let error = job.error.expect("stored error");
    assert!(error.contains("ActionTimeout"), "error was: {error}");

    client.stop().await;
}
