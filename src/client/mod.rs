//! The outward engine object.
//!
//! A `Client` owns the pools, the notifier, the registered actions with
//! their worker pools, and the sync loops that discover work. Multiple
//! clients across processes coordinate through the shared database.

pub mod config;

pub use config::{ClientConfig, SyncPattern};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{Action, RegisteredAction, RunnableAction};
use crate::database::models::{
    ActionSummary, JobDbModel, JobFilters, JobSort, JobStatus, JobStepDbModel, JobStepStatus,
    Pagination,
};
use crate::database::repositories::{
    JobRepository, JobStepRepository, SqlxJobRepository, SqlxJobStepRepository,
};
use crate::database::{default_read_pool_size, open_read_pool, open_write_pool, run_migrations, DbPool};
use crate::notifier::{Notification, Notifier};
use crate::worker::ActionManager;
use crate::{Error, Result};

/// Options for [`Client::wait_for_job`].
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Resolve `None` after this long.
    pub timeout: Option<Duration>,
    /// Resolve `None` when this token fires.
    pub signal: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Metadata describing a registered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub name: String,
    pub version: Option<String>,
    pub checksum: String,
    /// Deterministic sample input, cached per action.
    pub mock_input: serde_json::Value,
}

type Waiters = Mutex<HashMap<String, Vec<oneshot::Sender<Option<JobDbModel>>>>>;

struct RunState {
    running: bool,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The shared internals the client's background loops operate on.
struct EngineCore<V> {
    id: String,
    jobs: Arc<dyn JobRepository>,
    managers: RwLock<HashMap<String, Arc<ActionManager<V>>>>,
    waiters: Waiters,
}

impl<V: Send + Sync + 'static> EngineCore<V> {
    fn registered_action_names(&self) -> Vec<String> {
        self.managers.read().keys().cloned().collect()
    }

    fn registered_checksums(&self) -> Vec<String> {
        self.managers
            .read()
            .values()
            .map(|m| m.action().checksum().to_string())
            .collect()
    }

    /// Fetch a batch under group admission and dispatch to worker pools.
    async fn fetch_and_dispatch(&self, batch: u32) -> Result<usize> {
        let names = self.registered_action_names();
        if names.is_empty() {
            return Ok(0);
        }

        let claimed = self
            .jobs
            .fetch_and_admit(batch, &self.id, Some(names.as_slice()))
            .await?;
        let count = claimed.len();

        for job in claimed {
            let manager = {
                let managers = self.managers.read();
                managers.get(&job.action_name).cloned()
            };
            match manager {
                Some(manager) => manager.push(job),
                None => {
                    // The fetch filter makes this unreachable in practice.
                    warn!(job_id = %job.id, action = %job.action_name, "claimed job has no manager");
                }
            }
        }
        Ok(count)
    }

    async fn resolve_waiters(&self, job_id: &str, job: Option<JobDbModel>) {
        let senders = {
            let mut waiters = self.waiters.lock().await;
            waiters.remove(job_id)
        };
        if let Some(senders) = senders {
            for sender in senders {
                let _ = sender.send(job.clone());
            }
        }
    }

    async fn forget_closed_waiters(&self, job_id: &str) {
        let mut waiters = self.waiters.lock().await;
        if let Some(senders) = waiters.get_mut(job_id) {
            senders.retain(|sender| !sender.is_closed());
            if senders.is_empty() {
                waiters.remove(job_id);
            }
        }
    }
}

/// The engine client. `V` is the typed variable record handed to handlers.
pub struct Client<V = ()> {
    config: ClientConfig,
    pool: DbPool,
    steps: Arc<dyn JobStepRepository>,
    notifier: Arc<Notifier>,
    vars: Arc<V>,
    core: Arc<EngineCore<V>>,
    state: Mutex<RunState>,
}

impl Client<()> {
    /// Connect with no shared variables.
    pub async fn connect(database_url: &str, config: ClientConfig) -> Result<Arc<Self>> {
        Self::connect_with_vars(database_url, config, ()).await
    }
}

impl<V: Send + Sync + 'static> Client<V> {
    /// Connect, supplying the typed variable record handlers receive as
    /// `ctx.vars`.
    pub async fn connect_with_vars(
        database_url: &str,
        config: ClientConfig,
        vars: V,
    ) -> Result<Arc<Self>> {
        let pool = open_read_pool(database_url, default_read_pool_size()).await?;
        let write_pool = open_write_pool(database_url).await?;

        let jobs: Arc<dyn JobRepository> =
            Arc::new(SqlxJobRepository::new(pool.clone(), write_pool.clone()));
        let steps: Arc<dyn JobStepRepository> =
            Arc::new(SqlxJobStepRepository::new(pool.clone(), write_pool));
        let notifier = Notifier::new(pool.clone(), config.notifier_poll_interval());

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Arc::new(Self {
            config,
            pool,
            steps,
            notifier,
            vars: Arc::new(vars),
            core: Arc::new(EngineCore {
                id,
                jobs,
                managers: RwLock::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
            }),
            state: Mutex::new(RunState {
                running: false,
                shutdown: CancellationToken::new(),
                tasks: Vec::new(),
            }),
        }))
    }

    /// This worker's fleet-unique identity.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Register an action. Must not collide with a registered name.
    pub fn register<A: Action<Vars = V>>(&self, action: A) -> Result<()> {
        let runnable: Arc<dyn RunnableAction<V>> = Arc::new(RegisteredAction::new(action));
        let name = runnable.name().to_string();

        let mut managers = self.core.managers.write();
        if managers.contains_key(&name) {
            return Err(Error::config(format!("action '{name}' already registered")));
        }

        let manager = ActionManager::new(
            Arc::clone(&runnable),
            Arc::clone(&self.core.jobs),
            Arc::clone(&self.steps),
            Arc::clone(&self.vars),
            self.core.id.clone(),
            self.config.action_concurrency_limit,
        );
        managers.insert(name, Arc::new(manager));
        Ok(())
    }

    /// Start the client: migrations, notifier, recovery, sync loops.
    /// Idempotent; concurrent starts serialise on the state lock.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.running {
            return Ok(());
        }

        if self.config.migrate_on_start {
            run_migrations(&self.pool).await?;
        }

        self.notifier.start().await?;

        // A restarted client reuses its registered managers.
        for manager in self.core.managers.read().values() {
            manager.reopen();
        }

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        // Liveness responder: answer pings addressed to this client for as
        // long as it runs, busy or idle.
        tasks.push(self.spawn_ping_responder(shutdown.clone()));

        // Shared listener resolving parked wait_for_job calls.
        tasks.push(self.spawn_waiter_listener(shutdown.clone()));

        if self.config.recover_jobs_on_start && !self.core.registered_action_names().is_empty() {
            let recovered = self.recover_jobs().await?;
            if recovered > 0 {
                info!(client_id = %self.core.id, recovered, "recovered orphaned jobs");
            }
        }

        match self.config.sync_pattern {
            SyncPattern::Pull => {
                tasks.push(self.spawn_pull_loop(shutdown.clone()));
            }
            SyncPattern::Push => {
                tasks.push(self.spawn_push_listener(shutdown.clone()));
            }
            SyncPattern::Hybrid => {
                tasks.push(self.spawn_pull_loop(shutdown.clone()));
                tasks.push(self.spawn_push_listener(shutdown.clone()));
            }
            SyncPattern::Disabled => {}
        }

        state.shutdown = shutdown;
        state.tasks = tasks;
        state.running = true;
        info!(client_id = %self.core.id, "client started");
        Ok(())
    }

    /// Stop the client: sync loops, pending waiters, worker pools, notifier.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        state.shutdown.cancel();
        for task in state.tasks.drain(..) {
            let _ = task.await;
        }

        // Pending waiters resolve to None on stop.
        {
            let mut waiters = self.core.waiters.lock().await;
            for (_, senders) in waiters.drain() {
                for sender in senders {
                    let _ = sender.send(None);
                }
            }
        }

        let managers: Vec<Arc<ActionManager<V>>> =
            self.core.managers.read().values().cloned().collect();
        for manager in managers {
            manager.stop().await;
        }

        self.notifier.stop().await;

        state.running = false;
        info!(client_id = %self.core.id, "client stopped");
    }

    /// Enqueue one execution of a named action. Validates the input against
    /// the action's schema and resolves group key and admission limit.
    pub async fn run_action(&self, name: &str, input: serde_json::Value) -> Result<String> {
        let action = {
            let managers = self.core.managers.read();
            let manager = managers
                .get(name)
                .ok_or_else(|| Error::UnknownAction(name.to_string()))?;
            Arc::clone(manager.action())
        };

        let input_json = action.validate_input(&input)?;
        let (group_key, group_concurrency) = action.resolve_group(&input)?;
        let concurrency_limit =
            group_concurrency.unwrap_or(self.config.group_concurrency_limit);

        let job = JobDbModel::new(
            name,
            group_key,
            input_json,
            action.job_timeout().as_millis() as i64,
            action.checksum(),
            concurrency_limit,
        );
        let job_id = job.id.clone();
        self.core.jobs.create_job(&job).await?;
        debug!(client_id = %self.core.id, job_id = %job_id, action = name, "job enqueued");
        Ok(job_id)
    }

    /// Cancel a job. In-flight local runs are aborted in place; anything
    /// else goes through the store.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let cancelled_locally = {
            let managers = self.core.managers.read();
            managers.values().any(|m| m.cancel_job(job_id))
        };
        if cancelled_locally {
            return Ok(true);
        }
        self.core.jobs.cancel_job(job_id).await
    }

    /// Re-enqueue a terminal job; see the store contract for dedup rules.
    pub async fn retry_job(&self, job_id: &str) -> Result<Option<String>> {
        self.core.jobs.retry_job(job_id).await
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        self.core.jobs.delete_job(job_id).await
    }

    pub async fn delete_jobs(&self, filters: &JobFilters) -> Result<u64> {
        self.core.jobs.delete_jobs(filters).await
    }

    pub async fn get_job_by_id(&self, job_id: &str) -> Result<Option<JobDbModel>> {
        self.core.jobs.get_job_by_id(job_id).await
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        self.core.jobs.get_job_status(job_id).await
    }

    pub async fn get_jobs(
        &self,
        filters: &JobFilters,
        pagination: &Pagination,
        sort: &JobSort,
    ) -> Result<(Vec<JobDbModel>, u64)> {
        self.core.jobs.get_jobs(filters, pagination, sort).await
    }

    pub async fn get_job_steps(
        &self,
        job_id: &str,
        pagination: &Pagination,
        search: Option<&str>,
    ) -> Result<(Vec<JobStepDbModel>, u64)> {
        self.steps.get_job_steps(job_id, pagination, search).await
    }

    pub async fn get_job_step_by_id(&self, step_id: &str) -> Result<Option<JobStepDbModel>> {
        self.steps.get_job_step_by_id(step_id).await
    }

    pub async fn get_job_step_status(&self, step_id: &str) -> Result<Option<JobStepStatus>> {
        self.steps.get_job_step_status(step_id).await
    }

    /// Per-action aggregates from the store.
    pub async fn get_actions(&self) -> Result<Vec<ActionSummary>> {
        self.core.jobs.get_actions().await
    }

    /// Metadata for every registered action, including the cached
    /// deterministic mock input.
    pub fn get_actions_metadata(&self) -> Vec<ActionMetadata> {
        let managers = self.core.managers.read();
        let mut metadata: Vec<ActionMetadata> = managers
            .values()
            .map(|manager| {
                let action = manager.action();
                ActionMetadata {
                    name: action.name().to_string(),
                    version: action.version().map(str::to_string),
                    checksum: action.checksum().to_string(),
                    mock_input: action.mock_input().clone(),
                }
            })
            .collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }

    /// Wait until a job reaches a terminal status and return the full row.
    /// Resolves `None` on timeout, signal, or client stop; never errors on
    /// those paths.
    pub async fn wait_for_job(
        &self,
        job_id: &str,
        options: WaitOptions,
    ) -> Result<Option<JobDbModel>> {
        if let Some(status) = self.core.jobs.get_job_status(job_id).await? {
            if status.is_terminal() {
                return self.core.jobs.get_job_by_id(job_id).await;
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.core.waiters.lock().await;
            waiters.entry(job_id.to_string()).or_default().push(tx);
        }

        // The status may have gone terminal between the check and parking.
        if let Some(status) = self.core.jobs.get_job_status(job_id).await? {
            if status.is_terminal() {
                let job = self.core.jobs.get_job_by_id(job_id).await?;
                self.core.resolve_waiters(job_id, job.clone()).await;
                return Ok(job);
            }
        }

        let timeout = options.timeout.map(tokio::time::sleep);
        let signal = options.signal;

        tokio::select! {
            result = rx => Ok(result.unwrap_or(None)),
            _ = async {
                match timeout {
                    Some(sleep) => sleep.await,
                    None => std::future::pending().await,
                }
            } => {
                self.core.forget_closed_waiters(job_id).await;
                Ok(None)
            }
            _ = async {
                match &signal {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            } => {
                self.core.forget_closed_waiters(job_id).await;
                Ok(None)
            }
        }
    }

    /// Reset jobs orphaned by crashed workers.
    ///
    /// This client's own leases from a previous life are always suspect. In
    /// multi-process mode foreign lease holders get pinged and only
    /// non-responders are recovered; otherwise every foreign holder is.
    pub async fn recover_jobs(&self) -> Result<u64> {
        let known_checksums = self.core.registered_checksums();
        let foreign = self
            .core
            .jobs
            .distinct_active_client_ids(&self.core.id)
            .await?;

        let mut suspects = vec![self.core.id.clone()];
        if self.config.multi_process_mode {
            let silent = self.ping_clients(&foreign).await?;
            suspects.extend(silent);
        } else {
            suspects.extend(foreign);
        }

        self.core.jobs.recover_jobs(&suspects, &known_checksums).await
    }

    /// Ping each client id and return those that fail to pong in time.
    async fn ping_clients(&self, client_ids: &[String]) -> Result<Vec<String>> {
        if client_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut rx = self.notifier.subscribe();
        for cid in client_ids {
            self.notifier
                .publish(&Notification::Ping {
                    target: cid.clone(),
                    from: self.core.id.clone(),
                })
                .await?;
        }

        let mut pending: HashSet<String> = client_ids.iter().cloned().collect();
        let deadline = tokio::time::Instant::now() + self.config.process_timeout();

        while !pending.is_empty() {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(Notification::Pong { target, from }) if target == self.core.id => {
                    pending.remove(&from);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "liveness listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        Ok(pending.into_iter().collect())
    }

    fn spawn_pull_loop(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let interval = self.config.pull_interval();
        let batch = self.config.batch_size;
        tokio::spawn(async move {
            loop {
                // Store hiccups must not kill the loop.
                if let Err(e) = core.fetch_and_dispatch(batch).await {
                    warn!("pull fetch failed: {e}");
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    fn spawn_push_listener(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let mut rx = self.notifier.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(Notification::JobAvailable { .. }) => {
                        if let Err(e) = core.fetch_and_dispatch(1).await {
                            warn!("push fetch failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "push listener lagged; pull loop converges");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_ping_responder(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let notifier = Arc::clone(&self.notifier);
        let own_id = self.core.id.clone();
        let mut rx = self.notifier.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(Notification::Ping { target, from }) if target == own_id => {
                        let pong = Notification::Pong {
                            target: from,
                            from: own_id.clone(),
                        };
                        if let Err(e) = notifier.publish(&pong).await {
                            warn!("failed to answer ping: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_waiter_listener(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let mut rx = self.notifier.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(Notification::JobStatusChanged { job_id, status, .. })
                        if status.is_terminal() =>
                    {
                        let has_waiters = {
                            let waiters = core.waiters.lock().await;
                            waiters.contains_key(&job_id)
                        };
                        if !has_waiters {
                            continue;
                        }
                        // One fetch resolves every parked waiter for the id.
                        match core.jobs.get_job_by_id(&job_id).await {
                            Ok(job) => core.resolve_waiters(&job_id, job).await,
                            Err(e) => warn!("waiter fetch failed: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
