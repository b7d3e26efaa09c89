//! # duron
//!
//! A durable, type-safe job-queue engine backed by SQLite.
//!
//! Producers enqueue jobs that target named actions; worker clients claim
//! jobs under group-aware concurrency admission, execute their handlers, and
//! record step-level progress for resumability. Execution is at-least-once
//! with at-most-once step effects: steps are keyed by `(job, name)` and
//! recovered idempotently after crashes.
//!
//! ```no_run
//! use duron::{Action, ActionContext, Client, ClientConfig, JobResult};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct GreetInput {
//!     name: String,
//! }
//!
//! struct Greet;
//!
//! #[async_trait::async_trait]
//! impl Action for Greet {
//!     type Input = GreetInput;
//!     type Output = String;
//!     type Vars = ();
//!
//!     fn name(&self) -> &str {
//!         "greet"
//!     }
//!
//!     async fn handle(&self, ctx: ActionContext<GreetInput, ()>) -> JobResult<String> {
//!         let upper = ctx
//!             .step("uppercase", {
//!                 let name = ctx.input.name.clone();
//!                 move |_token| {
//!                     let name = name.clone();
//!                     async move { Ok(name.to_uppercase()) }
//!                 }
//!             })
//!             .await?;
//!         Ok(format!("hello, {upper}"))
//!     }
//! }
//!
//! # async fn run() -> duron::Result<()> {
//! let client = Client::connect("sqlite:duron.db?mode=rwc", ClientConfig::default()).await?;
//! client.register(Greet)?;
//! client.start().await?;
//! let job_id = client
//!     .run_action("greet", serde_json::json!({"name": "world"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod client;
pub mod database;
pub mod error;
pub mod notifier;
pub mod worker;

pub use action::{
    Action, ActionContext, JobError, JobResult, RetryPolicy, SerializedError, StepOptions,
    StepSettings, DEFAULT_GROUP_KEY,
};
pub use client::{ActionMetadata, Client, ClientConfig, SyncPattern, WaitOptions};
pub use database::models::{
    ActionSummary, JobCounts, JobDbModel, JobFilters, JobSort, JobSortField, JobStatus,
    JobStepDbModel, JobStepStatus, Pagination, SortDirection,
};
pub use error::{Error, Result};
pub use notifier::{Notification, Notifier};
