//! Repository layer: atomic state transitions and queries over the pools.

pub mod job;
pub mod job_step;
pub mod notification_outbox;

pub use job::{JobRepository, SqlxJobRepository};
pub use job_step::{JobStepRepository, SqlxJobStepRepository};
pub use notification_outbox::NotificationOutbox;
