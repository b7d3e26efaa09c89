//! Database models for duron.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod job;
pub mod job_step;
pub mod notification;

pub use job::*;
pub use job_step::*;
pub use notification::*;
