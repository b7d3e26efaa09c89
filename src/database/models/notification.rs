//! Notification outbox row model.

use sqlx::FromRow;

/// A row in the notification outbox table.
///
/// The outbox is the durable half of the pub/sub channel: every mutation that
/// must be observable enqueues a row inside its own transaction, and each
/// client tails the table by rowid.
#[derive(Debug, Clone, FromRow)]
pub struct NotificationDbModel {
    pub id: i64,
    pub topic: String,
    pub payload: String,
    pub created_at: i64,
}
