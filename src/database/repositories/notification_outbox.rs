//! Notification outbox operations.
//!
//! Transaction-aware enqueue keeps database changes and their notifications
//! atomic; the poller side tails the table by rowid.

use sqlx::{SqliteConnection, SqlitePool};

use crate::database::models::NotificationDbModel;
use crate::database::time::now_ms;
use crate::notifier::Notification;
use crate::Result;

/// Outbox operations for the notification channel.
pub struct NotificationOutbox;

impl NotificationOutbox {
    /// Enqueue a notification within an existing transaction.
    ///
    /// Does NOT commit; the caller owns the transaction.
    pub async fn enqueue(conn: &mut SqliteConnection, notification: &Notification) -> Result<()> {
        let payload = notification.payload()?;
        sqlx::query("INSERT INTO notifications (topic, payload, created_at) VALUES (?, ?, ?)")
            .bind(notification.topic())
            .bind(payload)
            .bind(now_ms())
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Enqueue a standalone notification (own implicit transaction).
    pub async fn enqueue_pool(pool: &SqlitePool, notification: &Notification) -> Result<()> {
        let payload = notification.payload()?;
        sqlx::query("INSERT INTO notifications (topic, payload, created_at) VALUES (?, ?, ?)")
            .bind(notification.topic())
            .bind(payload)
            .bind(now_ms())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// The highest rowid currently in the outbox (0 when empty).
    pub async fn latest_id(pool: &SqlitePool) -> Result<i64> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM notifications")
            .fetch_one(pool)
            .await?;
        Ok(id.unwrap_or(0))
    }

    /// Fetch rows with id greater than the cursor, oldest first.
    pub async fn fetch_after(
        pool: &SqlitePool,
        cursor: i64,
        limit: i32,
    ) -> Result<Vec<NotificationDbModel>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            "SELECT id, topic, payload, created_at FROM notifications WHERE id > ? ORDER BY id LIMIT ?",
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Delete rows older than the cutoff. The outbox is a channel, not an
    /// audit log; old rows are safe to delete.
    pub async fn prune_before(pool: &SqlitePool, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notifications WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_db;

    #[tokio::test]
    async fn test_enqueue_and_tail() {
        let (_dir, pool, _write_pool) = temp_db().await;

        let start = NotificationOutbox::latest_id(&pool).await.unwrap();

        NotificationOutbox::enqueue_pool(
            &pool,
            &Notification::JobAvailable {
                job_id: "j1".into(),
            },
        )
        .await
        .unwrap();
        NotificationOutbox::enqueue_pool(
            &pool,
            &Notification::Ping {
                target: "c2".into(),
                from: "c1".into(),
            },
        )
        .await
        .unwrap();

        let rows = NotificationOutbox::fetch_after(&pool, start, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].topic, "job-available");
        assert_eq!(rows[1].topic, "ping-c2");

        // Tail past the end yields nothing.
        let last = rows[1].id;
        assert!(NotificationOutbox::fetch_after(&pool, last, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_prune() {
        let (_dir, pool, _write_pool) = temp_db().await;

        sqlx::query("INSERT INTO notifications (topic, payload, created_at) VALUES (?, ?, ?)")
            .bind("job-available")
            .bind("{}")
            .bind(1_000i64)
            .execute(&pool)
            .await
            .unwrap();
        NotificationOutbox::enqueue_pool(
            &pool,
            &Notification::JobAvailable {
                job_id: "fresh".into(),
            },
        )
        .await
        .unwrap();

        let deleted = NotificationOutbox::prune_before(&pool, now_ms() - 60_000)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining = NotificationOutbox::fetch_after(&pool, 0, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].payload.contains("fresh"));
    }
}
