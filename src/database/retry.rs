//! SQLITE_BUSY handling for cross-process writers.
//!
//! Within one process the serialized write pool removes write contention at
//! the source, so SQLITE_BUSY only appears when sibling worker processes
//! share the database file. Their transactions (admission, retry, recovery,
//! step writes) are all short, so busy windows are short too: the schedule
//! starts retrying almost immediately, doubles with full jitter so two
//! contending workers cannot fall into lockstep, and gives up after a fixed
//! budget — by then the pull loop is a better recovery path than more
//! spinning.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::trace;

use crate::{Error, Result};

/// First retry delay.
const FIRST_DELAY: Duration = Duration::from_millis(5);

/// Per-retry delay ceiling.
const MAX_DELAY: Duration = Duration::from_millis(250);

/// Total time spent retrying before the busy error surfaces to the caller.
/// Kept well under the default pull interval so a stuck claim cycle never
/// swallows a whole sync tick.
const RETRY_BUDGET: Duration = Duration::from_secs(3);

/// SQLite primary result codes for a held write lock.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

fn is_write_lock_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };
    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            matches!(
                db_err.code().as_deref(),
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)
            ) || db_err.message().to_ascii_lowercase().contains("locked")
        }
        other => other.to_string().to_ascii_lowercase().contains("locked"),
    }
}

/// Run `f` until it succeeds, the error is not a held write lock, or the
/// retry budget runs out.
pub async fn with_busy_retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = tokio::time::Instant::now();
    let mut delay = FIRST_DELAY;

    loop {
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_write_lock_error(&err) || started.elapsed() + delay > RETRY_BUDGET {
            return Err(err);
        }

        let jitter_ms = rand::rng().random_range(1..=delay.as_millis() as u64);
        trace!(op, delay_ms = jitter_ms, "write lock held elsewhere, backing off");
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        delay = (delay * 2).min(MAX_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_lock_errors_surface_immediately() {
        let mut calls = 0u32;
        let result: Result<()> = with_busy_retry("probe", || {
            calls += 1;
            async { Err(Error::Other("no table".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let value = with_busy_retry("probe", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
