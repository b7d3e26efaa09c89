//! Persistence layer for duron.
//!
//! Two pools over one SQLite file: a read pool sized from the host's cores,
//! and a single-connection write pool that serialises every `BEGIN
//! IMMEDIATE` transaction. Jobs, steps and the notification outbox all live
//! behind this pair; multiple worker processes may share the file, which is
//! why the busy-retry path in [`retry`] exists at all.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// How long a connection waits for the SQLite write lock before surfacing
/// SQLITE_BUSY. Short transactions mean a long wait signals a wedged sibling
/// process; the busy-retry path handles the rest.
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Acquire timeout for the read pool.
const READ_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(15);

/// Acquire timeout for the write pool; writes queue behind one connection.
const WRITE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// WAL auto-checkpoint threshold in pages (~8MB at 4KB pages). The
/// notification outbox churns rows constantly; checkpointing in larger
/// strides keeps that churn off the read path.
const WAL_AUTOCHECKPOINT_PAGES: u32 = 2000;

/// Ceiling on journal growth between checkpoints.
const JOURNAL_SIZE_LIMIT_BYTES: u64 = 32 * 1024 * 1024;

/// Read pool sizing: WAL readers scale with cores until SQLite itself is the
/// bottleneck; eight connections covers the query surface (dashboards,
/// waiters, sync loops) of a busy worker.
pub fn default_read_pool_size() -> u32 {
    match std::thread::available_parallelism() {
        Ok(cores) => (cores.get() as u32).clamp(2, 8),
        Err(_) => 4,
    }
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(WRITE_LOCK_WAIT)
        .foreign_keys(true)
        .create_if_missing(true)
        .pragma("wal_autocheckpoint", WAL_AUTOCHECKPOINT_PAGES.to_string())
        .pragma("journal_size_limit", JOURNAL_SIZE_LIMIT_BYTES.to_string())
        .pragma("temp_store", "MEMORY"))
}

/// Open the read pool.
pub async fn open_read_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(READ_ACQUIRE_TIMEOUT)
        .connect_with(connect_options(database_url)?)
        .await?;

    debug!(max_connections, "read pool open (WAL)");
    Ok(pool)
}

/// Open the serialized write pool.
///
/// Every multi-statement transaction goes through this pool's single
/// connection, so only one connection per process ever competes for the
/// SQLite write lock.
pub async fn open_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(WRITE_ACQUIRE_TIMEOUT)
        .connect_with(connect_options(database_url)?)
        .await?;

    debug!("write pool open (single connection)");
    Ok(pool)
}

/// Apply embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    debug!("schema is current");
    Ok(())
}

/// A write transaction taken with `BEGIN IMMEDIATE`.
///
/// The write lock is claimed up front, so a transaction can never deadlock
/// trying to upgrade a read lock mid-flight. `commit`/`rollback` consume the
/// guard; a guard abandoned by error unwinding rolls its transaction back
/// before the pool reuses the connection.
pub struct WriteTxn {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTxn {
    /// Begin an immediate transaction on the write pool.
    pub async fn begin(pool: &WritePool) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    /// The transaction's connection, for executing statements.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn.as_mut().expect("write txn already finished")
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            // Connection state is unknown now; retire it.
            conn.close_on_drop();
            return Err(e);
        }
        Ok(())
    }

    /// Roll the transaction back.
    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            conn.close_on_drop();
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        // Abandoned mid-transaction: roll back asynchronously so the single
        // write connection survives; outside a runtime, retire it instead.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if sqlx::query("ROLLBACK").execute(&mut *conn).await.is_err() {
                        conn.close_on_drop();
                    }
                });
            }
            Err(_) => conn.close_on_drop(),
        }
    }
}
