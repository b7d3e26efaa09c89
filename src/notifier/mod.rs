//! Bidirectional event bus over the store.
//!
//! Durable half: the `notifications` outbox table, appended inside the same
//! transaction as the mutation it announces. Local half: a broadcast channel
//! fed by a background poller that tails the outbox by rowid. Delivery to
//! local subscribers is best-effort and at-least-once; the periodic pull loop
//! converges regardless of lost notifications.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::database::models::{JobStatus, JobStepStatus};
use crate::database::repositories::NotificationOutbox;
use crate::database::time::now_ms;
use crate::database::DbPool;
use crate::action::SerializedError;
use crate::Result;

/// Default outbox poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outbox rows older than this are pruned.
const RETENTION_MS: i64 = 60 * 60 * 1000;

/// Prune once every this many poll ticks.
const PRUNE_EVERY_TICKS: u64 = 600;

/// Broadcast channel capacity.
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobAvailablePayload {
    job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusChangedPayload {
    job_id: String,
    status: JobStatus,
    client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepStatusChangedPayload {
    job_id: String,
    step_id: String,
    status: JobStepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<SerializedError>,
    client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepDelayedPayload {
    job_id: String,
    step_id: String,
    delayed_ms: i64,
    error: SerializedError,
    client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LivenessPayload {
    from: String,
}

/// Events carried by the bus.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A CREATED job is available for admission.
    JobAvailable { job_id: String },
    /// A job changed status.
    JobStatusChanged {
        job_id: String,
        status: JobStatus,
        client_id: Option<String>,
    },
    /// A step reached a terminal status.
    StepStatusChanged {
        job_id: String,
        step_id: String,
        status: JobStepStatus,
        error: Option<SerializedError>,
        client_id: String,
    },
    /// A step failed an attempt and was delayed for retry.
    StepDelayed {
        job_id: String,
        step_id: String,
        delayed_ms: i64,
        error: SerializedError,
        client_id: String,
    },
    /// Liveness probe addressed to `target`.
    Ping { target: String, from: String },
    /// Liveness response addressed to `target`.
    Pong { target: String, from: String },
}

impl Notification {
    /// The wire topic string.
    pub fn topic(&self) -> String {
        match self {
            Self::JobAvailable { .. } => "job-available".to_string(),
            Self::JobStatusChanged { .. } => "job-status-changed".to_string(),
            Self::StepStatusChanged { .. } => "step-status-changed".to_string(),
            Self::StepDelayed { .. } => "step-delayed".to_string(),
            Self::Ping { target, .. } => format!("ping-{target}"),
            Self::Pong { target, .. } => format!("pong-{target}"),
        }
    }

    /// The wire payload (JSON object with camelCase fields).
    pub fn payload(&self) -> Result<String> {
        let json = match self {
            Self::JobAvailable { job_id } => serde_json::to_string(&JobAvailablePayload {
                job_id: job_id.clone(),
            })?,
            Self::JobStatusChanged {
                job_id,
                status,
                client_id,
            } => serde_json::to_string(&JobStatusChangedPayload {
                job_id: job_id.clone(),
                status: *status,
                client_id: client_id.clone(),
            })?,
            Self::StepStatusChanged {
                job_id,
                step_id,
                status,
                error,
                client_id,
            } => serde_json::to_string(&StepStatusChangedPayload {
                job_id: job_id.clone(),
                step_id: step_id.clone(),
                status: *status,
                error: error.clone(),
                client_id: client_id.clone(),
            })?,
            Self::StepDelayed {
                job_id,
                step_id,
                delayed_ms,
                error,
                client_id,
            } => serde_json::to_string(&StepDelayedPayload {
                job_id: job_id.clone(),
                step_id: step_id.clone(),
                delayed_ms: *delayed_ms,
                error: error.clone(),
                client_id: client_id.clone(),
            })?,
            Self::Ping { from, .. } | Self::Pong { from, .. } => {
                serde_json::to_string(&LivenessPayload { from: from.clone() })?
            }
        };
        Ok(json)
    }

    /// Decode an outbox row back into a notification. Unknown topics and
    /// malformed payloads yield `None`; the bus skips them.
    pub fn from_row(topic: &str, payload: &str) -> Option<Self> {
        match topic {
            "job-available" => {
                let p: JobAvailablePayload = serde_json::from_str(payload).ok()?;
                Some(Self::JobAvailable { job_id: p.job_id })
            }
            "job-status-changed" => {
                let p: JobStatusChangedPayload = serde_json::from_str(payload).ok()?;
                Some(Self::JobStatusChanged {
                    job_id: p.job_id,
                    status: p.status,
                    client_id: p.client_id,
                })
            }
            "step-status-changed" => {
                let p: StepStatusChangedPayload = serde_json::from_str(payload).ok()?;
                Some(Self::StepStatusChanged {
                    job_id: p.job_id,
                    step_id: p.step_id,
                    status: p.status,
                    error: p.error,
                    client_id: p.client_id,
                })
            }
            "step-delayed" => {
                let p: StepDelayedPayload = serde_json::from_str(payload).ok()?;
                Some(Self::StepDelayed {
                    job_id: p.job_id,
                    step_id: p.step_id,
                    delayed_ms: p.delayed_ms,
                    error: p.error,
                    client_id: p.client_id,
                })
            }
            _ => {
                if let Some(target) = topic.strip_prefix("ping-") {
                    let p: LivenessPayload = serde_json::from_str(payload).ok()?;
                    return Some(Self::Ping {
                        target: target.to_string(),
                        from: p.from,
                    });
                }
                if let Some(target) = topic.strip_prefix("pong-") {
                    let p: LivenessPayload = serde_json::from_str(payload).ok()?;
                    return Some(Self::Pong {
                        target: target.to_string(),
                        from: p.from,
                    });
                }
                None
            }
        }
    }
}

/// The event bus: outbox poller fanning into a broadcast channel.
pub struct Notifier {
    pool: DbPool,
    tx: broadcast::Sender<Notification>,
    poll_interval: Duration,
    poller: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Notifier {
    pub fn new(pool: DbPool, poll_interval: Duration) -> Arc<Self> {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            pool,
            tx,
            poll_interval,
            poller: parking_lot::Mutex::new(None),
        })
    }

    /// Subscribe to all notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish a notification through the outbox.
    ///
    /// Store mutations enqueue inside their own transactions; this entry
    /// point is for standalone events (liveness ping/pong).
    pub async fn publish(&self, notification: &Notification) -> Result<()> {
        NotificationOutbox::enqueue_pool(&self.pool, notification).await
    }

    /// Start tailing the outbox. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.poller.lock().is_some() {
            return Ok(());
        }

        // Deliver only rows written after startup; older rows belong to
        // previous lives of this or other clients.
        let cursor = NotificationOutbox::latest_id(&self.pool).await?;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            self.pool.clone(),
            self.tx.clone(),
            self.poll_interval,
            shutdown.clone(),
            cursor,
        ));

        let mut guard = self.poller.lock();
        if guard.is_some() {
            // Lost a start race; the first poller wins.
            handle.abort();
            return Ok(());
        }
        *guard = Some((shutdown, handle));
        Ok(())
    }

    /// Stop the poller and wait for it to exit. A later `start` resumes
    /// tailing from the current end of the outbox.
    pub async fn stop(&self) {
        let poller = self.poller.lock().take();
        if let Some((shutdown, handle)) = poller {
            shutdown.cancel();
            let _ = handle.await;
        }
    }
}

async fn poll_loop(
    pool: DbPool,
    tx: broadcast::Sender<Notification>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    mut cursor: i64,
) {
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match NotificationOutbox::fetch_after(&pool, cursor, 256).await {
            Ok(rows) => {
                for row in rows {
                    cursor = cursor.max(row.id);
                    match Notification::from_row(&row.topic, &row.payload) {
                        Some(notification) => {
                            // No receivers is fine; subscribers come and go.
                            let _ = tx.send(notification);
                        }
                        None => {
                            debug!("Skipping undecodable notification row {}", row.id);
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Notification poll failed: {}", e);
            }
        }

        ticks += 1;
        if ticks % PRUNE_EVERY_TICKS == 0 {
            let cutoff = now_ms() - RETENTION_MS;
            if let Err(e) = NotificationOutbox::prune_before(&pool, cutoff).await {
                warn!("Notification prune failed: {}", e);
            }
        }
    }
}
