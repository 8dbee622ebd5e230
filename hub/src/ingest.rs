use crate::db;
use crate::errors::{Error, Result};
use crate::metrics::{DB_FAILURES_TOTAL, INGEST_LATENCY_SECONDS};
use crate::model::{DataPoint, ReadingIn};
use crate::validate::validate;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// One reading handed off from the broker adapter, already authenticated
/// against the topic's device id.
#[derive(Debug)]
pub struct IngestJob {
    pub device_id: i64,
    pub reading: ReadingIn,
}

/// The single point of convergence for both transports: authorize against
/// current device state, normalize, persist, return the stored record.
///
/// A verified token is not enough on its own; the device is re-fetched so
/// a reading for a deleted or deactivated device is refused even while
/// its token is still cryptographically valid.
pub async fn ingest(pool: &PgPool, device_id: i64, reading: ReadingIn) -> Result<DataPoint> {
    let device = db::get_device(pool, device_id)
        .await?
        .ok_or(Error::Forbidden)?;

    if !device.is_active {
        return Err(Error::Forbidden);
    }

    validate(&reading)?;

    let timestamp = reading.timestamp.unwrap_or_else(Utc::now);

    let start = Instant::now();
    let record = db::insert_reading(pool, device_id, &reading.reading_type, reading.value, timestamp)
        .await
        .map_err(|e| {
            DB_FAILURES_TOTAL.inc();
            e
        })?;
    INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

    // The record is already stored; a failed last_seen bump is not worth
    // failing the request over.
    if let Err(e) = db::touch_last_seen(pool, device_id).await {
        warn!("Failed to update last_seen for device {}: {}", device_id, e);
    }

    Ok(record)
}

/// Drains the broker handoff channel. A single consumer keeps readings in
/// arrival order, which preserves per-topic FIFO. Failures are logged and
/// the message dropped: the broker path is at-most-once and has no
/// response channel to signal into.
pub async fn run_ingest_worker(mut rx: mpsc::Receiver<IngestJob>, pool: PgPool) {
    info!("Starting ingest worker");

    while let Some(job) = rx.recv().await {
        match ingest(&pool, job.device_id, job.reading).await {
            Ok(record) => {
                debug!(
                    "Stored reading {} for device {} ({})",
                    record.id, record.device_id, record.reading_type
                );
            }
            Err(e) if e.is_retryable() => {
                error!("Dropping reading for device {}: {}", job.device_id, e);
            }
            Err(e) => {
                warn!("Rejected reading for device {}: {}", job.device_id, e);
            }
        }
    }

    info!("Ingest worker stopped: channel closed");
}
