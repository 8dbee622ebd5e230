use crate::errors::Result;
use crate::model::{DataPoint, Device, User};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

pub async fn get_device(pool: &PgPool, device_id: i64) -> Result<Option<Device>> {
    let device = sqlx::query_as::<_, Device>(
        "SELECT id, user_id, name, hashed_device_key, is_active, last_seen
         FROM devices WHERE id = $1",
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    Ok(device)
}

pub async fn get_user_by_username(pool: &PgPool, username: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, hashed_password FROM users WHERE username = $1",
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}

/// Ids of every active device, used to rebuild the broker subscription
/// registry at startup and on refresh.
pub async fn active_device_ids(pool: &PgPool) -> Result<Vec<i64>> {
    let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM devices WHERE is_active")
        .fetch_all(pool)
        .await?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// Inserts one telemetry record and returns it with its generated id. A
/// single INSERT, so the write either lands completely or not at all.
pub async fn insert_reading(
    pool: &PgPool,
    device_id: i64,
    reading_type: &str,
    value: f64,
    timestamp: DateTime<Utc>,
) -> Result<DataPoint> {
    let record = sqlx::query_as::<_, DataPoint>(
        "INSERT INTO device_data (device_id, reading_type, value, ts)
         VALUES ($1, $2, $3, $4)
         RETURNING id, device_id, reading_type, value, ts AS timestamp",
    )
    .bind(device_id)
    .bind(reading_type)
    .bind(value)
    .bind(timestamp)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// The only device-row mutation the ingestion path performs.
pub async fn touch_last_seen(pool: &PgPool, device_id: i64) -> Result<()> {
    sqlx::query("UPDATE devices SET last_seen = now() WHERE id = $1")
        .bind(device_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Most recent `limit` records for a device, newest first.
pub async fn last_n(pool: &PgPool, device_id: i64, limit: i64) -> Result<Vec<DataPoint>> {
    let records = sqlx::query_as::<_, DataPoint>(
        "SELECT id, device_id, reading_type, value, ts AS timestamp
         FROM device_data
         WHERE device_id = $1
         ORDER BY ts DESC
         LIMIT $2",
    )
    .bind(device_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// All records with `start <= ts <= end`, oldest first.
pub async fn range(
    pool: &PgPool,
    device_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<DataPoint>> {
    let records = sqlx::query_as::<_, DataPoint>(
        "SELECT id, device_id, reading_type, value, ts AS timestamp
         FROM device_data
         WHERE device_id = $1 AND ts >= $2 AND ts <= $3
         ORDER BY ts ASC",
    )
    .bind(device_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(records)
}
