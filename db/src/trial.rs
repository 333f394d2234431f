use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres};
use uuid::Uuid;

pub async fn exists_device_trial<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    device_fingerprint: &str,
) -> Res<bool> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM device_trials WHERE device_fingerprint = $1)",
    )
    .bind(device_fingerprint)
    .fetch_one(executor)
    .await
    .map_err(AppError::from)
}

/// Records the device as having used its trial. Returns `false` when the
/// fingerprint was already recorded.
pub async fn insert_device_trial<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    device_fingerprint: &str,
    user_id: &Uuid,
    platform: &str,
    used_at: DateTime<Utc>,
) -> Res<bool> {
    sqlx::query(
        r#"
        INSERT INTO device_trials (device_fingerprint, user_id, platform, used_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (device_fingerprint) DO NOTHING
        "#,
    )
    .bind(device_fingerprint)
    .bind(user_id)
    .bind(platform)
    .bind(used_at)
    .execute(executor)
    .await
    .map(|result| result.rows_affected() == 1)
    .map_err(AppError::from)
}
