use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::models::quota::QuotaUsage;

/// Atomically counts one use of `feature` inside the window starting at
/// `period_start`. A row from an older window is reset to 1. Returns the new
/// count, or `None` when the limit was already reached. `limit` of -1 means
/// unlimited; callers must not pass 0.
pub async fn increment_usage<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    user_id: &Uuid,
    feature: &str,
    period_start: DateTime<Utc>,
    limit: i64,
) -> Res<Option<i64>> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO quota_usage (user_id, feature, period_start, count)
        VALUES ($1, $2, $3, 1)
        ON CONFLICT (user_id, feature) DO UPDATE SET
            count = CASE
                WHEN quota_usage.period_start < EXCLUDED.period_start THEN 1
                ELSE quota_usage.count + 1
            END,
            period_start = GREATEST(quota_usage.period_start, EXCLUDED.period_start)
        WHERE quota_usage.period_start < EXCLUDED.period_start
           OR $4 = -1
           OR quota_usage.count < $4
        RETURNING count
        "#,
    )
    .bind(user_id)
    .bind(feature)
    .bind(period_start)
    .bind(limit)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

pub async fn get_usage<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    user_id: &Uuid,
    feature: &str,
) -> Res<Option<QuotaUsage>> {
    sqlx::query_as::<_, QuotaUsage>(
        "SELECT * FROM quota_usage WHERE user_id = $1 AND feature = $2",
    )
    .bind(user_id)
    .bind(feature)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

/// Gives one use back, never going below zero. Rows from an older window are
/// left alone since they already read as zero.
pub async fn release_usage<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    user_id: &Uuid,
    feature: &str,
    period_start: DateTime<Utc>,
) -> Res<Option<i64>> {
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE quota_usage SET count = GREATEST(count - 1, 0)
        WHERE user_id = $1 AND feature = $2 AND period_start >= $3
        RETURNING count
        "#,
    )
    .bind(user_id)
    .bind(feature)
    .bind(period_start)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}
