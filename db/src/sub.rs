use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres};
use uuid::Uuid;

use crate::models::sub::Subscription;

pub async fn get_subscription<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    user_id: &Uuid,
) -> Res<Option<Subscription>> {
    sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::from)
}

pub async fn get_subscription_by_external_id<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    external_subscription_id: &str,
) -> Res<Option<Subscription>> {
    sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE external_subscription_id = $1",
    )
    .bind(external_subscription_id)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

/// Inserts the default FREE row. Returns `None` when another request created
/// the row first.
pub async fn insert_subscription<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    user_id: &Uuid,
    catalog_version: i32,
) -> Res<Option<Subscription>> {
    sqlx::query_as::<_, Subscription>(
        r#"
        INSERT INTO subscriptions (user_id, catalog_version)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(catalog_version)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

/// Compare-and-swap write keyed on `data.version`. Returns `None` when the
/// stored version moved on, leaving the row untouched.
pub async fn update_subscription<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    data: &Subscription,
) -> Res<Option<Subscription>> {
    sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions SET
            plan = $3,
            status = $4,
            billing_period = $5,
            trial_started_at = $6,
            trial_ends_at = $7,
            can_use_trial = $8,
            cancel_at_period_end = $9,
            current_period_end = $10,
            device_trial_fingerprint = $11,
            catalog_version = $12,
            external_subscription_id = $13,
            payment_past_due = $14,
            version = version + 1,
            updated_at = NOW()
        WHERE user_id = $1 AND version = $2
        RETURNING *
        "#,
    )
    .bind(data.user_id)
    .bind(data.version)
    .bind(&data.plan)
    .bind(&data.status)
    .bind(&data.billing_period)
    .bind(data.trial_started_at)
    .bind(data.trial_ends_at)
    .bind(data.can_use_trial)
    .bind(data.cancel_at_period_end)
    .bind(data.current_period_end)
    .bind(&data.device_trial_fingerprint)
    .bind(data.catalog_version)
    .bind(&data.external_subscription_id)
    .bind(data.payment_past_due)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}

/// Users whose trial or paid period has lapsed, or who are parked in EXPIRED.
pub async fn get_expirable_user_ids<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    now: DateTime<Utc>,
) -> Res<Vec<Uuid>> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT user_id FROM subscriptions
        WHERE (status = 'TRIALING' AND trial_ends_at < $1)
           OR (status = 'CANCELING' AND current_period_end < $1)
           OR status = 'EXPIRED'
        "#,
    )
    .bind(now)
    .fetch_all(executor)
    .await
    .map_err(AppError::from)
}
