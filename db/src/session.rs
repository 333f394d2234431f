use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use sqlx::{Executor, Postgres};

use crate::models::session::CheckoutSession;

pub async fn insert_session<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    data: &CheckoutSession,
) -> Res<CheckoutSession> {
    sqlx::query_as::<_, CheckoutSession>(
        r#"
        INSERT INTO checkout_sessions
            (session_id, user_id, target_plan, billing_period, status, payment_status, redirect_url, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(&data.session_id)
    .bind(data.user_id)
    .bind(&data.target_plan)
    .bind(&data.billing_period)
    .bind(&data.status)
    .bind(&data.payment_status)
    .bind(&data.redirect_url)
    .bind(data.created_at)
    .fetch_one(executor)
    .await
    .map_err(AppError::from)
}

pub async fn get_session<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    session_id: &str,
) -> Res<Option<CheckoutSession>> {
    sqlx::query_as::<_, CheckoutSession>("SELECT * FROM checkout_sessions WHERE session_id = $1")
        .bind(session_id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::from)
}

pub async fn update_session_status<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    session_id: &str,
    status: &str,
    payment_status: &str,
    reconciled_at: Option<DateTime<Utc>>,
) -> Res<Option<CheckoutSession>> {
    sqlx::query_as::<_, CheckoutSession>(
        r#"
        UPDATE checkout_sessions
        SET status = $2, payment_status = $3, reconciled_at = COALESCE(reconciled_at, $4)
        WHERE session_id = $1
        RETURNING *
        "#,
    )
    .bind(session_id)
    .bind(status)
    .bind(payment_status)
    .bind(reconciled_at)
    .fetch_optional(executor)
    .await
    .map_err(AppError::from)
}
