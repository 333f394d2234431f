use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct QuotaUsage {
    pub user_id: Uuid,
    pub feature: String,
    pub period_start: DateTime<Utc>,
    pub count: i64,
}
