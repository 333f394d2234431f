use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan: String,
    pub status: String,
    pub billing_period: String,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub can_use_trial: bool,
    pub cancel_at_period_end: bool,
    pub payment_past_due: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub device_trial_fingerprint: Option<String>,
    pub catalog_version: i32,
    pub external_subscription_id: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
