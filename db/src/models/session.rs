use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub target_plan: String,
    pub billing_period: String,
    pub status: String,
    pub payment_status: String,
    pub redirect_url: String,
    pub created_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
}
