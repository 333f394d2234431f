use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::{AppError, Res},
    misc::{BillingPeriod, PlanId},
};
use serde::Serialize;
use uuid::Uuid;

use crate::model::PaymentStatus;

/// What the engine asks the processor to sell.
#[derive(Debug, Clone)]
pub struct NewCheckout {
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub plan: PlanId,
    pub billing_period: BillingPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Open,
    Complete,
    Expired,
}

/// A checkout session as the processor reports it.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    pub id: String,
    pub url: Option<String>,
    pub status: RemoteStatus,
    pub payment_status: PaymentStatus,
    pub external_subscription_id: Option<String>,
    pub period_end: Option<DateTime<Utc>>,
    /// Echo of what the session was created for, read back from the
    /// processor's metadata.
    pub user_id: Option<Uuid>,
    pub plan: Option<PlanId>,
    pub billing_period: Option<BillingPeriod>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Verified processor events the engine acts on.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutCompleted(RemoteSession),
    /// A recurring charge went through. `period_end` is the end of the
    /// period the invoice paid for.
    PaymentSucceeded {
        external_subscription_id: String,
        period_end: DateTime<Utc>,
    },
    PaymentFailed {
        external_subscription_id: String,
    },
    Ignored(String),
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(&self, request: &NewCheckout) -> Res<RemoteSession>;

    async fn get_session(&self, session_id: &str) -> Res<RemoteSession>;

    async fn list_payments(&self, customer_id: &str, limit: u64) -> Res<Vec<Payment>>;

    /// Stops (or resumes) renewal of a processor subscription at the end of
    /// the current period.
    async fn set_cancel_at_period_end(
        &self,
        external_subscription_id: &str,
        cancel: bool,
    ) -> Res<()>;

    /// Moves a processor subscription to the price of another plan. The
    /// processor prorates the difference.
    async fn change_price(
        &self,
        external_subscription_id: &str,
        plan: PlanId,
        billing_period: BillingPeriod,
    ) -> Res<()>;
}

/// Bounds a processor call. A timeout surfaces as `ProcessorUnavailable`.
pub async fn bounded<T>(timeout: Duration, call: impl Future<Output = Res<T>>) -> Res<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::ProcessorUnavailable(format!(
            "no answer within {}s",
            timeout.as_secs_f32()
        ))),
    }
}
