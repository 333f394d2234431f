use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::misc::{BillingPeriod, PlanId};
use uuid::Uuid;

/// User-facing lifecycle events. Delivery (push, email) happens outside
/// this service.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    TrialStarted {
        plan: PlanId,
        trial_ends_at: DateTime<Utc>,
    },
    Activated {
        plan: PlanId,
        billing_period: BillingPeriod,
    },
    Canceled {
        access_ends_at: Option<DateTime<Utc>>,
    },
    Reactivated,
    PlanChanged {
        from: PlanId,
        to: PlanId,
    },
    Renewed {
        period_end: DateTime<Utc>,
    },
    PaymentFailed,
    Expired {
        plan: PlanId,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Best effort: failures are the notifier's to log, never the caller's.
    async fn notify(&self, user_id: &Uuid, notification: &Notification);
}

/// Writes notifications to the application log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &Uuid, notification: &Notification) {
        log::info!("Notify user {}: {:?}", user_id, notification);
    }
}
