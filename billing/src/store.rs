use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::Res;
use uuid::Uuid;

use crate::model::{
    CheckoutSession, DeviceTrial, Feature, PaymentStatus, QuotaUsage, SessionStatus, Subscription,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Result of the combined "record device, start trial" write.
#[derive(Debug)]
pub enum TrialWrite {
    Written(Subscription),
    /// The device fingerprint already has a trial record. Nothing was written.
    DeviceUsed,
    /// The subscription version moved on. Nothing was written.
    Conflict,
}

/// Persistence seam of the engine.
///
/// Subscription updates are compare-and-swap on `Subscription::version`: the
/// write succeeds only if the stored version still equals the one passed in,
/// and the stored row comes back with its version bumped.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_subscription(&self, user_id: &Uuid) -> Res<Option<Subscription>>;

    async fn get_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Res<Option<Subscription>>;

    /// Inserts a fresh row. `None` when the user already has one.
    async fn insert_subscription(&self, subscription: &Subscription)
    -> Res<Option<Subscription>>;

    /// `None` on version conflict.
    async fn update_subscription(&self, subscription: &Subscription)
    -> Res<Option<Subscription>>;

    async fn expirable_user_ids(&self, now: DateTime<Utc>) -> Res<Vec<Uuid>>;

    async fn device_trial_used(&self, device_fingerprint: &str) -> Res<bool>;

    /// Records the device trial and writes the trialing subscription as one
    /// unit. Either both land or neither does.
    async fn start_trial(&self, subscription: &Subscription, trial: &DeviceTrial)
    -> Res<TrialWrite>;

    /// Counts one use in the window starting at `period_start`, resetting an
    /// older window. Returns the new count or `None` when `limit` is reached.
    async fn increment_usage(
        &self,
        user_id: &Uuid,
        feature: Feature,
        period_start: DateTime<Utc>,
        limit: i64,
    ) -> Res<Option<i64>>;

    async fn get_usage(&self, user_id: &Uuid, feature: Feature) -> Res<Option<QuotaUsage>>;

    /// Saturating decrement inside the current window. `None` when there is
    /// nothing counted in that window.
    async fn release_usage(
        &self,
        user_id: &Uuid,
        feature: Feature,
        period_start: DateTime<Utc>,
    ) -> Res<Option<i64>>;

    async fn insert_session(&self, session: &CheckoutSession) -> Res<CheckoutSession>;

    async fn get_session(&self, session_id: &str) -> Res<Option<CheckoutSession>>;

    async fn update_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        payment_status: PaymentStatus,
        reconciled_at: Option<DateTime<Utc>>,
    ) -> Res<Option<CheckoutSession>>;
}
