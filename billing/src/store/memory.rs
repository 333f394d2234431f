use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    error::{AppError, Res},
    misc::SubscriptionStatus,
};
use dashmap::{DashMap, mapref::entry::Entry};
use uuid::Uuid;

use super::{BillingStore, TrialWrite};
use crate::model::{
    CheckoutSession, DeviceTrial, Feature, PaymentStatus, QuotaUsage, SessionStatus, Subscription,
};

/// In-process store backed by sharded concurrent maps. Used by tests and by
/// local runs without a database. Every operation holds the shard lock of
/// the row it touches, which gives the same atomicity as the row-level
/// statements of the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    subscriptions: DashMap<Uuid, Subscription>,
    device_trials: DashMap<String, DeviceTrial>,
    usage: DashMap<(Uuid, Feature), QuotaUsage>,
    sessions: DashMap<String, CheckoutSession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_trial(&self, device_fingerprint: &str) -> Option<DeviceTrial> {
        self.device_trials
            .get(device_fingerprint)
            .map(|trial| trial.clone())
    }
}

fn bump(next: &Subscription) -> Subscription {
    let mut stored = next.clone();
    stored.version = next.version + 1;
    stored
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_subscription(&self, user_id: &Uuid) -> Res<Option<Subscription>> {
        Ok(self.subscriptions.get(user_id).map(|sub| sub.clone()))
    }

    async fn get_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Res<Option<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .find(|sub| sub.external_subscription_id.as_deref() == Some(external_subscription_id))
            .map(|sub| sub.clone()))
    }

    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Res<Option<Subscription>> {
        match self.subscriptions.entry(subscription.user_id) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(vacant) => Ok(Some(vacant.insert(subscription.clone()).clone())),
        }
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Res<Option<Subscription>> {
        let Some(mut stored) = self.subscriptions.get_mut(&subscription.user_id) else {
            return Err(AppError::NotFound(format!(
                "Subscription for user {}",
                subscription.user_id
            )));
        };
        if stored.version != subscription.version {
            return Ok(None);
        }
        *stored = bump(subscription);
        Ok(Some(stored.clone()))
    }

    async fn expirable_user_ids(&self, now: DateTime<Utc>) -> Res<Vec<Uuid>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|sub| match sub.status {
                SubscriptionStatus::Trialing => sub.trial_ends_at.is_some_and(|end| end < now),
                SubscriptionStatus::Canceling => {
                    sub.current_period_end.is_some_and(|end| end < now)
                }
                SubscriptionStatus::Expired => true,
                _ => false,
            })
            .map(|sub| sub.user_id)
            .collect())
    }

    async fn device_trial_used(&self, device_fingerprint: &str) -> Res<bool> {
        Ok(self.device_trials.contains_key(device_fingerprint))
    }

    async fn start_trial(
        &self,
        subscription: &Subscription,
        trial: &DeviceTrial,
    ) -> Res<TrialWrite> {
        // lock order: device record, then subscription
        let vacant = match self.device_trials.entry(trial.device_fingerprint.clone()) {
            Entry::Occupied(_) => return Ok(TrialWrite::DeviceUsed),
            Entry::Vacant(vacant) => vacant,
        };
        let Some(mut stored) = self.subscriptions.get_mut(&subscription.user_id) else {
            return Err(AppError::NotFound(format!(
                "Subscription for user {}",
                subscription.user_id
            )));
        };
        if stored.version != subscription.version {
            return Ok(TrialWrite::Conflict);
        }
        *stored = bump(subscription);
        vacant.insert(trial.clone());
        Ok(TrialWrite::Written(stored.clone()))
    }

    async fn increment_usage(
        &self,
        user_id: &Uuid,
        feature: Feature,
        period_start: DateTime<Utc>,
        limit: i64,
    ) -> Res<Option<i64>> {
        let mut usage = self
            .usage
            .entry((*user_id, feature))
            .or_insert_with(|| QuotaUsage {
                user_id: *user_id,
                feature,
                period_start,
                count: 0,
            });
        if usage.period_start < period_start {
            usage.period_start = period_start;
            usage.count = 0;
        }
        if limit >= 0 && usage.count >= limit {
            return Ok(None);
        }
        usage.count += 1;
        Ok(Some(usage.count))
    }

    async fn get_usage(&self, user_id: &Uuid, feature: Feature) -> Res<Option<QuotaUsage>> {
        Ok(self.usage.get(&(*user_id, feature)).map(|usage| usage.clone()))
    }

    async fn release_usage(
        &self,
        user_id: &Uuid,
        feature: Feature,
        period_start: DateTime<Utc>,
    ) -> Res<Option<i64>> {
        let Some(mut usage) = self.usage.get_mut(&(*user_id, feature)) else {
            return Ok(None);
        };
        if usage.period_start < period_start {
            return Ok(None);
        }
        usage.count = (usage.count - 1).max(0);
        Ok(Some(usage.count))
    }

    async fn insert_session(&self, session: &CheckoutSession) -> Res<CheckoutSession> {
        match self.sessions.entry(session.session_id.clone()) {
            Entry::Occupied(_) => Err(AppError::Internal(format!(
                "Checkout session {} already recorded",
                session.session_id
            ))),
            Entry::Vacant(vacant) => Ok(vacant.insert(session.clone()).clone()),
        }
    }

    async fn get_session(&self, session_id: &str) -> Res<Option<CheckoutSession>> {
        Ok(self.sessions.get(session_id).map(|session| session.clone()))
    }

    async fn update_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        payment_status: PaymentStatus,
        reconciled_at: Option<DateTime<Utc>>,
    ) -> Res<Option<CheckoutSession>> {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        session.status = status;
        session.payment_status = payment_status;
        session.reconciled_at = session.reconciled_at.or(reconciled_at);
        Ok(Some(session.clone()))
    }
}
