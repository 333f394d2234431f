//! Subscription state machine.
//!
//! ```text
//! FREE -> TRIALING -> ACTIVE -> CANCELING -> EXPIRED -> FREE
//!            |           ^          |
//!            +-----------+          +-> ACTIVE (reactivate)
//! ```
//!
//! Every mutation runs the same loop: read the row, lazily expire it, apply
//! the pure [`apply`] transition and compare-and-swap the result. A version
//! conflict re-reads and re-applies, so concurrent requests from several
//! devices and the webhook channel serialize per user without locks.
//!
//! Cancel, reactivate and plan changes on a processor-backed subscription are
//! pushed to the processor before the write. A processor failure leaves the
//! row untouched.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Months, Utc};
use common::{
    error::{AppError, Res},
    misc::{BillingPeriod, PlanId, SubscriptionStatus},
};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    catalog,
    clock::Clock,
    directory::UserDirectory,
    model::{DeviceTrial, Subscription},
    notifier::{Notification, Notifier},
    processor::{self, PaymentProcessor},
    store::{BillingStore, TrialWrite},
    trial::{TrialGuard, normalize_fingerprint},
};

const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartTrial {
        plan: PlanId,
        device_fingerprint: String,
        platform: String,
    },
    CompleteCheckout {
        plan: PlanId,
        billing_period: BillingPeriod,
        period_end: DateTime<Utc>,
        external_subscription_id: Option<String>,
    },
    Cancel,
    Reactivate,
    ChangePlan {
        plan: PlanId,
        billing_period: BillingPeriod,
    },
    Renew {
        period_end: DateTime<Utc>,
    },
    PaymentFailed,
    Expire,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::StartTrial { .. } => "start trial",
            Action::CompleteCheckout { .. } => "complete checkout",
            Action::Cancel => "cancel",
            Action::Reactivate => "reactivate",
            Action::ChangePlan { .. } => "change plan",
            Action::Renew { .. } => "renew",
            Action::PaymentFailed => "record failed payment",
            Action::Expire => "expire",
        }
    }
}

/// Tagged result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The transition was written.
    Applied(Subscription),
    /// The subscription was already in the requested state. Nothing written.
    AlreadyApplied(Subscription),
    /// The request was well-formed but cannot apply (e.g. a stale period end).
    Rejected(String),
}

impl Outcome {
    pub fn subscription(&self) -> Option<&Subscription> {
        match self {
            Outcome::Applied(sub) | Outcome::AlreadyApplied(sub) => Some(sub),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn into_subscription(self) -> Res<Subscription> {
        match self {
            Outcome::Applied(sub) | Outcome::AlreadyApplied(sub) => Ok(sub),
            Outcome::Rejected(reason) => Err(AppError::Unprocessable(reason)),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Step {
    Apply(Subscription, Notification),
    Noop,
    Reject(String),
}

/// Whether the subscription's trial or paid window has run out.
pub fn is_due(sub: &Subscription, now: DateTime<Utc>) -> bool {
    match sub.status {
        SubscriptionStatus::Trialing | SubscriptionStatus::Canceling => {
            sub.access_ends_at().is_none_or(|end| now >= end)
        }
        SubscriptionStatus::Expired => true,
        SubscriptionStatus::Free | SubscriptionStatus::Active => false,
    }
}

/// The FREE row a lapsed subscription falls back to, or `None` when it has
/// not lapsed. Trial eligibility is left as it was.
pub fn expire_if_due(sub: &Subscription, now: DateTime<Utc>) -> Option<Subscription> {
    if !is_due(sub, now) {
        return None;
    }
    let mut next = sub.clone();
    next.plan = PlanId::Free;
    next.status = SubscriptionStatus::Free;
    next.billing_period = BillingPeriod::Monthly;
    next.trial_started_at = None;
    next.trial_ends_at = None;
    next.cancel_at_period_end = false;
    next.payment_past_due = false;
    next.current_period_end = None;
    next.external_subscription_id = None;
    Some(next)
}

/// Pure transition function. `sub` must already be lazily expired.
pub(crate) fn apply(
    sub: &Subscription,
    action: &Action,
    now: DateTime<Utc>,
    trial_days: i64,
) -> Res<Step> {
    let mut next = sub.clone();
    match action {
        Action::StartTrial {
            plan,
            device_fingerprint,
            ..
        } => {
            let fingerprint = normalize_fingerprint(device_fingerprint)?;
            if !plan.is_paid() {
                return Err(AppError::Unprocessable(
                    "Trials are only offered on paid plans".to_string(),
                ));
            }
            if !sub.can_use_trial {
                return Err(AppError::TrialNotEligible(
                    "this account has already used its free trial".to_string(),
                ));
            }
            if sub.status != SubscriptionStatus::Free {
                return Err(AppError::invalid_transition(action.name(), sub.status));
            }
            let trial_ends_at = now + Duration::days(trial_days);
            next.plan = *plan;
            next.status = SubscriptionStatus::Trialing;
            next.billing_period = BillingPeriod::Monthly;
            next.trial_started_at = Some(now);
            next.trial_ends_at = Some(trial_ends_at);
            next.can_use_trial = false;
            next.cancel_at_period_end = false;
            next.current_period_end = None;
            next.device_trial_fingerprint = Some(fingerprint);
            Ok(Step::Apply(
                next,
                Notification::TrialStarted {
                    plan: *plan,
                    trial_ends_at,
                },
            ))
        }

        Action::CompleteCheckout {
            plan,
            billing_period,
            period_end,
            external_subscription_id,
        } => {
            if !plan.is_paid() {
                return Ok(Step::Reject("the free plan cannot be purchased".to_string()));
            }
            if *period_end <= now {
                return Ok(Step::Reject(format!(
                    "period end {} is not in the future",
                    period_end
                )));
            }
            if sub.status == SubscriptionStatus::Active
                && sub.plan == *plan
                && sub.billing_period == *billing_period
            {
                return Ok(Step::Noop);
            }
            next.plan = *plan;
            next.status = SubscriptionStatus::Active;
            next.billing_period = *billing_period;
            next.cancel_at_period_end = false;
            next.payment_past_due = false;
            next.current_period_end = Some(*period_end);
            if external_subscription_id.is_some() {
                next.external_subscription_id = external_subscription_id.clone();
            }
            Ok(Step::Apply(
                next,
                Notification::Activated {
                    plan: *plan,
                    billing_period: *billing_period,
                },
            ))
        }

        Action::Cancel => match sub.status {
            SubscriptionStatus::Active => {
                next.status = SubscriptionStatus::Canceling;
                next.cancel_at_period_end = true;
                Ok(Step::Apply(
                    next,
                    Notification::Canceled {
                        access_ends_at: sub.current_period_end,
                    },
                ))
            }
            SubscriptionStatus::Trialing if !sub.cancel_at_period_end => {
                next.cancel_at_period_end = true;
                Ok(Step::Apply(
                    next,
                    Notification::Canceled {
                        access_ends_at: sub.trial_ends_at,
                    },
                ))
            }
            // a lapse after a failed charge becomes a cancellation the user owns
            SubscriptionStatus::Canceling if sub.payment_past_due => {
                next.payment_past_due = false;
                Ok(Step::Apply(
                    next,
                    Notification::Canceled {
                        access_ends_at: sub.current_period_end,
                    },
                ))
            }
            SubscriptionStatus::Trialing | SubscriptionStatus::Canceling => Ok(Step::Noop),
            status => Err(AppError::invalid_transition(action.name(), status)),
        },

        Action::Reactivate => {
            let window_open = sub.access_ends_at().is_some_and(|end| now < end);
            if !sub.cancel_at_period_end || !window_open {
                return Err(AppError::invalid_transition(action.name(), sub.status));
            }
            match sub.status {
                SubscriptionStatus::Canceling => next.status = SubscriptionStatus::Active,
                SubscriptionStatus::Trialing => {}
                status => return Err(AppError::invalid_transition(action.name(), status)),
            }
            next.cancel_at_period_end = false;
            next.payment_past_due = false;
            Ok(Step::Apply(next, Notification::Reactivated))
        }

        Action::ChangePlan {
            plan,
            billing_period,
        } => {
            if !plan.is_paid() {
                return Err(AppError::Unprocessable(
                    "Cancel the subscription to return to the free plan".to_string(),
                ));
            }
            match sub.status {
                SubscriptionStatus::Active | SubscriptionStatus::Trialing => {}
                status => return Err(AppError::invalid_transition(action.name(), status)),
            }
            if sub.plan == *plan && sub.billing_period == *billing_period {
                return Ok(Step::Noop);
            }
            next.plan = *plan;
            next.billing_period = *billing_period;
            Ok(Step::Apply(
                next,
                Notification::PlanChanged {
                    from: sub.plan,
                    to: *plan,
                },
            ))
        }

        Action::Renew { period_end } => match sub.status {
            SubscriptionStatus::Active | SubscriptionStatus::Canceling => {
                let later = sub.current_period_end.is_none_or(|end| *period_end > end);
                let recovers = sub.status == SubscriptionStatus::Canceling && sub.payment_past_due;
                if !later && !recovers {
                    return Ok(Step::Noop);
                }
                // a cancellation the user asked for stands
                if recovers {
                    next.status = SubscriptionStatus::Active;
                    next.cancel_at_period_end = false;
                    next.payment_past_due = false;
                }
                if later {
                    next.current_period_end = Some(*period_end);
                }
                Ok(Step::Apply(
                    next,
                    Notification::Renewed {
                        period_end: *period_end,
                    },
                ))
            }
            status => Ok(Step::Reject(format!("cannot renew while {}", status))),
        },

        Action::PaymentFailed => match sub.status {
            SubscriptionStatus::Active => {
                next.status = SubscriptionStatus::Canceling;
                next.cancel_at_period_end = true;
                next.payment_past_due = true;
                Ok(Step::Apply(next, Notification::PaymentFailed))
            }
            SubscriptionStatus::Canceling => Ok(Step::Noop),
            status => Ok(Step::Reject(format!(
                "no paid period to lapse while {}",
                status
            ))),
        },

        Action::Expire => Ok(Step::Noop),
    }
}

/// Adds whole billing periods, clamping to the end of shorter months.
pub fn add_period(from: DateTime<Utc>, period: BillingPeriod) -> Res<DateTime<Utc>> {
    from.checked_add_months(Months::new(period.months()))
        .ok_or_else(|| AppError::Internal(format!("Cannot add {} to {}", period, from)))
}

pub struct SubscriptionMachine {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn UserDirectory>,
    notifier: Arc<dyn Notifier>,
    processor: Arc<dyn PaymentProcessor>,
    trials: Arc<TrialGuard>,
    trial_days: i64,
    processor_timeout: StdDuration,
}

impl SubscriptionMachine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
        processor: Arc<dyn PaymentProcessor>,
        trials: Arc<TrialGuard>,
        trial_days: i64,
        processor_timeout: StdDuration,
    ) -> Self {
        SubscriptionMachine {
            store,
            clock,
            directory,
            notifier,
            processor,
            trials,
            trial_days,
            processor_timeout,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn trial_days(&self) -> i64 {
        self.trial_days
    }

    /// The user's subscription, lazily expired.
    pub async fn current(&self, user_id: &Uuid) -> Res<Subscription> {
        self.mutate(user_id, Action::Expire)
            .await?
            .into_subscription()
    }

    pub async fn expire_past_due(&self, user_id: &Uuid) -> Res<Outcome> {
        self.mutate(user_id, Action::Expire).await
    }

    pub async fn start_trial(
        &self,
        user_id: &Uuid,
        plan: PlanId,
        device_fingerprint: &str,
        platform: &str,
    ) -> Res<Subscription> {
        let action = Action::StartTrial {
            plan,
            device_fingerprint: device_fingerprint.to_string(),
            platform: platform.to_string(),
        };
        self.mutate(user_id, action).await?.into_subscription()
    }

    /// Activates a paid plan. Idempotent: replaying the same completion
    /// returns `AlreadyApplied` and writes nothing.
    pub async fn complete_checkout(
        &self,
        user_id: &Uuid,
        plan: PlanId,
        billing_period: BillingPeriod,
        period_end: DateTime<Utc>,
        external_subscription_id: Option<String>,
    ) -> Res<Outcome> {
        let action = Action::CompleteCheckout {
            plan,
            billing_period,
            period_end,
            external_subscription_id,
        };
        self.mutate(user_id, action).await
    }

    pub async fn cancel(&self, user_id: &Uuid) -> Res<Subscription> {
        self.mutate(user_id, Action::Cancel)
            .await?
            .into_subscription()
    }

    pub async fn reactivate(&self, user_id: &Uuid) -> Res<Subscription> {
        self.mutate(user_id, Action::Reactivate)
            .await?
            .into_subscription()
    }

    pub async fn change_plan(
        &self,
        user_id: &Uuid,
        plan: PlanId,
        billing_period: BillingPeriod,
    ) -> Res<Subscription> {
        let action = Action::ChangePlan {
            plan,
            billing_period,
        };
        self.mutate(user_id, action).await?.into_subscription()
    }

    /// Advances the paid period to `period_end` after a successful recurring
    /// charge. Replays carry the same end and are absorbed. A lapse caused by
    /// a failed charge recovers; a cancellation the user asked for does not.
    pub async fn renew(
        &self,
        external_subscription_id: &str,
        period_end: DateTime<Utc>,
    ) -> Res<Outcome> {
        let sub = self.by_external_id(external_subscription_id).await?;
        self.mutate(&sub.user_id, Action::Renew { period_end }).await
    }

    /// Schedules the subscription to lapse at period end after a failed
    /// recurring charge.
    pub async fn mark_payment_failed(&self, external_subscription_id: &str) -> Res<Outcome> {
        let sub = self.by_external_id(external_subscription_id).await?;
        self.mutate(&sub.user_id, Action::PaymentFailed).await
    }

    /// Expires every lapsed subscription. Returns how many were moved to FREE.
    pub async fn sweep(&self) -> Res<usize> {
        let due = self.store.expirable_user_ids(self.clock.now()).await?;
        let mut expired = 0;
        for user_id in due {
            match self.expire_past_due(&user_id).await {
                Ok(Outcome::Applied(_)) => expired += 1,
                Ok(_) => {}
                Err(err) => error!("Expiry sweep failed for user {}: {}", user_id, err),
            }
        }
        if expired > 0 {
            info!("Expiry sweep moved {} subscriptions to FREE", expired);
        }
        Ok(expired)
    }

    async fn by_external_id(&self, external_subscription_id: &str) -> Res<Subscription> {
        self.store
            .get_subscription_by_external_id(external_subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No subscription linked to {}",
                    external_subscription_id
                ))
            })
    }

    /// Reads the row, creating the default FREE row the first time a known
    /// user is seen.
    async fn load(&self, user_id: &Uuid) -> Res<Subscription> {
        if let Some(sub) = self.store.get_subscription(user_id).await? {
            return Ok(sub);
        }
        let Some(account_created_at) = self.directory.account_created_at(user_id).await? else {
            return Err(AppError::NotFound(format!("User {}", user_id)));
        };
        info!(
            "Creating FREE subscription for user {} (account created {})",
            user_id, account_created_at
        );
        let fresh = Subscription::free(*user_id, catalog::CURRENT_VERSION, self.clock.now());
        match self.store.insert_subscription(&fresh).await? {
            Some(sub) => Ok(sub),
            None => self.store.get_subscription(user_id).await?.ok_or_else(|| {
                AppError::Internal(format!("Subscription for user {} vanished", user_id))
            }),
        }
    }

    async fn mutate(&self, user_id: &Uuid, action: Action) -> Res<Outcome> {
        for _ in 0..MAX_ATTEMPTS {
            let current = self.load(user_id).await?;
            let now = self.clock.now();
            let expired = expire_if_due(&current, now);
            let base = expired.as_ref().unwrap_or(&current);

            let step = match apply(base, &action, now, self.trial_days) {
                Ok(step) => step,
                Err(err) => {
                    log_refusal(user_id, action.name(), base.status, &err);
                    return Err(err);
                }
            };

            let (mut next, note) = match step {
                Step::Apply(next, note) => (next, Some(note)),
                Step::Noop => match &expired {
                    Some(next) => (next.clone(), None),
                    None => return Ok(Outcome::AlreadyApplied(current)),
                },
                Step::Reject(reason) => {
                    warn!(
                        "Rejected {} for user {} (status {}): {}",
                        action.name(),
                        user_id,
                        base.status,
                        reason
                    );
                    return Ok(Outcome::Rejected(reason));
                }
            };
            next.updated_at = now;

            if let Err(err) = self.push_to_processor(&action, base).await {
                log_refusal(user_id, action.name(), base.status, &err);
                return Err(err);
            }

            let written = match &action {
                Action::StartTrial { platform, .. } => {
                    self.write_trial(user_id, base, &next, platform, now).await?
                }
                _ => self.store.update_subscription(&next).await?,
            };
            let Some(written) = written else {
                debug!(
                    "Version conflict on {} for user {}, retrying",
                    action.name(),
                    user_id
                );
                continue;
            };

            if expired.is_some() {
                self.notifier
                    .notify(user_id, &Notification::Expired { plan: current.plan })
                    .await;
            }
            if let Some(note) = note {
                self.notifier.notify(user_id, &note).await;
            }
            info!(
                "{} applied for user {}: {} -> {}",
                action.name(),
                user_id,
                current.status,
                written.status
            );
            return Ok(Outcome::Applied(written));
        }

        warn!(
            "Giving up on {} for user {} after {} conflicting attempts",
            action.name(),
            user_id,
            MAX_ATTEMPTS
        );
        Err(AppError::invalid_transition(
            action.name(),
            "being modified concurrently",
        ))
    }

    /// Mirrors user-driven changes onto the processor subscription so billing
    /// follows the row. Rows without a processor subscription (trials) have
    /// nothing to mirror.
    async fn push_to_processor(&self, action: &Action, base: &Subscription) -> Res<()> {
        let Some(external) = base.external_subscription_id.as_deref() else {
            return Ok(());
        };
        let call = async {
            match action {
                Action::Cancel => self.processor.set_cancel_at_period_end(external, true).await,
                Action::Reactivate => {
                    self.processor
                        .set_cancel_at_period_end(external, false)
                        .await
                }
                Action::ChangePlan {
                    plan,
                    billing_period,
                } => {
                    self.processor
                        .change_price(external, *plan, *billing_period)
                        .await
                }
                _ => Ok(()),
            }
        };
        processor::bounded(self.processor_timeout, call).await
    }

    /// Device gate plus the combined device-record and subscription write.
    /// `Ok(None)` means a version conflict.
    async fn write_trial(
        &self,
        user_id: &Uuid,
        base: &Subscription,
        next: &Subscription,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Res<Option<Subscription>> {
        let fingerprint = next.device_trial_fingerprint.clone().unwrap_or_default();
        if let Err(err) = self.trials.ensure_eligible(base, &fingerprint).await {
            log_refusal(user_id, "start trial", base.status, &err);
            return Err(err);
        }

        let trial = DeviceTrial {
            device_fingerprint: fingerprint,
            user_id: *user_id,
            platform: platform.to_string(),
            used_at: now,
        };
        match self.store.start_trial(next, &trial).await? {
            TrialWrite::Written(sub) => Ok(Some(sub)),
            TrialWrite::Conflict => Ok(None),
            TrialWrite::DeviceUsed => {
                let err = AppError::TrialNotEligible(
                    "this device has already been used for a free trial".to_string(),
                );
                log_refusal(user_id, "start trial", base.status, &err);
                Err(err)
            }
        }
    }
}

fn log_refusal(user_id: &Uuid, action: &str, status: SubscriptionStatus, err: &AppError) {
    match err {
        AppError::InvalidTransition { .. } => warn!(
            "Refused {} for user {} (status {}): {}",
            action,
            user_id,
            status,
            err
        ),
        AppError::TrialNotEligible(_) | AppError::Unprocessable(_) => info!(
            "Refused {} for user {} (status {}): {}",
            action,
            user_id,
            status,
            err
        ),
        _ => error!(
            "{} failed for user {} (status {}): {}",
            action,
            user_id,
            status,
            err
        ),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        Billing, Deps, Settings,
        store::MemoryStore,
        testing::{self, Harness, MockProcessor, RecordingNotifier, StaticDirectory},
    };

    fn day_zero() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 9, 0, 0).unwrap()
    }

    fn setup() -> (Harness, Uuid) {
        (testing::harness(day_zero()), Uuid::new_v4())
    }

    async fn activate(h: &Harness, user_id: &Uuid, plan: PlanId) -> Subscription {
        let period_end = day_zero() + Duration::days(30);
        h.billing
            .machine
            .complete_checkout(
                user_id,
                plan,
                BillingPeriod::Monthly,
                period_end,
                Some(format!("sub_{}", user_id.simple())),
            )
            .await
            .unwrap()
            .into_subscription()
            .unwrap()
    }

    #[tokio::test]
    async fn first_read_materialises_a_free_row() {
        let (h, user_id) = setup();
        let sub = h.billing.machine.current(&user_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Free);
        assert_eq!(sub.plan, PlanId::Free);
        assert!(sub.can_use_trial);
        assert_eq!(sub.catalog_version, catalog::CURRENT_VERSION);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let billing = Billing::new(Deps {
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(testing::FixedClock::new(day_zero())),
            directory: Arc::new(StaticDirectory::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            processor: Arc::new(MockProcessor::default()),
            settings: Settings::default(),
        });
        assert!(matches!(
            billing.machine.current(&Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn trial_starts_for_seven_days_and_notifies() {
        let (h, user_id) = setup();
        let sub = h
            .billing
            .machine
            .start_trial(&user_id, PlanId::Plus, "device-1", "ios")
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.plan, PlanId::Plus);
        assert_eq!(sub.trial_ends_at, Some(day_zero() + Duration::days(7)));
        assert!(!sub.can_use_trial);
        assert_eq!(
            h.notifier.sent_to(&user_id),
            vec![Notification::TrialStarted {
                plan: PlanId::Plus,
                trial_ends_at: day_zero() + Duration::days(7),
            }]
        );
        assert_eq!(h.store.device_trial("device-1").unwrap().user_id, user_id);
    }

    #[tokio::test]
    async fn account_gets_one_trial_only() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        machine.start_trial(&user_id, PlanId::Plus, "device-1", "ios").await.unwrap();
        h.clock.advance(Duration::days(8));

        let err = machine
            .start_trial(&user_id, PlanId::Pro, "device-2", "ios")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TrialNotEligible(_)));
    }

    #[tokio::test]
    async fn device_gets_one_trial_across_accounts() {
        let (h, first) = setup();
        let second = Uuid::new_v4();
        let machine = &h.billing.machine;
        machine.start_trial(&first, PlanId::Plus, "shared-phone", "android").await.unwrap();

        let err = machine
            .start_trial(&second, PlanId::Plus, " shared-phone ", "android")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TrialNotEligible(_)));

        // the refused account keeps its own trial for another device
        let sub = machine.current(&second).await.unwrap();
        assert!(sub.can_use_trial);
        assert_eq!(sub.status, SubscriptionStatus::Free);
        assert!(!h.billing.trials.can_start_trial(&second, "shared-phone").await.unwrap());
        assert!(h.billing.trials.can_start_trial(&second, "tablet").await.unwrap());
    }

    #[tokio::test]
    async fn trial_needs_paid_plan_and_device() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        assert!(matches!(
            machine.start_trial(&user_id, PlanId::Free, "device-1", "ios").await,
            Err(AppError::Unprocessable(_))
        ));
        assert!(matches!(
            machine.start_trial(&user_id, PlanId::Plus, "  ", "ios").await,
            Err(AppError::Unprocessable(_))
        ));
    }

    #[tokio::test]
    async fn paid_user_cannot_start_trial() {
        let (h, user_id) = setup();
        activate(&h, &user_id, PlanId::Plus).await;
        assert!(matches!(
            h.billing
                .machine
                .start_trial(&user_id, PlanId::Pro, "device-1", "ios")
                .await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_trials_on_one_device_grant_exactly_one() {
        let h = testing::harness(day_zero());
        let machine = h.billing.machine.clone();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let machine = machine.clone();
                tokio::spawn(async move {
                    machine
                        .start_trial(&Uuid::new_v4(), PlanId::Plus, "contested", "ios")
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_trials_on_one_account_grant_exactly_one() {
        let (h, user_id) = setup();
        let machine = h.billing.machine.clone();
        machine.current(&user_id).await.unwrap();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let machine = machine.clone();
                tokio::spawn(async move {
                    machine
                        .start_trial(&user_id, PlanId::Plus, &format!("device-{}", i), "ios")
                        .await
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(
                    AppError::TrialNotEligible(_)
                    | AppError::InvalidTransition { .. },
                ) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn unconverted_trial_lapses_to_free_on_read() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        machine.start_trial(&user_id, PlanId::Plus, "device-1", "ios").await.unwrap();

        h.clock.advance(Duration::days(8));
        let sub = machine.current(&user_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Free);
        assert_eq!(sub.plan, PlanId::Free);
        assert_eq!(sub.trial_ends_at, None);
        assert!(!sub.can_use_trial);
        assert!(h
            .notifier
            .sent_to(&user_id)
            .contains(&Notification::Expired { plan: PlanId::Plus }));
    }

    #[tokio::test]
    async fn checkout_completion_is_idempotent() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let period_end = day_zero() + Duration::days(30);

        let first = machine
            .complete_checkout(&user_id, PlanId::Pro, BillingPeriod::Monthly, period_end, None)
            .await
            .unwrap();
        let second = machine
            .complete_checkout(&user_id, PlanId::Pro, BillingPeriod::Monthly, period_end, None)
            .await
            .unwrap();

        let Outcome::Applied(applied) = first else {
            panic!("first completion should apply");
        };
        assert_eq!(second, Outcome::AlreadyApplied(applied.clone()));
        assert_eq!(applied.status, SubscriptionStatus::Active);
        assert_eq!(applied.current_period_end, Some(period_end));

        let activations = h
            .notifier
            .sent_to(&user_id)
            .into_iter()
            .filter(|n| matches!(n, Notification::Activated { .. }))
            .count();
        assert_eq!(activations, 1);
    }

    #[tokio::test]
    async fn trial_converts_on_checkout() {
        let (h, user_id) = setup();
        h.billing
            .machine
            .start_trial(&user_id, PlanId::Plus, "device-1", "ios")
            .await
            .unwrap();
        let sub = activate(&h, &user_id, PlanId::Plus).await;
        assert_eq!(sub.status, SubscriptionStatus::Active);

        // converted trials no longer lapse at trial end
        h.clock.advance(Duration::days(8));
        let sub = h.billing.machine.current(&user_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn stale_or_free_completion_is_rejected() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let past = machine
            .complete_checkout(
                &user_id,
                PlanId::Plus,
                BillingPeriod::Monthly,
                day_zero() - Duration::days(1),
                None,
            )
            .await
            .unwrap();
        assert!(matches!(past, Outcome::Rejected(_)));

        let free = machine
            .complete_checkout(
                &user_id,
                PlanId::Free,
                BillingPeriod::Monthly,
                day_zero() + Duration::days(30),
                None,
            )
            .await
            .unwrap();
        assert!(matches!(free, Outcome::Rejected(_)));
        assert_eq!(machine.current(&user_id).await.unwrap().status, SubscriptionStatus::Free);
    }

    #[tokio::test]
    async fn cancel_then_reactivate_restores_previous_state() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let before = activate(&h, &user_id, PlanId::Plus).await;

        let canceled = machine.cancel(&user_id).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceling);
        assert!(canceled.cancel_at_period_end);

        let mut after = machine.reactivate(&user_id).await.unwrap();
        assert_eq!(after.version, before.version + 2);
        after.version = before.version;
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn canceled_trial_stays_trialing_until_it_ends() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        machine.start_trial(&user_id, PlanId::Pro, "device-1", "ios").await.unwrap();

        let sub = machine.cancel(&user_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert!(sub.cancel_at_period_end);

        let again = machine.cancel(&user_id).await.unwrap();
        assert_eq!(again.version, sub.version);

        let sub = machine.reactivate(&user_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert!(!sub.cancel_at_period_end);
    }

    #[tokio::test]
    async fn canceling_keeps_access_until_period_end_then_expires() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        activate(&h, &user_id, PlanId::Plus).await;
        machine.cancel(&user_id).await.unwrap();

        h.clock.advance(Duration::days(29));
        assert!(machine.current(&user_id).await.unwrap().has_access());

        h.clock.advance(Duration::days(2));
        let sub = machine.current(&user_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Free);
        assert!(!sub.cancel_at_period_end);
        assert_eq!(sub.current_period_end, None);
        assert!(matches!(
            machine.reactivate(&user_id).await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn illegal_transitions_are_conflicts() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        assert!(matches!(
            machine.cancel(&user_id).await,
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            machine.reactivate(&user_id).await,
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            machine.change_plan(&user_id, PlanId::Pro, BillingPeriod::Yearly).await,
            Err(AppError::InvalidTransition { .. })
        ));

        activate(&h, &user_id, PlanId::Plus).await;
        assert!(matches!(
            machine.reactivate(&user_id).await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn plan_change_keeps_the_paid_period() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let before = activate(&h, &user_id, PlanId::Plus).await;

        let after = machine
            .change_plan(&user_id, PlanId::Pro, BillingPeriod::Monthly)
            .await
            .unwrap();
        assert_eq!(after.plan, PlanId::Pro);
        assert_eq!(after.current_period_end, before.current_period_end);

        let same = machine
            .change_plan(&user_id, PlanId::Pro, BillingPeriod::Monthly)
            .await
            .unwrap();
        assert_eq!(same.version, after.version);

        assert!(matches!(
            machine.change_plan(&user_id, PlanId::Free, BillingPeriod::Monthly).await,
            Err(AppError::Unprocessable(_))
        ));
    }

    #[tokio::test]
    async fn renewal_only_moves_the_period_forward() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let sub = activate(&h, &user_id, PlanId::Plus).await;
        let external = sub.external_subscription_id.clone().unwrap();
        let next_end = day_zero() + Duration::days(60);

        let renewed = machine.renew(&external, next_end).await.unwrap();
        assert_eq!(
            renewed.subscription().unwrap().current_period_end,
            Some(next_end)
        );

        for stale in [next_end, day_zero() + Duration::days(30)] {
            let replay = machine.renew(&external, stale).await.unwrap();
            assert!(matches!(replay, Outcome::AlreadyApplied(_)));
        }
        assert_eq!(
            machine.current(&user_id).await.unwrap().current_period_end,
            Some(next_end)
        );
        assert!(matches!(
            machine.renew("sub_unknown", next_end).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn renewal_does_not_undo_a_user_cancellation() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let sub = activate(&h, &user_id, PlanId::Plus).await;
        let external = sub.external_subscription_id.clone().unwrap();
        machine.cancel(&user_id).await.unwrap();

        let next_end = day_zero() + Duration::days(60);
        machine.renew(&external, next_end).await.unwrap();
        let after = machine.current(&user_id).await.unwrap();
        assert_eq!(after.status, SubscriptionStatus::Canceling);
        assert!(after.cancel_at_period_end);
        assert_eq!(after.current_period_end, Some(next_end));
    }

    #[tokio::test]
    async fn failed_payment_lapses_at_period_end_and_renewal_recovers() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let sub = activate(&h, &user_id, PlanId::Pro).await;
        let external = sub.external_subscription_id.clone().unwrap();

        let failed = machine.mark_payment_failed(&external).await.unwrap();
        let failed = failed.subscription().unwrap();
        assert_eq!(failed.status, SubscriptionStatus::Canceling);
        assert!(failed.cancel_at_period_end);
        assert!(failed.payment_past_due);
        assert!(matches!(
            machine.mark_payment_failed(&external).await.unwrap(),
            Outcome::AlreadyApplied(_)
        ));

        let recovered = machine
            .renew(&external, day_zero() + Duration::days(60))
            .await
            .unwrap();
        let recovered = recovered.subscription().unwrap();
        assert_eq!(recovered.status, SubscriptionStatus::Active);
        assert!(!recovered.cancel_at_period_end);
        assert!(!recovered.payment_past_due);
    }

    #[tokio::test]
    async fn cancel_after_failed_payment_sticks() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let sub = activate(&h, &user_id, PlanId::Pro).await;
        let external = sub.external_subscription_id.clone().unwrap();
        machine.mark_payment_failed(&external).await.unwrap();

        let canceled = machine.cancel(&user_id).await.unwrap();
        assert!(!canceled.payment_past_due);
        machine
            .renew(&external, day_zero() + Duration::days(60))
            .await
            .unwrap();
        assert_eq!(
            machine.current(&user_id).await.unwrap().status,
            SubscriptionStatus::Canceling
        );
    }

    #[tokio::test]
    async fn user_changes_are_mirrored_to_the_processor() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let sub = activate(&h, &user_id, PlanId::Plus).await;
        let external = sub.external_subscription_id.clone().unwrap();

        machine.cancel(&user_id).await.unwrap();
        assert!(h.processor.subscription(&external).unwrap().cancel_at_period_end);
        machine.reactivate(&user_id).await.unwrap();
        assert!(!h.processor.subscription(&external).unwrap().cancel_at_period_end);

        machine
            .change_plan(&user_id, PlanId::Pro, BillingPeriod::Yearly)
            .await
            .unwrap();
        assert_eq!(
            h.processor.subscription(&external).unwrap().price,
            Some((PlanId::Pro, BillingPeriod::Yearly))
        );
    }

    #[tokio::test]
    async fn processor_failure_leaves_the_row_untouched() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        let before = activate(&h, &user_id, PlanId::Plus).await;
        h.processor.set_unavailable(true);

        assert!(matches!(
            machine.cancel(&user_id).await,
            Err(AppError::ProcessorUnavailable(_))
        ));
        assert!(matches!(
            machine.change_plan(&user_id, PlanId::Pro, BillingPeriod::Monthly).await,
            Err(AppError::ProcessorUnavailable(_))
        ));
        assert_eq!(machine.current(&user_id).await.unwrap(), before);
        assert_eq!(h.notifier.sent_to(&user_id).len(), 1);
    }

    #[tokio::test]
    async fn trial_changes_need_no_processor() {
        let (h, user_id) = setup();
        let machine = &h.billing.machine;
        machine.start_trial(&user_id, PlanId::Plus, "device-1", "ios").await.unwrap();
        h.processor.set_unavailable(true);

        let sub = machine
            .change_plan(&user_id, PlanId::Pro, BillingPeriod::Monthly)
            .await
            .unwrap();
        assert_eq!(sub.plan, PlanId::Pro);
        assert!(machine.cancel(&user_id).await.unwrap().cancel_at_period_end);
    }

    #[tokio::test]
    async fn sweep_expires_only_lapsed_subscriptions() {
        let (h, trialing) = setup();
        let canceling = Uuid::new_v4();
        let active = Uuid::new_v4();
        let machine = &h.billing.machine;

        machine.start_trial(&trialing, PlanId::Plus, "device-1", "ios").await.unwrap();
        activate(&h, &canceling, PlanId::Plus).await;
        machine.cancel(&canceling).await.unwrap();
        activate(&h, &active, PlanId::Pro).await;

        h.clock.advance(Duration::days(8));
        assert_eq!(h.billing.sweep().await.unwrap(), 1);

        h.clock.advance(Duration::days(30));
        assert_eq!(h.billing.sweep().await.unwrap(), 1);
        assert_eq!(h.billing.sweep().await.unwrap(), 0);
        assert_eq!(
            machine.current(&active).await.unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn yearly_period_adds_twelve_months() {
        let start = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(
            add_period(start, BillingPeriod::Yearly).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap()
        );
    }
}
