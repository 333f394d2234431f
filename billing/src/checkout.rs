//! Checkout session bridge.
//!
//! Creates processor checkout sessions and reconciles their outcome. The
//! client polling `sync_session` and the processor's webhook race each other;
//! both funnel into the idempotent `complete_checkout`, so whichever lands
//! second is a no-op.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use common::{
    error::{AppError, Res},
    misc::{BillingPeriod, PlanId},
};
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    clock::Clock,
    machine::{Outcome, SubscriptionMachine, add_period},
    model::{CheckoutSession, PaymentStatus, SessionStatus},
    processor::{
        self, NewCheckout, Payment, PaymentProcessor, RemoteSession, RemoteStatus, WebhookEvent,
    },
    store::BillingStore,
};

pub const DEFAULT_PAYMENTS_LIMIT: u64 = 25;
pub const MAX_PAYMENTS_LIMIT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub status: SessionStatus,
    pub payment_status: PaymentStatus,
}

impl SessionState {
    const PENDING: SessionState = SessionState {
        status: SessionStatus::Pending,
        payment_status: PaymentStatus::Unpaid,
    };
}

impl From<&CheckoutSession> for SessionState {
    fn from(session: &CheckoutSession) -> Self {
        SessionState {
            status: session.status,
            payment_status: session.payment_status,
        }
    }
}

/// What a webhook delivery amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Processed,
    /// Already reconciled through another path.
    Duplicate,
    Ignored,
}

pub struct CheckoutBridge {
    machine: Arc<SubscriptionMachine>,
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl CheckoutBridge {
    pub fn new(
        machine: Arc<SubscriptionMachine>,
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        CheckoutBridge {
            machine,
            store,
            processor,
            clock,
            timeout,
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Res<T>>) -> Res<T> {
        processor::bounded(self.timeout, call).await
    }

    /// Opens a processor checkout for a paid plan. Nothing is recorded when
    /// the processor fails or times out.
    pub async fn create_session(
        &self,
        user_id: &Uuid,
        customer_id: Option<&str>,
        plan: PlanId,
        billing_period: BillingPeriod,
    ) -> Res<CheckoutSession> {
        if !plan.is_paid() {
            return Err(AppError::Unprocessable(
                "Only paid plans can be purchased".to_string(),
            ));
        }
        // materialises the row and rejects unknown users before calling out
        self.machine.current(user_id).await?;

        let request = NewCheckout {
            user_id: *user_id,
            customer_id: customer_id.map(str::to_string),
            plan,
            billing_period,
        };
        let remote = self
            .bounded(self.processor.create_checkout_session(&request))
            .await
            .inspect_err(|err| {
                warn!("Checkout creation failed for user {}: {}", user_id, err)
            })?;

        let redirect_url = remote.url.ok_or_else(|| {
            AppError::ProcessorUnavailable(format!("session {} has no redirect URL", remote.id))
        })?;
        let session = CheckoutSession {
            session_id: remote.id,
            user_id: *user_id,
            target_plan: plan,
            billing_period,
            status: SessionStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            redirect_url,
            created_at: self.clock.now(),
            reconciled_at: None,
        };
        let session = self.store.insert_session(&session).await?;
        info!(
            "Checkout session {} opened for user {} ({} {})",
            session.session_id, user_id, plan, billing_period
        );
        Ok(session)
    }

    /// Reports a session's state to its owner, reconciling it with the
    /// processor when it is still pending. A slow or failing processor
    /// yields `pending` rather than an error.
    pub async fn sync_session(&self, user_id: &Uuid, session_id: &str) -> Res<SessionState> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Checkout session {}", session_id)))?;
        if session.user_id != *user_id {
            return Err(AppError::Forbidden(
                "Checkout session belongs to another user".to_string(),
            ));
        }
        if session.status.is_terminal() {
            return Ok(SessionState::from(&session));
        }

        let remote = match self.bounded(self.processor.get_session(session_id)).await {
            Ok(remote) => remote,
            Err(AppError::ProcessorUnavailable(reason)) => {
                debug!("Session {} still pending: {}", session_id, reason);
                return Ok(SessionState::PENDING);
            }
            Err(err) => return Err(err),
        };
        self.reconcile(&session, &remote).await
    }

    /// Applies a processor session outcome to the local session record and,
    /// when paid, to the subscription.
    async fn reconcile(
        &self,
        session: &CheckoutSession,
        remote: &RemoteSession,
    ) -> Res<SessionState> {
        let now = self.clock.now();
        match (remote.status, remote.payment_status) {
            (RemoteStatus::Complete, PaymentStatus::Paid) => {
                let period_end = match remote.period_end {
                    Some(end) => end,
                    None => add_period(now, session.billing_period)?,
                };
                let outcome = self
                    .machine
                    .complete_checkout(
                        &session.user_id,
                        session.target_plan,
                        session.billing_period,
                        period_end,
                        remote.external_subscription_id.clone(),
                    )
                    .await?;
                if let Outcome::Rejected(reason) = &outcome {
                    warn!(
                        "Paid session {} could not be applied to user {}: {}",
                        session.session_id, session.user_id, reason
                    );
                }
                self.mark(session, SessionStatus::Complete, PaymentStatus::Paid, now)
                    .await
            }
            (RemoteStatus::Expired, _) => {
                self.mark(session, SessionStatus::Expired, PaymentStatus::Unpaid, now)
                    .await
            }
            _ => Ok(SessionState::PENDING),
        }
    }

    async fn mark(
        &self,
        session: &CheckoutSession,
        status: SessionStatus,
        payment_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Res<SessionState> {
        let updated = self
            .store
            .update_session(&session.session_id, status, payment_status, Some(now))
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Checkout session {}", session.session_id))
            })?;
        Ok(SessionState::from(&updated))
    }

    /// Acts on a verified processor event. Replays and events for sessions
    /// already reconciled are absorbed.
    pub async fn handle_webhook(&self, event: WebhookEvent) -> Res<WebhookOutcome> {
        match event {
            WebhookEvent::CheckoutCompleted(remote) => {
                let session = match self.store.get_session(&remote.id).await? {
                    Some(session) => session,
                    None => match self.adopt(&remote).await? {
                        Some(session) => session,
                        None => return Ok(WebhookOutcome::Ignored),
                    },
                };
                if session.status.is_terminal() {
                    debug!("Session {} already reconciled", session.session_id);
                    return Ok(WebhookOutcome::Duplicate);
                }
                self.reconcile(&session, &remote).await?;
                Ok(WebhookOutcome::Processed)
            }
            WebhookEvent::PaymentSucceeded {
                external_subscription_id,
                period_end,
            } => {
                let outcome = self
                    .machine
                    .renew(&external_subscription_id, period_end)
                    .await;
                Self::absorb(&external_subscription_id, outcome)
            }
            WebhookEvent::PaymentFailed {
                external_subscription_id,
            } => {
                let outcome = self
                    .machine
                    .mark_payment_failed(&external_subscription_id)
                    .await;
                Self::absorb(&external_subscription_id, outcome)
            }
            WebhookEvent::Ignored(kind) => {
                debug!("Ignoring processor event {}", kind);
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Records a session the processor completed but this service never
    /// stored, using the metadata echoed back on the session.
    async fn adopt(&self, remote: &RemoteSession) -> Res<Option<CheckoutSession>> {
        let (Some(user_id), Some(plan), Some(billing_period)) =
            (remote.user_id, remote.plan, remote.billing_period)
        else {
            warn!("Completed session {} carries no billing metadata", remote.id);
            return Ok(None);
        };
        let session = CheckoutSession {
            session_id: remote.id.clone(),
            user_id,
            target_plan: plan,
            billing_period,
            status: SessionStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            redirect_url: remote.url.clone().unwrap_or_default(),
            created_at: self.clock.now(),
            reconciled_at: None,
        };
        info!("Adopting unknown session {} for user {}", remote.id, user_id);
        self.store.insert_session(&session).await.map(Some)
    }

    fn absorb(external_subscription_id: &str, outcome: Res<Outcome>) -> Res<WebhookOutcome> {
        match outcome {
            Ok(Outcome::Applied(_)) => Ok(WebhookOutcome::Processed),
            Ok(Outcome::AlreadyApplied(_)) => Ok(WebhookOutcome::Duplicate),
            Ok(Outcome::Rejected(_)) => Ok(WebhookOutcome::Ignored),
            Err(AppError::NotFound(_)) => {
                // first invoice can arrive before the checkout links the subscription
                debug!("No subscription linked to {} yet", external_subscription_id);
                Ok(WebhookOutcome::Ignored)
            }
            Err(err) => Err(err),
        }
    }

    /// Payment history pass-through. Users without a processor customer have
    /// no history.
    pub async fn payments(
        &self,
        customer_id: Option<&str>,
        limit: Option<u64>,
    ) -> Res<Vec<Payment>> {
        let Some(customer_id) = customer_id else {
            return Ok(Vec::new());
        };
        let limit = limit
            .unwrap_or(DEFAULT_PAYMENTS_LIMIT)
            .clamp(1, MAX_PAYMENTS_LIMIT);
        self.bounded(self.processor.list_payments(customer_id, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use common::misc::SubscriptionStatus;

    use super::*;
    use crate::{
        Settings,
        testing::{self, Harness},
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 2, 8, 30, 0).unwrap()
    }

    async fn open(h: &Harness, user_id: &Uuid) -> CheckoutSession {
        h.billing
            .checkout
            .create_session(user_id, Some("cus_1"), PlanId::Plus, BillingPeriod::Yearly)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn session_is_recorded_pending_with_redirect() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;

        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.redirect_url.starts_with("https://checkout.test/"));
        let state = h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();
        assert_eq!(state, SessionState::PENDING);
    }

    #[tokio::test]
    async fn free_plan_has_no_checkout() {
        let h = testing::harness(now());
        assert!(matches!(
            h.billing
                .checkout
                .create_session(&Uuid::new_v4(), None, PlanId::Free, BillingPeriod::Monthly)
                .await,
            Err(AppError::Unprocessable(_))
        ));
    }

    #[tokio::test]
    async fn processor_timeout_changes_nothing() {
        let h = testing::harness_with(
            now(),
            Settings {
                processor_timeout: Duration::from_millis(20),
                ..Settings::default()
            },
        );
        h.processor.set_delay(Some(Duration::from_millis(200)));
        let user_id = Uuid::new_v4();

        let err = h
            .billing
            .checkout
            .create_session(&user_id, None, PlanId::Pro, BillingPeriod::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ProcessorUnavailable(_)));
        assert_eq!(
            h.billing.machine.current(&user_id).await.unwrap().status,
            SubscriptionStatus::Free
        );
        assert!(h.store.get_session("cs_test_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paid_session_activates_on_sync() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        let period_end = now() + ChronoDuration::days(365);
        h.processor.pay(&session.session_id, "sub_123", Some(period_end));

        let state = h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Complete);
        assert_eq!(state.payment_status, PaymentStatus::Paid);

        let sub = h.billing.machine.current(&user_id).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan, PlanId::Plus);
        assert_eq!(sub.billing_period, BillingPeriod::Yearly);
        assert_eq!(sub.current_period_end, Some(period_end));
        assert_eq!(sub.external_subscription_id.as_deref(), Some("sub_123"));
    }

    #[tokio::test]
    async fn missing_period_end_falls_back_to_billing_period() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        h.processor.pay(&session.session_id, "sub_123", None);

        h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();
        let sub = h.billing.machine.current(&user_id).await.unwrap();
        assert_eq!(
            sub.current_period_end,
            Some(Utc.with_ymd_and_hms(2026, 5, 2, 8, 30, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn slow_processor_reports_pending_on_sync() {
        let h = testing::harness_with(
            now(),
            Settings {
                processor_timeout: Duration::from_millis(20),
                ..Settings::default()
            },
        );
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        h.processor.pay(&session.session_id, "sub_123", None);
        h.processor.set_delay(Some(Duration::from_millis(200)));

        let state = h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();
        assert_eq!(state, SessionState::PENDING);
        assert_eq!(
            h.billing.machine.current(&user_id).await.unwrap().status,
            SubscriptionStatus::Free
        );
    }

    #[tokio::test]
    async fn sessions_are_private_to_their_owner() {
        let h = testing::harness(now());
        let owner = Uuid::new_v4();
        let session = open(&h, &owner).await;

        assert!(matches!(
            h.billing.checkout.sync_session(&Uuid::new_v4(), &session.session_id).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            h.billing.checkout.sync_session(&owner, "cs_missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn webhook_after_sync_is_a_duplicate() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        let period_end = now() + ChronoDuration::days(365);
        let remote = h
            .processor
            .pay(&session.session_id, "sub_123", Some(period_end))
            .unwrap();

        h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();
        let before = h.billing.machine.current(&user_id).await.unwrap();

        let outcome = h
            .billing
            .checkout
            .handle_webhook(WebhookEvent::CheckoutCompleted(remote))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Duplicate);
        assert_eq!(h.billing.machine.current(&user_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn sync_after_webhook_returns_stored_state() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        let remote = h.processor.pay(&session.session_id, "sub_123", None).unwrap();

        let outcome = h
            .billing
            .checkout
            .handle_webhook(WebhookEvent::CheckoutCompleted(remote))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        h.processor.set_unavailable(true);
        let state = h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn expired_session_never_activates() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        h.processor.expire(&session.session_id);

        let state = h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Expired);
        assert_eq!(
            h.billing.machine.current(&user_id).await.unwrap().status,
            SubscriptionStatus::Free
        );
    }

    #[tokio::test]
    async fn unknown_session_is_adopted_from_metadata() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let request = NewCheckout {
            user_id,
            customer_id: None,
            plan: PlanId::Pro,
            billing_period: BillingPeriod::Monthly,
        };
        // created at the processor but never recorded locally
        let remote = h.processor.create_checkout_session(&request).await.unwrap();
        let remote = h.processor.pay(&remote.id, "sub_9", None).unwrap();

        let outcome = h
            .billing
            .checkout
            .handle_webhook(WebhookEvent::CheckoutCompleted(remote))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(
            h.billing.machine.current(&user_id).await.unwrap().plan,
            PlanId::Pro
        );
    }

    #[tokio::test]
    async fn recurring_charge_events_route_to_the_machine() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        h.processor.pay(&session.session_id, "sub_123", None);
        h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();

        let failed = h
            .billing
            .checkout
            .handle_webhook(WebhookEvent::PaymentFailed {
                external_subscription_id: "sub_123".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(failed, WebhookOutcome::Processed);
        assert_eq!(
            h.billing.machine.current(&user_id).await.unwrap().status,
            SubscriptionStatus::Canceling
        );

        let unknown = h
            .billing
            .checkout
            .handle_webhook(WebhookEvent::PaymentSucceeded {
                external_subscription_id: "sub_other".to_string(),
                period_end: now() + ChronoDuration::days(30),
            })
            .await
            .unwrap();
        assert_eq!(unknown, WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn repeated_invoice_delivery_extends_the_period_once() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let session = open(&h, &user_id).await;
        let first_end = now() + ChronoDuration::days(365);
        h.processor.pay(&session.session_id, "sub_123", Some(first_end));
        h.billing.checkout.sync_session(&user_id, &session.session_id).await.unwrap();

        // the first invoice pays for the period checkout already granted
        let initial = WebhookEvent::PaymentSucceeded {
            external_subscription_id: "sub_123".to_string(),
            period_end: first_end,
        };
        for _ in 0..2 {
            let outcome = h.billing.checkout.handle_webhook(initial.clone()).await.unwrap();
            assert_eq!(outcome, WebhookOutcome::Duplicate);
        }
        assert_eq!(
            h.billing.machine.current(&user_id).await.unwrap().current_period_end,
            Some(first_end)
        );

        let next_end = first_end + ChronoDuration::days(365);
        let renewal = WebhookEvent::PaymentSucceeded {
            external_subscription_id: "sub_123".to_string(),
            period_end: next_end,
        };
        let outcomes = [
            h.billing.checkout.handle_webhook(renewal.clone()).await.unwrap(),
            h.billing.checkout.handle_webhook(renewal).await.unwrap(),
        ];
        assert_eq!(outcomes, [WebhookOutcome::Processed, WebhookOutcome::Duplicate]);
        assert_eq!(
            h.billing.machine.current(&user_id).await.unwrap().current_period_end,
            Some(next_end)
        );
    }

    #[tokio::test]
    async fn payment_history_limit_is_clamped() {
        let h = testing::harness(now());
        for i in 0..120 {
            h.processor.add_payment(
                "cus_1",
                Payment {
                    id: format!("pi_{}", i),
                    amount: 499,
                    currency: "usd".to_string(),
                    status: "succeeded".to_string(),
                    created_at: now(),
                },
            );
        }
        let checkout = &h.billing.checkout;
        assert_eq!(checkout.payments(Some("cus_1"), None).await.unwrap().len(), 25);
        assert_eq!(checkout.payments(Some("cus_1"), Some(500)).await.unwrap().len(), 100);
        assert!(checkout.payments(None, Some(10)).await.unwrap().is_empty());
    }
}
