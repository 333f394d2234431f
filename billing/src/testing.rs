//! In-memory doubles for the engine's collaborators.
//!
//! [`harness`] wires a full [`Billing`] against a [`MemoryStore`] so unit
//! tests here and route tests in other crates exercise the real state
//! machine without Postgres or Stripe.

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration as StdDuration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    error::{AppError, Res},
    misc::{BillingPeriod, PlanId},
};
use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    Billing, Deps, Settings,
    clock::Clock,
    directory::UserDirectory,
    model::PaymentStatus,
    notifier::{Notification, Notifier},
    processor::{NewCheckout, Payment, PaymentProcessor, RemoteSession, RemoteStatus},
    store::MemoryStore,
};

/// Clock that only moves when told to.
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        FixedClock {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// Directory that knows a fixed set of users, or everyone.
#[derive(Default)]
pub struct StaticDirectory {
    users: DashMap<Uuid, DateTime<Utc>>,
    know_everyone: bool,
}

impl StaticDirectory {
    pub fn everyone() -> Self {
        StaticDirectory {
            users: DashMap::new(),
            know_everyone: true,
        }
    }

    pub fn add(&self, user_id: Uuid, created_at: DateTime<Utc>) {
        self.users.insert(user_id, created_at);
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn account_created_at(&self, user_id: &Uuid) -> Res<Option<DateTime<Utc>>> {
        match self.users.get(user_id) {
            Some(created_at) => Ok(Some(*created_at)),
            None if self.know_everyone => Ok(Some(DateTime::<Utc>::UNIX_EPOCH)),
            None => Ok(None),
        }
    }
}

/// Keeps every notification for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, Notification)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(Uuid, Notification)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, user_id: &Uuid) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == user_id)
            .map(|(_, notification)| notification)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &Uuid, notification: &Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((*user_id, notification.clone()));
        }
    }
}

/// What the mock processor was last told about a subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSubscription {
    pub cancel_at_period_end: bool,
    pub price: Option<(PlanId, BillingPeriod)>,
}

/// Scripted payment processor. Sessions start open and unpaid; tests move
/// them along with [`MockProcessor::pay`] and [`MockProcessor::expire`].
#[derive(Default)]
pub struct MockProcessor {
    sessions: DashMap<String, RemoteSession>,
    payments: DashMap<String, Vec<Payment>>,
    subscriptions: DashMap<String, RemoteSubscription>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    delay: RwLock<Option<StdDuration>>,
}

impl MockProcessor {
    /// Marks the session complete and paid, linking it to a processor
    /// subscription that renews at `period_end`.
    pub fn pay(
        &self,
        session_id: &str,
        external_subscription_id: &str,
        period_end: Option<DateTime<Utc>>,
    ) -> Option<RemoteSession> {
        let mut session = self.sessions.get_mut(session_id)?;
        session.status = RemoteStatus::Complete;
        session.payment_status = PaymentStatus::Paid;
        session.external_subscription_id = Some(external_subscription_id.to_string());
        session.period_end = period_end;
        Some(session.clone())
    }

    pub fn expire(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.status = RemoteStatus::Expired;
        }
    }

    pub fn session(&self, session_id: &str) -> Option<RemoteSession> {
        self.sessions.get(session_id).map(|session| session.clone())
    }

    pub fn subscription(&self, external_subscription_id: &str) -> Option<RemoteSubscription> {
        self.subscriptions
            .get(external_subscription_id)
            .map(|sub| sub.clone())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Option<StdDuration>) {
        if let Ok(mut guard) = self.delay.write() {
            *guard = delay;
        }
    }

    pub fn add_payment(&self, customer_id: &str, payment: Payment) {
        self.payments
            .entry(customer_id.to_string())
            .or_default()
            .push(payment);
    }

    async fn gate(&self) -> Res<()> {
        let delay = self.delay.read().map(|delay| *delay).unwrap_or(None);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::ProcessorUnavailable(
                "mock processor is down".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn create_checkout_session(&self, request: &NewCheckout) -> Res<RemoteSession> {
        self.gate().await?;
        let id = format!("cs_test_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let session = RemoteSession {
            url: Some(format!("https://checkout.test/pay/{}", id)),
            id: id.clone(),
            status: RemoteStatus::Open,
            payment_status: PaymentStatus::Unpaid,
            external_subscription_id: None,
            period_end: None,
            user_id: Some(request.user_id),
            plan: Some(request.plan),
            billing_period: Some(request.billing_period),
        };
        self.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Res<RemoteSession> {
        self.gate().await?;
        self.session(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Checkout session {}", session_id)))
    }

    async fn list_payments(&self, customer_id: &str, limit: u64) -> Res<Vec<Payment>> {
        self.gate().await?;
        Ok(self
            .payments
            .get(customer_id)
            .map(|payments| {
                payments
                    .iter()
                    .take(usize::try_from(limit).unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_cancel_at_period_end(
        &self,
        external_subscription_id: &str,
        cancel: bool,
    ) -> Res<()> {
        self.gate().await?;
        self.subscriptions
            .entry(external_subscription_id.to_string())
            .or_default()
            .cancel_at_period_end = cancel;
        Ok(())
    }

    async fn change_price(
        &self,
        external_subscription_id: &str,
        plan: PlanId,
        billing_period: BillingPeriod,
    ) -> Res<()> {
        self.gate().await?;
        self.subscriptions
            .entry(external_subscription_id.to_string())
            .or_default()
            .price = Some((plan, billing_period));
        Ok(())
    }
}

/// A wired engine plus handles on every double.
pub struct Harness {
    pub billing: Billing,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub directory: Arc<StaticDirectory>,
    pub notifier: Arc<RecordingNotifier>,
    pub processor: Arc<MockProcessor>,
}

pub fn harness(now: DateTime<Utc>) -> Harness {
    harness_with(now, Settings::default())
}

pub fn harness_with(now: DateTime<Utc>, settings: Settings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::new(now));
    let directory = Arc::new(StaticDirectory::everyone());
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = Arc::new(MockProcessor::default());

    let billing = Billing::new(Deps {
        store: store.clone(),
        clock: clock.clone(),
        directory: directory.clone(),
        notifier: notifier.clone(),
        processor: processor.clone(),
        settings,
    });

    Harness {
        billing,
        store,
        clock,
        directory,
        notifier,
        processor,
    }
}
