//! Stripe-backed [`PaymentProcessor`] and webhook event translation.

use std::collections::HashMap;

use async_trait::async_trait;
use billing::{
    model::PaymentStatus,
    processor::{NewCheckout, Payment, PaymentProcessor, RemoteSession, RemoteStatus, WebhookEvent},
};
use chrono::{DateTime, Utc};
use common::{
    env_config::{Config, StripePrices},
    error::{AppError, Res},
    misc::{BillingPeriod, PlanId},
    stripe::create_client,
};
use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus,
    CheckoutSessionStatus, Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CustomerId, Event, EventObject, EventType, Invoice, ListPaymentIntents, StripeError,
    Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems, Webhook,
    generated::billing::subscription::SubscriptionProrationBehavior,
};
use uuid::Uuid;

const META_USER_ID: &str = "user_id";
const META_PLAN: &str = "plan";
const META_BILLING_PERIOD: &str = "billing_period";

pub struct StripeProcessor {
    client: Client,
    prices: StripePrices,
    success_url: String,
    cancel_url: String,
}

impl StripeProcessor {
    pub fn new(config: &Config) -> Self {
        StripeProcessor {
            client: create_client(&config.stripe_secret_key),
            prices: config.stripe_prices.clone(),
            success_url: config.checkout_success_url.clone(),
            cancel_url: config.checkout_cancel_url.clone(),
        }
    }

    /// Reads the subscription period end from an expanded session.
    fn period_end(session: &CheckoutSession) -> Option<DateTime<Utc>> {
        session
            .subscription
            .as_ref()
            .and_then(|sub| sub.as_object())
            .and_then(|sub| from_timestamp(sub.current_period_end))
    }

    fn price_id(&self, plan: PlanId, billing_period: BillingPeriod) -> Res<&str> {
        self.prices.price_for(plan, billing_period).ok_or_else(|| {
            AppError::Internal(format!(
                "No Stripe price configured for {} {}",
                plan, billing_period
            ))
        })
    }
}

fn parse_subscription_id(external_subscription_id: &str) -> Res<SubscriptionId> {
    external_subscription_id
        .parse::<SubscriptionId>()
        .map_err(|e| AppError::Internal(format!("Invalid subscription ID: {}", e)))
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn create_checkout_session(&self, request: &NewCheckout) -> Res<RemoteSession> {
        let price_id = self.price_id(request.plan, request.billing_period)?;
        let customer = request
            .customer_id
            .as_deref()
            .map(|id| {
                id.parse::<CustomerId>().map_err(|e| {
                    AppError::Internal(format!("Failed to parse customer id: {}. {}", id, e))
                })
            })
            .transpose()?;
        let user_id = request.user_id.to_string();

        let params = CreateCheckoutSession {
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id.to_string()),
                quantity: Some(1),
                ..Default::default()
            }]),
            mode: Some(CheckoutSessionMode::Subscription),
            success_url: Some(self.success_url.as_str()),
            cancel_url: Some(self.cancel_url.as_str()),
            client_reference_id: Some(user_id.as_str()),
            customer,
            metadata: Some(metadata(request)),
            ..Default::default()
        };
        let session = CheckoutSession::create(&self.client, params)
            .await
            .map_err(processor_error)?;
        Ok(remote_session(&session, None))
    }

    async fn get_session(&self, session_id: &str) -> Res<RemoteSession> {
        let id = session_id
            .parse::<CheckoutSessionId>()
            .map_err(|e| AppError::NotFound(format!("Checkout session {}: {}", session_id, e)))?;
        let session = CheckoutSession::retrieve(&self.client, &id, &["subscription"])
            .await
            .map_err(processor_error)?;
        Ok(remote_session(&session, Self::period_end(&session)))
    }

    async fn list_payments(&self, customer_id: &str, limit: u64) -> Res<Vec<Payment>> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| AppError::Internal(format!("Invalid customer ID: {}", e)))?;
        let params = ListPaymentIntents {
            customer: Some(customer_id),
            limit: Some(limit),
            ..Default::default()
        };
        let intents = stripe::PaymentIntent::list(&self.client, &params)
            .await
            .map_err(processor_error)?;

        Ok(intents
            .data
            .into_iter()
            .map(|pi| Payment {
                id: pi.id.to_string(),
                amount: pi.amount,
                currency: pi.currency.to_string(),
                status: pi.status.to_string(),
                created_at: from_timestamp(pi.created).unwrap_or_default(),
            })
            .collect())
    }

    async fn set_cancel_at_period_end(
        &self,
        external_subscription_id: &str,
        cancel: bool,
    ) -> Res<()> {
        let sub_id = parse_subscription_id(external_subscription_id)?;
        Subscription::update(
            &self.client,
            &sub_id,
            UpdateSubscription {
                cancel_at_period_end: Some(cancel),
                ..Default::default()
            },
        )
        .await
        .map_err(processor_error)?;
        Ok(())
    }

    async fn change_price(
        &self,
        external_subscription_id: &str,
        plan: PlanId,
        billing_period: BillingPeriod,
    ) -> Res<()> {
        let price_id = self.price_id(plan, billing_period)?;
        let sub_id = parse_subscription_id(external_subscription_id)?;

        // the price lives on the subscription item, not the subscription
        let current = Subscription::retrieve(&self.client, &sub_id, &[])
            .await
            .map_err(processor_error)?;
        let item = current.items.data.first().ok_or_else(|| {
            AppError::Internal(format!(
                "Subscription {} has no items",
                external_subscription_id
            ))
        })?;

        Subscription::update(
            &self.client,
            &sub_id,
            UpdateSubscription {
                items: Some(vec![UpdateSubscriptionItems {
                    id: Some(item.id.to_string()),
                    price: Some(price_id.to_string()),
                    ..Default::default()
                }]),
                proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
                ..Default::default()
            },
        )
        .await
        .map_err(processor_error)?;
        Ok(())
    }
}

/// Rejected requests keep their Stripe detail; transport failures and
/// timeouts mean the processor could not be reached.
fn processor_error(err: StripeError) -> AppError {
    match err {
        StripeError::Stripe(_) => AppError::Stripe(err),
        other => AppError::ProcessorUnavailable(other.to_string()),
    }
}

fn metadata(request: &NewCheckout) -> HashMap<String, String> {
    HashMap::from([
        (META_USER_ID.to_string(), request.user_id.to_string()),
        (META_PLAN.to_string(), request.plan.to_string()),
        (
            META_BILLING_PERIOD.to_string(),
            request.billing_period.to_string(),
        ),
    ])
}

/// Billing metadata echoed back on a session. Missing or malformed entries
/// read as `None`.
pub fn parse_metadata(
    metadata: &HashMap<String, String>,
) -> (Option<Uuid>, Option<PlanId>, Option<BillingPeriod>) {
    let user_id = metadata
        .get(META_USER_ID)
        .and_then(|id| Uuid::parse_str(id).ok());
    let plan = metadata
        .get(META_PLAN)
        .and_then(|plan| plan.parse::<PlanId>().ok());
    let billing_period = metadata
        .get(META_BILLING_PERIOD)
        .and_then(|period| period.parse::<BillingPeriod>().ok());
    (user_id, plan, billing_period)
}

fn remote_session(session: &CheckoutSession, period_end: Option<DateTime<Utc>>) -> RemoteSession {
    let (user_id, plan, billing_period) = session
        .metadata
        .as_ref()
        .map(parse_metadata)
        .unwrap_or((None, None, None));
    let user_id = user_id.or_else(|| {
        session
            .client_reference_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
    });

    RemoteSession {
        id: session.id.to_string(),
        url: session.url.clone(),
        status: match session.status {
            Some(CheckoutSessionStatus::Complete) => RemoteStatus::Complete,
            Some(CheckoutSessionStatus::Expired) => RemoteStatus::Expired,
            _ => RemoteStatus::Open,
        },
        payment_status: match session.payment_status {
            CheckoutSessionPaymentStatus::Paid => PaymentStatus::Paid,
            _ => PaymentStatus::Unpaid,
        },
        external_subscription_id: session.subscription.as_ref().map(|sub| sub.id().to_string()),
        period_end,
        user_id,
        plan,
        billing_period,
    }
}

pub fn from_timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

/// Verifies the signature header and parses the payload.
pub fn construct_event(payload: &str, signature: &str, webhook_secret: &str) -> Res<Event> {
    Webhook::construct_event(payload, signature, webhook_secret).map_err(|e| {
        log::warn!("Rejected webhook payload: {}", e);
        AppError::BadRequest(format!("Webhook Error: {}", e))
    })
}

/// Narrows a Stripe event down to what the engine acts on.
pub fn translate_event(event: Event) -> WebhookEvent {
    let kind = event.type_.to_string();
    match (event.type_, event.data.object) {
        (EventType::CheckoutSessionCompleted, EventObject::CheckoutSession(session)) => {
            // the webhook payload carries the subscription id only
            WebhookEvent::CheckoutCompleted(remote_session(&session, None))
        }
        (EventType::InvoicePaymentSucceeded, EventObject::Invoice(invoice)) => {
            paid_invoice(&invoice, kind)
        }
        (EventType::InvoicePaymentFailed, EventObject::Invoice(invoice)) => {
            match invoice_subscription(&invoice) {
                Some(external_subscription_id) => WebhookEvent::PaymentFailed {
                    external_subscription_id,
                },
                None => WebhookEvent::Ignored(kind),
            }
        }
        _ => WebhookEvent::Ignored(kind),
    }
}

/// Invoices without a subscription or without a billed period have nothing
/// to renew.
fn paid_invoice(invoice: &Invoice, kind: String) -> WebhookEvent {
    match (invoice_subscription(invoice), invoice_period_end(invoice)) {
        (Some(external_subscription_id), Some(period_end)) => WebhookEvent::PaymentSucceeded {
            external_subscription_id,
            period_end,
        },
        (Some(external_subscription_id), None) => {
            log::warn!(
                "Paid invoice for {} carries no billing period",
                external_subscription_id
            );
            WebhookEvent::Ignored(kind)
        }
        (None, _) => WebhookEvent::Ignored(kind),
    }
}

fn invoice_subscription(invoice: &Invoice) -> Option<String> {
    invoice.subscription.as_ref().map(|sub| sub.id().to_string())
}

/// Latest period end across the invoice lines.
fn invoice_period_end(invoice: &Invoice) -> Option<DateTime<Utc>> {
    invoice
        .lines
        .as_ref()?
        .data
        .iter()
        .filter_map(|line| line.period.as_ref()?.end)
        .max()
        .and_then(from_timestamp)
}

#[cfg(test)]
mod tests {
    use stripe::{Expandable, InvoiceLineItem, List, Period};

    use super::*;

    fn invoice(periods: &[(i64, i64)]) -> Invoice {
        Invoice {
            subscription: Some(Expandable::Id("sub_123".parse().unwrap())),
            lines: Some(List {
                data: periods
                    .iter()
                    .map(|&(start, end)| InvoiceLineItem {
                        period: Some(Period {
                            start: Some(start),
                            end: Some(end),
                        }),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn paid_invoice_carries_its_period_end() {
        let event = paid_invoice(
            &invoice(&[(1_735_689_600, 1_738_368_000), (1_735_689_600, 1_737_000_000)]),
            "invoice.payment_succeeded".to_string(),
        );
        match event {
            WebhookEvent::PaymentSucceeded {
                external_subscription_id,
                period_end,
            } => {
                assert_eq!(external_subscription_id, "sub_123");
                assert_eq!(period_end, from_timestamp(1_738_368_000).unwrap());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn paid_invoice_without_period_is_ignored() {
        let event = paid_invoice(&invoice(&[]), "invoice.payment_succeeded".to_string());
        assert!(matches!(event, WebhookEvent::Ignored(_)));

        let mut orphan = invoice(&[(1_735_689_600, 1_738_368_000)]);
        orphan.subscription = None;
        assert!(matches!(
            paid_invoice(&orphan, "invoice.payment_succeeded".to_string()),
            WebhookEvent::Ignored(_)
        ));
    }

    #[test]
    fn metadata_round_trips_through_the_session() {
        let request = NewCheckout {
            user_id: Uuid::new_v4(),
            customer_id: None,
            plan: PlanId::Pro,
            billing_period: BillingPeriod::Yearly,
        };
        let (user_id, plan, period) = parse_metadata(&metadata(&request));
        assert_eq!(user_id, Some(request.user_id));
        assert_eq!(plan, Some(PlanId::Pro));
        assert_eq!(period, Some(BillingPeriod::Yearly));
    }

    #[test]
    fn malformed_metadata_reads_as_missing() {
        let metadata = HashMap::from([
            ("user_id".to_string(), "not-a-uuid".to_string()),
            ("plan".to_string(), "GOLD".to_string()),
        ]);
        assert_eq!(parse_metadata(&metadata), (None, None, None));
    }

    #[test]
    fn unix_seconds_convert_to_utc() {
        let at = from_timestamp(1_735_689_600).unwrap();
        assert_eq!(at.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
