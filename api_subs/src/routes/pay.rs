use std::sync::Arc;

use actix_web::{HttpRequest, Responder, get, post, web};
use billing::Billing;
use common::{
    env_config::Config,
    error::{AppError, Res},
    http::Success,
    jwt::JwtClaims,
    misc::{BillingPeriod, PlanId},
};

use crate::{
    dtos::pay::{CheckoutRequest, CheckoutResponse, PaymentsQuery, PaymentsResponse, WebhookResponse},
    services,
};

/// Opens a Stripe Checkout session for a paid plan.
///
/// # Input
/// - `plan`: `PLUS` or `PRO`
/// - `billingPeriod`: `monthly` or `yearly`
///
/// # Output
/// - Success: `{ sessionId, redirectUrl }`, the client sends the user to
///   `redirectUrl` and later polls `GET /checkout/{sessionId}`
/// - Error: 422 for FREE or a malformed plan, 503 when Stripe does not answer
///   in time (nothing is recorded in that case)
///
/// # Frontend Example
/// ```javascript
/// const response = await fetch('/api/subscriptions/checkout', {
///   method: 'POST',
///   headers: {
///     'Content-Type': 'application/json',
///     'Authorization': `Bearer ${token}`
///   },
///   body: JSON.stringify({ plan: "PRO", billingPeriod: "yearly" })
/// });
/// const { redirectUrl } = await response.json();
/// window.location.href = redirectUrl;
/// ```
#[post("/checkout")]
pub async fn post_checkout(
    claims: web::ReqData<JwtClaims>,
    req: web::Json<CheckoutRequest>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let plan = req.plan.parse::<PlanId>()?;
    let billing_period = req.billing_period.parse::<BillingPeriod>()?;
    let session = billing
        .checkout
        .create_session(
            &claims.user_id,
            claims.stripe_customer_id.as_deref(),
            plan,
            billing_period,
        )
        .await?;
    Success::created(CheckoutResponse::from(session))
}

/// Reports `{ status, paymentStatus }` for one of the caller's sessions,
/// activating the plan if Stripe reports it paid. Answers `pending` while
/// Stripe is slow or unreachable.
#[get("/checkout/{session_id}")]
pub async fn get_checkout(
    claims: web::ReqData<JwtClaims>,
    path: web::Path<String>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let state = billing
        .checkout
        .sync_session(&claims.user_id, &path.into_inner())
        .await?;
    Success::ok(state)
}

/// Lists the caller's recent payments straight from Stripe.
///
/// `limit` defaults to 25 and is clamped to 1..=100.
#[get("/payments")]
pub async fn get_payments(
    claims: web::ReqData<JwtClaims>,
    query: web::Query<PaymentsQuery>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let payments = billing
        .checkout
        .payments(claims.stripe_customer_id.as_deref(), query.limit)
        .await?;
    Success::ok(PaymentsResponse { payments })
}

/// Handles Stripe webhook events.
///
/// # Note
/// Called by Stripe's servers, not by the app. Configure the endpoint in the
/// Stripe Dashboard under Developers → Webhooks and put its signing secret in
/// `STRIPE_WEBHOOK_SECRET`.
///
/// # Event Types Handled
/// - checkout.session.completed: activates the purchased plan unless the
///   client's polling got there first
/// - invoice.payment_succeeded: extends the paid period
/// - invoice.payment_failed: schedules the subscription to lapse at period end
///
/// Anything else is acknowledged and ignored.
#[post("/stripe")]
pub async fn post_webhook(
    payload: String,
    req: HttpRequest,
    config: web::Data<Arc<Config>>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let signature = match req.headers().get("stripe-signature") {
        Some(signature) => signature.to_str().unwrap_or(""),
        None => return Err(AppError::BadRequest("Stripe signature missing".to_string())),
    };

    let event =
        services::stripe::construct_event(&payload, signature, &config.stripe_webhook_secret)?;
    log::info!("Processing webhook event: {} ({})", event.type_, event.id);
    let event = services::stripe::translate_event(event);
    let outcome = billing.checkout.handle_webhook(event).await?;

    Success::ok(WebhookResponse::from(outcome))
}
