use actix_web::{Responder, get, http::StatusCode, post, web};
use billing::{
    Billing, catalog,
    model::{Capability, Feature},
    resolver::Decision,
};
use common::{
    error::Res,
    http::Success,
    jwt::JwtClaims,
    misc::{BillingPeriod, PlanId},
};

use crate::dtos::sub::{
    ChangePlanRequest, PlanView, PlansResponse, ReleaseResponse, StartTrialRequest,
    TrialEligibilityQuery, TrialEligibilityResponse,
};

/// Returns the plan catalog with prices and limits.
///
/// # Frontend Example
/// ```javascript
/// const response = await fetch('/api/subscriptions/plans', {
///   headers: { 'Authorization': `Bearer ${token}` }
/// });
/// const { catalogVersion, plans } = await response.json();
/// // plans[1] => { id: "PLUS", priceMonthly: 499, displayPriceMonthly: "4.99", limits: {...} }
/// ```
#[get("/plans")]
pub async fn get_plans() -> Res<impl Responder> {
    Success::ok(PlansResponse {
        catalog_version: catalog::CURRENT_VERSION,
        plans: catalog::plans().iter().map(PlanView::from).collect(),
    })
}

/// Returns the caller's subscription together with the limits in effect and
/// this month's usage. Reading lazily expires a lapsed trial or period.
///
/// # Output
/// - Success: `{ subscription, limits, usage, zenioUsage }`
/// - Error: 404 if the user directory does not know the caller
#[get("/current")]
pub async fn get_current(
    claims: web::ReqData<JwtClaims>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let snapshot = billing.resolver.snapshot(&claims.user_id).await?;
    Success::ok(snapshot)
}

/// Whether the caller could start a trial on the given device right now.
#[get("/trial-eligibility")]
pub async fn get_trial_eligibility(
    claims: web::ReqData<JwtClaims>,
    query: web::Query<TrialEligibilityQuery>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let eligible = billing
        .trials
        .can_start_trial(&claims.user_id, &query.device_id)
        .await?;
    Success::ok(TrialEligibilityResponse {
        eligible,
        trial_days: billing.machine.trial_days(),
    })
}

/// Starts a free trial of a paid plan.
///
/// # Input
/// - `plan`: `PLUS` or `PRO`
/// - `deviceId`: stable device fingerprint, one trial per device
/// - `platform`: client platform, stored with the device record
///
/// # Output
/// - Success: the updated entitlement snapshot
/// - Error: 403 `trial_not_eligible` when the account or device already had
///   a trial, 409 when the current status does not allow a trial, 422 for a
///   malformed plan or a missing device id
///
/// # Frontend Example
/// ```javascript
/// const response = await fetch('/api/subscriptions/start-trial', {
///   method: 'POST',
///   headers: {
///     'Content-Type': 'application/json',
///     'Authorization': `Bearer ${token}`
///   },
///   body: JSON.stringify({ plan: "PLUS", deviceId: deviceFingerprint, platform: "ios" })
/// });
/// if (response.status === 403) {
///   // offer checkout instead
/// }
/// ```
#[post("/start-trial")]
pub async fn post_start_trial(
    claims: web::ReqData<JwtClaims>,
    req: web::Json<StartTrialRequest>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let plan = req.plan.parse::<PlanId>()?;
    billing
        .machine
        .start_trial(&claims.user_id, plan, &req.device_id, &req.platform)
        .await?;
    let snapshot = billing.resolver.snapshot(&claims.user_id).await?;
    Success::created(snapshot)
}

/// Schedules the subscription (or trial) to end at the close of the current
/// period. Access is kept until then.
#[post("/cancel")]
pub async fn post_cancel(
    claims: web::ReqData<JwtClaims>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    billing.machine.cancel(&claims.user_id).await?;
    let snapshot = billing.resolver.snapshot(&claims.user_id).await?;
    Success::ok(snapshot)
}

/// Undoes a pending cancellation before the period ends.
#[post("/reactivate")]
pub async fn post_reactivate(
    claims: web::ReqData<JwtClaims>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    billing.machine.reactivate(&claims.user_id).await?;
    let snapshot = billing.resolver.snapshot(&claims.user_id).await?;
    Success::ok(snapshot)
}

#[post("/change-plan")]
pub async fn post_change_plan(
    claims: web::ReqData<JwtClaims>,
    req: web::Json<ChangePlanRequest>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let plan = req.new_plan.parse::<PlanId>()?;
    let billing_period = req.billing_period.parse::<BillingPeriod>()?;
    billing
        .machine
        .change_plan(&claims.user_id, plan, billing_period)
        .await?;
    let snapshot = billing.resolver.snapshot(&claims.user_id).await?;
    Success::ok(snapshot)
}

/// Decides a capability and, for metered ones, consumes one use.
///
/// # Output
/// - 200 `{ allowed: true, remaining? }`
/// - 403 `{ allowed: false, reason, remaining? }`
/// - 422 for an unknown capability
#[post("/entitlements/{capability}")]
pub async fn post_entitlement(
    claims: web::ReqData<JwtClaims>,
    path: web::Path<String>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let capability = path.parse::<Capability>()?;
    let decision = billing.resolver.resolve(&claims.user_id, capability).await?;
    respond_with(decision)
}

/// Same decision as the POST variant, without consuming quota.
#[get("/entitlements/{capability}")]
pub async fn get_entitlement(
    claims: web::ReqData<JwtClaims>,
    path: web::Path<String>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let capability = path.parse::<Capability>()?;
    let decision = billing.resolver.check(&claims.user_id, capability).await?;
    respond_with(decision)
}

fn respond_with(decision: Decision) -> Res<impl Responder> {
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    Success::with_status(status, decision)
}

/// Gives back one use of a metered feature, e.g. after deleting a budget.
#[post("/usage/{feature}/release")]
pub async fn post_release_usage(
    claims: web::ReqData<JwtClaims>,
    path: web::Path<String>,
    billing: web::Data<Billing>,
) -> Res<impl Responder> {
    let feature = path.parse::<Feature>()?;
    let used = billing.quota.release(&claims.user_id, feature).await?;
    Success::ok(ReleaseResponse {
        feature: feature.to_string(),
        used,
    })
}
