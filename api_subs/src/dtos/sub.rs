use billing::catalog::{Limits, Plan};
use common::misc::PlanId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrialRequest {
    pub plan: String,
    pub device_id: String,
    #[serde(default)]
    pub platform: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialEligibilityQuery {
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialEligibilityResponse {
    pub eligible: bool,
    pub trial_days: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    pub new_plan: String,
    pub billing_period: String,
}

/// Catalog entry as shown on the pricing screen. Amounts are in minor units,
/// the display fields carry the same amount as a decimal string.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    pub id: PlanId,
    pub name: &'static str,
    pub currency: &'static str,
    pub price_monthly: i64,
    pub price_yearly: i64,
    pub display_price_monthly: String,
    pub display_price_yearly: String,
    pub limits: Limits,
}

impl From<&Plan> for PlanView {
    fn from(plan: &Plan) -> Self {
        PlanView {
            id: plan.id,
            name: plan.name,
            currency: plan.currency,
            price_monthly: plan.price_monthly,
            price_yearly: plan.price_yearly,
            display_price_monthly: display_amount(plan.price_monthly),
            display_price_yearly: display_amount(plan.price_yearly),
            limits: plan.limits,
        }
    }
}

pub fn display_amount(minor_units: i64) -> String {
    format!("{}.{:02}", minor_units / 100, minor_units % 100)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlansResponse {
    pub catalog_version: u32,
    pub plans: Vec<PlanView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub feature: String,
    pub used: i64,
}
