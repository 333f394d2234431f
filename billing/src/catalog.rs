//! Versioned plan catalog.
//!
//! Plans never change in place: a price or limit change ships as a new
//! catalog version and existing subscriptions keep resolving against the
//! version they were billed under.

use common::{
    error::{AppError, Res},
    misc::{BillingPeriod, PlanId},
};
use serde::Serialize;

use crate::model::Feature;

/// Sentinel limit meaning "no cap".
pub const UNLIMITED: i64 = -1;

pub const CURRENT_VERSION: u32 = 1;

/// Per-feature limits. Countable features hold a monthly cap, flags hold
/// 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub budgets: i64,
    pub goals: i64,
    pub zenio_queries: i64,
    pub reminders: i64,
    pub export_data: i64,
    pub text_to_speech: i64,
    pub budget_alerts: i64,
}

impl Limits {
    pub fn get(&self, feature: Feature) -> i64 {
        match feature {
            Feature::Budgets => self.budgets,
            Feature::Goals => self.goals,
            Feature::ZenioQueries => self.zenio_queries,
            Feature::Reminders => self.reminders,
            Feature::ExportData => self.export_data,
            Feature::TextToSpeech => self.text_to_speech,
            Feature::BudgetAlerts => self.budget_alerts,
        }
    }

    /// Whether a flag feature is switched on. Unlimited counts as on.
    pub fn enabled(&self, feature: Feature) -> bool {
        self.get(feature) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    pub name: &'static str,
    /// Prices in minor units of `currency`.
    pub price_monthly: i64,
    pub price_yearly: i64,
    pub currency: &'static str,
    pub limits: Limits,
}

impl Plan {
    pub fn price(&self, period: BillingPeriod) -> i64 {
        match period {
            BillingPeriod::Monthly => self.price_monthly,
            BillingPeriod::Yearly => self.price_yearly,
        }
    }
}

static V1: [Plan; 3] = [
    Plan {
        id: PlanId::Free,
        name: "Free",
        price_monthly: 0,
        price_yearly: 0,
        currency: "usd",
        limits: Limits {
            budgets: 2,
            goals: 1,
            zenio_queries: 15,
            reminders: 2,
            export_data: 0,
            text_to_speech: 0,
            budget_alerts: 0,
        },
    },
    Plan {
        id: PlanId::Plus,
        name: "Plus",
        price_monthly: 499,
        price_yearly: 4999,
        currency: "usd",
        limits: Limits {
            budgets: 10,
            goals: 5,
            zenio_queries: 300,
            reminders: 10,
            export_data: 1,
            text_to_speech: 0,
            budget_alerts: 1,
        },
    },
    Plan {
        id: PlanId::Pro,
        name: "Pro",
        price_monthly: 999,
        price_yearly: 9999,
        currency: "usd",
        limits: Limits {
            budgets: UNLIMITED,
            goals: UNLIMITED,
            zenio_queries: UNLIMITED,
            reminders: UNLIMITED,
            export_data: 1,
            text_to_speech: 1,
            budget_alerts: 1,
        },
    },
];

fn version(version: u32) -> Option<&'static [Plan]> {
    match version {
        1 => Some(&V1),
        _ => None,
    }
}

/// Plans of the current catalog version, cheapest first.
pub fn plans() -> &'static [Plan] {
    &V1
}

pub fn plan(id: PlanId) -> &'static Plan {
    // every version lists all plan ids
    match id {
        PlanId::Free => &V1[0],
        PlanId::Plus => &V1[1],
        PlanId::Pro => &V1[2],
    }
}

/// Looks a plan up in a specific catalog version.
pub fn plan_for(catalog_version: u32, id: PlanId) -> Res<&'static Plan> {
    version(catalog_version)
        .and_then(|plans| plans.iter().find(|plan| plan.id == id))
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Plan {} is not part of catalog version {}",
                id, catalog_version
            ))
        })
}
