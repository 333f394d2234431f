//! Entitlement resolver: the single read path for "can user X do Y?".

use std::{collections::BTreeMap, sync::Arc};

use common::{
    error::{AppError, Res},
    misc::{PlanId, SubscriptionStatus},
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    catalog::{self, Limits, Plan},
    machine::SubscriptionMachine,
    model::{Capability, Feature, Subscription},
    quota::{QuotaDecision, QuotaTracker},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Uses left this month for metered capabilities, `-1` when unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

impl Decision {
    fn allow(remaining: Option<i64>) -> Self {
        Decision {
            allowed: true,
            reason: None,
            remaining,
        }
    }

    fn deny(reason: impl Into<String>, remaining: Option<i64>) -> Self {
        Decision {
            allowed: false,
            reason: Some(reason.into()),
            remaining,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
}

impl From<QuotaDecision> for Usage {
    fn from(decision: QuotaDecision) -> Self {
        Usage {
            used: decision.used,
            limit: decision.limit,
            remaining: decision.remaining,
        }
    }
}

/// Everything a client needs to render the user's plan state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub subscription: Subscription,
    /// Limits of the plan currently in effect.
    pub limits: Limits,
    pub usage: BTreeMap<Feature, Usage>,
    pub zenio_usage: Usage,
}

pub struct EntitlementResolver {
    machine: Arc<SubscriptionMachine>,
    quota: Arc<QuotaTracker>,
}

impl EntitlementResolver {
    pub fn new(machine: Arc<SubscriptionMachine>, quota: Arc<QuotaTracker>) -> Self {
        EntitlementResolver { machine, quota }
    }

    /// Decides and, for metered capabilities, consumes one use.
    pub async fn resolve(&self, user_id: &Uuid, capability: Capability) -> Res<Decision> {
        self.decide(user_id, capability, true).await
    }

    /// Same decision as `resolve` without consuming anything.
    pub async fn check(&self, user_id: &Uuid, capability: Capability) -> Res<Decision> {
        self.decide(user_id, capability, false).await
    }

    pub async fn snapshot(&self, user_id: &Uuid) -> Res<Snapshot> {
        let subscription = self.machine.current(user_id).await?;
        let limits = effective_plan(&subscription)?
            .map(|plan| plan.limits)
            .unwrap_or(catalog::plan(PlanId::Free).limits);

        let mut usage = BTreeMap::new();
        for feature in Feature::COUNTABLE {
            let decision = self
                .quota
                .peek(user_id, feature, limits.get(feature))
                .await?;
            usage.insert(feature, Usage::from(decision));
        }
        let zenio_usage = usage
            .get(&Feature::ZenioQueries)
            .cloned()
            .ok_or_else(|| AppError::Internal("zenioQueries is not metered".to_string()))?;

        Ok(Snapshot {
            subscription,
            limits,
            usage,
            zenio_usage,
        })
    }

    async fn decide(&self, user_id: &Uuid, capability: Capability, consume: bool) -> Res<Decision> {
        let sub = self.machine.current(user_id).await?;
        let Some(plan) = effective_plan(&sub)? else {
            return Ok(Decision::deny(
                format!("subscription is {}", sub.status),
                None,
            ));
        };

        let Some(feature) = capability.feature() else {
            // pro-features: a PRO subscription winding down keeps its limits
            // but not the PRO-only surface
            let committed = matches!(
                sub.status,
                SubscriptionStatus::Active | SubscriptionStatus::Trialing
            );
            return Ok(if plan.id == PlanId::Pro && committed {
                Decision::allow(None)
            } else if plan.id == PlanId::Pro {
                Decision::deny(format!("{} requires an active PRO subscription", capability), None)
            } else {
                Decision::deny(upgrade_reason(capability, plan), None)
            });
        };

        let limit = plan.limits.get(feature);
        if !feature.is_countable() {
            return Ok(if plan.limits.enabled(feature) {
                Decision::allow(None)
            } else {
                Decision::deny(upgrade_reason(capability, plan), None)
            });
        }

        let quota = if consume {
            self.quota.check_and_increment(user_id, feature, limit).await?
        } else {
            self.quota.peek(user_id, feature, limit).await?
        };
        Ok(if quota.allowed {
            Decision::allow(Some(quota.remaining))
        } else {
            let reason = AppError::QuotaExceeded {
                feature: feature.to_string(),
                limit,
            };
            Decision::deny(reason.to_string(), Some(quota.remaining))
        })
    }
}

/// The catalog plan whose limits apply right now. FREE rows get FREE limits;
/// any status that neither grants access nor is FREE resolves to `None` and
/// is denied.
fn effective_plan(sub: &Subscription) -> Res<Option<&'static Plan>> {
    match sub.status {
        SubscriptionStatus::Free => catalog::plan_for(sub.catalog_version, PlanId::Free).map(Some),
        status if status.has_access() => catalog::plan_for(sub.catalog_version, sub.plan).map(Some),
        _ => Ok(None),
    }
}

fn upgrade_reason(capability: Capability, plan: &Plan) -> String {
    format!("{} is not included in the {} plan", capability, plan.id)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use common::misc::BillingPeriod;

    use super::*;
    use crate::testing::{self, Harness};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap()
    }

    async fn activate(h: &Harness, user_id: &Uuid, plan: PlanId) {
        h.billing
            .machine
            .complete_checkout(
                user_id,
                plan,
                BillingPeriod::Monthly,
                now() + Duration::days(30),
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn free_user_with_two_budgets_is_denied_a_third() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let resolver = &h.billing.resolver;

        let first = resolver.resolve(&user_id, Capability::CreateBudget).await.unwrap();
        assert_eq!(first.remaining, Some(1));
        resolver.resolve(&user_id, Capability::CreateBudget).await.unwrap();

        let third = resolver.resolve(&user_id, Capability::CreateBudget).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, Some(0));
        assert!(third.reason.unwrap().contains("budgets"));
    }

    #[tokio::test]
    async fn check_never_consumes() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        for _ in 0..5 {
            let decision = h
                .billing
                .resolver
                .check(&user_id, Capability::CreateGoal)
                .await
                .unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(1));
        }
    }

    #[tokio::test]
    async fn flags_follow_the_plan() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        let resolver = &h.billing.resolver;
        assert!(!resolver.check(&user_id, Capability::ExportData).await.unwrap().allowed);

        activate(&h, &user_id, PlanId::Plus).await;
        assert!(resolver.check(&user_id, Capability::ExportData).await.unwrap().allowed);
        assert!(!resolver.check(&user_id, Capability::TextToSpeech).await.unwrap().allowed);
        assert!(!resolver.check(&user_id, Capability::ProFeatures).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn pro_is_unlimited() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        activate(&h, &user_id, PlanId::Pro).await;
        let resolver = &h.billing.resolver;

        for _ in 0..20 {
            let decision = resolver.resolve(&user_id, Capability::AskZenio).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(-1));
        }
        assert!(resolver.resolve(&user_id, Capability::ProFeatures).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn canceling_pro_keeps_limits_but_not_pro_features() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        activate(&h, &user_id, PlanId::Pro).await;
        h.billing.machine.cancel(&user_id).await.unwrap();
        let resolver = &h.billing.resolver;

        let pro = resolver.check(&user_id, Capability::ProFeatures).await.unwrap();
        assert!(!pro.allowed);
        assert!(pro.reason.unwrap().contains("active PRO"));
        assert!(resolver.check(&user_id, Capability::TextToSpeech).await.unwrap().allowed);
        assert_eq!(
            resolver.check(&user_id, Capability::AskZenio).await.unwrap().remaining,
            Some(-1)
        );
    }

    #[tokio::test]
    async fn lapsed_trial_falls_back_to_free_limits() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        h.billing
            .machine
            .start_trial(&user_id, PlanId::Pro, "device-1", "ios")
            .await
            .unwrap();
        let resolver = &h.billing.resolver;
        assert!(resolver.check(&user_id, Capability::TextToSpeech).await.unwrap().allowed);

        h.clock.advance(Duration::days(8));
        for capability in [
            Capability::TextToSpeech,
            Capability::ExportData,
            Capability::BudgetAlerts,
            Capability::ProFeatures,
        ] {
            assert!(!resolver.check(&user_id, capability).await.unwrap().allowed);
        }
        let zenio = resolver.check(&user_id, Capability::AskZenio).await.unwrap();
        assert_eq!(zenio.remaining, Some(15));
    }

    #[test]
    fn stored_expired_status_is_never_honoured() {
        let mut parked = Subscription::free(Uuid::new_v4(), catalog::CURRENT_VERSION, now());
        parked.status = SubscriptionStatus::Expired;
        assert!(effective_plan(&parked).unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_reports_limits_and_usage() {
        let h = testing::harness(now());
        let user_id = Uuid::new_v4();
        activate(&h, &user_id, PlanId::Plus).await;
        let resolver = &h.billing.resolver;
        for _ in 0..3 {
            resolver.resolve(&user_id, Capability::AskZenio).await.unwrap();
        }

        let snapshot = resolver.snapshot(&user_id).await.unwrap();
        assert_eq!(snapshot.subscription.plan, PlanId::Plus);
        assert_eq!(snapshot.limits.zenio_queries, 300);
        assert_eq!(snapshot.zenio_usage.used, 3);
        assert_eq!(snapshot.zenio_usage.remaining, 297);
        assert_eq!(snapshot.usage[&Feature::Budgets].used, 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["usage"]["zenioQueries"]["used"], 3);
        assert_eq!(json["subscription"]["status"], "ACTIVE");
    }
}
