use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    misc::{BillingPeriod, PlanId, SubscriptionStatus},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single authoritative subscription row of a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan: PlanId,
    pub status: SubscriptionStatus,
    pub billing_period: BillingPeriod,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub can_use_trial: bool,
    pub cancel_at_period_end: bool,
    /// Set when the lapse was caused by a failed recurring charge rather than
    /// by the user. Only such a lapse is undone by a later successful charge.
    pub payment_past_due: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub device_trial_fingerprint: Option<String>,
    pub catalog_version: u32,
    #[serde(skip)]
    pub external_subscription_id: Option<String>,
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The row every user starts from.
    pub fn free(user_id: Uuid, catalog_version: u32, now: DateTime<Utc>) -> Self {
        Subscription {
            user_id,
            plan: PlanId::Free,
            status: SubscriptionStatus::Free,
            billing_period: BillingPeriod::Monthly,
            trial_started_at: None,
            trial_ends_at: None,
            can_use_trial: true,
            cancel_at_period_end: false,
            payment_past_due: false,
            current_period_end: None,
            device_trial_fingerprint: None,
            catalog_version,
            external_subscription_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_access(&self) -> bool {
        self.status.has_access()
    }

    /// End of whatever window currently grants access: the trial window for
    /// trials, the paid period otherwise.
    pub fn access_ends_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            SubscriptionStatus::Trialing => self.trial_ends_at,
            _ => self.current_period_end,
        }
    }
}

/// Metered or flagged product features, keyed by their catalog names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    Budgets,
    Goals,
    ZenioQueries,
    Reminders,
    ExportData,
    TextToSpeech,
    BudgetAlerts,
}

impl Feature {
    pub const COUNTABLE: [Feature; 4] = [
        Feature::Budgets,
        Feature::Goals,
        Feature::ZenioQueries,
        Feature::Reminders,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Budgets => "budgets",
            Feature::Goals => "goals",
            Feature::ZenioQueries => "zenioQueries",
            Feature::Reminders => "reminders",
            Feature::ExportData => "exportData",
            Feature::TextToSpeech => "textToSpeech",
            Feature::BudgetAlerts => "budgetAlerts",
        }
    }

    /// Countable features are metered per month; the rest are 0/1 flags.
    pub fn is_countable(&self) -> bool {
        Feature::COUNTABLE.contains(self)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "budgets" => Ok(Feature::Budgets),
            "goals" => Ok(Feature::Goals),
            "zenioQueries" => Ok(Feature::ZenioQueries),
            "reminders" => Ok(Feature::Reminders),
            "exportData" => Ok(Feature::ExportData),
            "textToSpeech" => Ok(Feature::TextToSpeech),
            "budgetAlerts" => Ok(Feature::BudgetAlerts),
            _ => Err(AppError::Unprocessable(format!("Unknown feature '{}'", s))),
        }
    }
}

/// Actions a client can ask the resolver about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    CreateBudget,
    CreateGoal,
    CreateReminder,
    AskZenio,
    ExportData,
    TextToSpeech,
    BudgetAlerts,
    ProFeatures,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CreateBudget => "create-budget",
            Capability::CreateGoal => "create-goal",
            Capability::CreateReminder => "create-reminder",
            Capability::AskZenio => "ask-zenio",
            Capability::ExportData => "export-data",
            Capability::TextToSpeech => "text-to-speech",
            Capability::BudgetAlerts => "budget-alerts",
            Capability::ProFeatures => "pro-features",
        }
    }

    /// The catalog feature backing this capability. `pro-features` is gated
    /// on the plan itself.
    pub fn feature(&self) -> Option<Feature> {
        match self {
            Capability::CreateBudget => Some(Feature::Budgets),
            Capability::CreateGoal => Some(Feature::Goals),
            Capability::CreateReminder => Some(Feature::Reminders),
            Capability::AskZenio => Some(Feature::ZenioQueries),
            Capability::ExportData => Some(Feature::ExportData),
            Capability::TextToSpeech => Some(Feature::TextToSpeech),
            Capability::BudgetAlerts => Some(Feature::BudgetAlerts),
            Capability::ProFeatures => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-budget" => Ok(Capability::CreateBudget),
            "create-goal" => Ok(Capability::CreateGoal),
            "create-reminder" => Ok(Capability::CreateReminder),
            "ask-zenio" => Ok(Capability::AskZenio),
            "export-data" => Ok(Capability::ExportData),
            "text-to-speech" => Ok(Capability::TextToSpeech),
            "budget-alerts" => Ok(Capability::BudgetAlerts),
            "pro-features" => Ok(Capability::ProFeatures),
            _ => Err(AppError::Unprocessable(format!("Unknown capability '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaUsage {
    pub user_id: Uuid,
    pub feature: Feature,
    pub period_start: DateTime<Utc>,
    pub count: i64,
}

/// Append-only record of a device that has consumed its trial.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTrial {
    pub device_fingerprint: String,
    pub user_id: Uuid,
    pub platform: String,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Complete,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Complete => "complete",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Pending)
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "complete" => Ok(SessionStatus::Complete),
            "expired" => Ok(SessionStatus::Expired),
            _ => Err(AppError::Internal(format!("Unknown session status '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "paid" => Ok(PaymentStatus::Paid),
            _ => Err(AppError::Internal(format!("Unknown payment status '{}'", s))),
        }
    }
}

/// Local record of a processor checkout session, kept after reconciliation
/// for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub session_id: String,
    #[serde(skip)]
    pub user_id: Uuid,
    pub target_plan: PlanId,
    pub billing_period: BillingPeriod,
    pub status: SessionStatus,
    pub payment_status: PaymentStatus,
    pub redirect_url: String,
    pub created_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
}
