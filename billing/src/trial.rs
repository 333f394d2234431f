use std::sync::Arc;

use common::error::{AppError, Res};
use uuid::Uuid;

use crate::{model::Subscription, store::BillingStore};

/// One trial per device and one per account. Both gates must pass.
pub struct TrialGuard {
    store: Arc<dyn BillingStore>,
}

impl TrialGuard {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        TrialGuard { store }
    }

    /// Eligibility for a user who may not have a subscription row yet.
    pub async fn can_start_trial(&self, user_id: &Uuid, device_fingerprint: &str) -> Res<bool> {
        let account_ok = match self.store.get_subscription(user_id).await? {
            Some(sub) => sub.can_use_trial,
            None => true,
        };
        Ok(account_ok && !self.device_used(device_fingerprint).await?)
    }

    /// Fails with `TrialNotEligible` naming the gate that closed.
    pub async fn ensure_eligible(&self, sub: &Subscription, device_fingerprint: &str) -> Res<()> {
        if !sub.can_use_trial {
            return Err(AppError::TrialNotEligible(
                "this account has already used its free trial".to_string(),
            ));
        }
        if self.device_used(device_fingerprint).await? {
            return Err(AppError::TrialNotEligible(
                "this device has already been used for a free trial".to_string(),
            ));
        }
        Ok(())
    }

    async fn device_used(&self, device_fingerprint: &str) -> Res<bool> {
        let fingerprint = normalize_fingerprint(device_fingerprint)?;
        self.store.device_trial_used(&fingerprint).await
    }
}

pub fn normalize_fingerprint(device_fingerprint: &str) -> Res<String> {
    let fingerprint = device_fingerprint.trim();
    if fingerprint.is_empty() {
        return Err(AppError::Unprocessable(
            "A device identifier is required to start a trial".to_string(),
        ));
    }
    Ok(fingerprint.to_string())
}
