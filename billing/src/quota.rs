use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use common::error::{AppError, Res};
use serde::Serialize;
use uuid::Uuid;

use crate::{catalog::UNLIMITED, clock::Clock, model::Feature, store::BillingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    pub used: i64,
    pub limit: i64,
    /// `-1` when unlimited.
    pub remaining: i64,
}

impl QuotaDecision {
    fn new(allowed: bool, used: i64, limit: i64) -> Self {
        QuotaDecision {
            allowed,
            used,
            limit,
            remaining: remaining(limit, used),
        }
    }
}

pub fn is_unlimited(limit: i64) -> bool {
    limit < 0
}

pub fn remaining(limit: i64, used: i64) -> i64 {
    if is_unlimited(limit) {
        UNLIMITED
    } else {
        (limit - used).max(0)
    }
}

/// First instant of the calendar month (UTC) containing `now`.
pub fn period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Per-user, per-feature monthly counters.
pub struct QuotaTracker {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        QuotaTracker { store, clock }
    }

    /// Counts one use if the user is still under `limit`. Two concurrent
    /// callers at `limit - 1` cannot both succeed: the store applies the
    /// check and the increment as one conditional write.
    pub async fn check_and_increment(
        &self,
        user_id: &Uuid,
        feature: Feature,
        limit: i64,
    ) -> Res<QuotaDecision> {
        ensure_countable(feature)?;
        let limit = if is_unlimited(limit) { UNLIMITED } else { limit };
        let window = period_start(self.clock.now());

        if limit == 0 {
            return Ok(QuotaDecision::new(false, 0, 0));
        }

        match self
            .store
            .increment_usage(user_id, feature, window, limit)
            .await?
        {
            Some(count) => Ok(QuotaDecision::new(true, count, limit)),
            None => {
                log::debug!("Quota for {} reached by user {}", feature, user_id);
                let used = self.used(user_id, feature).await?;
                Ok(QuotaDecision::new(false, used, limit))
            }
        }
    }

    /// Same answer as `check_and_increment` would give, without counting.
    pub async fn peek(&self, user_id: &Uuid, feature: Feature, limit: i64) -> Res<QuotaDecision> {
        ensure_countable(feature)?;
        let used = self.used(user_id, feature).await?;
        let allowed = is_unlimited(limit) || used < limit;
        Ok(QuotaDecision::new(allowed, used, limit))
    }

    /// Gives back one use, e.g. when the counted budget is deleted. Returns
    /// the count left in the current window.
    pub async fn release(&self, user_id: &Uuid, feature: Feature) -> Res<i64> {
        ensure_countable(feature)?;
        let window = period_start(self.clock.now());
        let count = self.store.release_usage(user_id, feature, window).await?;
        Ok(count.unwrap_or(0))
    }

    /// Uses counted in the current window; a row from an older month reads
    /// as zero.
    pub async fn used(&self, user_id: &Uuid, feature: Feature) -> Res<i64> {
        let window = period_start(self.clock.now());
        Ok(match self.store.get_usage(user_id, feature).await? {
            Some(usage) if usage.period_start >= window => usage.count,
            _ => 0,
        })
    }
}

fn ensure_countable(feature: Feature) -> Res<()> {
    if feature.is_countable() {
        Ok(())
    } else {
        Err(AppError::Unprocessable(format!(
            "{} is not a metered feature",
            feature
        )))
    }
}
