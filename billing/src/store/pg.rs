use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use db::models::{
    quota::QuotaUsage as QuotaRow, session::CheckoutSession as SessionRow,
    sub::Subscription as SubscriptionRow,
};
use sqlx::PgPool;
use uuid::Uuid;

use super::{BillingStore, TrialWrite};
use crate::model::{
    CheckoutSession, DeviceTrial, Feature, PaymentStatus, QuotaUsage, SessionStatus, Subscription,
};

/// Postgres-backed store built on the `db` crate's query functions.
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        PgStore { pool }
    }
}

fn to_row(sub: &Subscription) -> Res<SubscriptionRow> {
    Ok(SubscriptionRow {
        user_id: sub.user_id,
        plan: sub.plan.as_str().to_string(),
        status: sub.status.as_str().to_string(),
        billing_period: sub.billing_period.as_str().to_string(),
        trial_started_at: sub.trial_started_at,
        trial_ends_at: sub.trial_ends_at,
        can_use_trial: sub.can_use_trial,
        cancel_at_period_end: sub.cancel_at_period_end,
        payment_past_due: sub.payment_past_due,
        current_period_end: sub.current_period_end,
        device_trial_fingerprint: sub.device_trial_fingerprint.clone(),
        catalog_version: i32::try_from(sub.catalog_version)
            .map_err(|e| AppError::Internal(format!("Catalog version out of range: {}", e)))?,
        external_subscription_id: sub.external_subscription_id.clone(),
        version: sub.version,
        created_at: sub.created_at,
        updated_at: sub.updated_at,
    })
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = AppError;

    fn try_from(row: SubscriptionRow) -> Res<Self> {
        Ok(Subscription {
            user_id: row.user_id,
            plan: row.plan.parse()?,
            status: row.status.parse()?,
            billing_period: row.billing_period.parse()?,
            trial_started_at: row.trial_started_at,
            trial_ends_at: row.trial_ends_at,
            can_use_trial: row.can_use_trial,
            cancel_at_period_end: row.cancel_at_period_end,
            payment_past_due: row.payment_past_due,
            current_period_end: row.current_period_end,
            device_trial_fingerprint: row.device_trial_fingerprint,
            catalog_version: u32::try_from(row.catalog_version)
                .map_err(|e| AppError::Internal(format!("Catalog version out of range: {}", e)))?,
            external_subscription_id: row.external_subscription_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<QuotaRow> for QuotaUsage {
    type Error = AppError;

    fn try_from(row: QuotaRow) -> Res<Self> {
        Ok(QuotaUsage {
            user_id: row.user_id,
            feature: row.feature.parse()?,
            period_start: row.period_start,
            count: row.count,
        })
    }
}

impl TryFrom<SessionRow> for CheckoutSession {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Res<Self> {
        Ok(CheckoutSession {
            session_id: row.session_id,
            user_id: row.user_id,
            target_plan: row.target_plan.parse()?,
            billing_period: row.billing_period.parse()?,
            status: row.status.parse()?,
            payment_status: row.payment_status.parse()?,
            redirect_url: row.redirect_url,
            created_at: row.created_at,
            reconciled_at: row.reconciled_at,
        })
    }
}

fn convert<R, T: TryFrom<R, Error = AppError>>(row: Option<R>) -> Res<Option<T>> {
    row.map(T::try_from).transpose()
}

#[async_trait]
impl BillingStore for PgStore {
    async fn get_subscription(&self, user_id: &Uuid) -> Res<Option<Subscription>> {
        convert(db::sub::get_subscription(&*self.pool, user_id).await?)
    }

    async fn get_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> Res<Option<Subscription>> {
        convert(db::sub::get_subscription_by_external_id(&*self.pool, external_subscription_id).await?)
    }

    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Res<Option<Subscription>> {
        let catalog_version = to_row(subscription)?.catalog_version;
        convert(
            db::sub::insert_subscription(&*self.pool, &subscription.user_id, catalog_version)
                .await?,
        )
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Res<Option<Subscription>> {
        let row = to_row(subscription)?;
        convert(db::sub::update_subscription(&*self.pool, &row).await?)
    }

    async fn expirable_user_ids(&self, now: DateTime<Utc>) -> Res<Vec<Uuid>> {
        db::sub::get_expirable_user_ids(&*self.pool, now).await
    }

    async fn device_trial_used(&self, device_fingerprint: &str) -> Res<bool> {
        db::trial::exists_device_trial(&*self.pool, device_fingerprint).await
    }

    async fn start_trial(
        &self,
        subscription: &Subscription,
        trial: &DeviceTrial,
    ) -> Res<TrialWrite> {
        let row = to_row(subscription)?;
        let mut tx = self.pool.begin().await?;

        let recorded = db::trial::insert_device_trial(
            &mut *tx,
            &trial.device_fingerprint,
            &trial.user_id,
            &trial.platform,
            trial.used_at,
        )
        .await?;
        if !recorded {
            tx.rollback().await?;
            return Ok(TrialWrite::DeviceUsed);
        }

        let Some(written) = db::sub::update_subscription(&mut *tx, &row).await? else {
            tx.rollback().await?;
            return Ok(TrialWrite::Conflict);
        };

        tx.commit().await?;
        Ok(TrialWrite::Written(written.try_into()?))
    }

    async fn increment_usage(
        &self,
        user_id: &Uuid,
        feature: Feature,
        period_start: DateTime<Utc>,
        limit: i64,
    ) -> Res<Option<i64>> {
        db::quota::increment_usage(&*self.pool, user_id, feature.as_str(), period_start, limit)
            .await
    }

    async fn get_usage(&self, user_id: &Uuid, feature: Feature) -> Res<Option<QuotaUsage>> {
        convert(db::quota::get_usage(&*self.pool, user_id, feature.as_str()).await?)
    }

    async fn release_usage(
        &self,
        user_id: &Uuid,
        feature: Feature,
        period_start: DateTime<Utc>,
    ) -> Res<Option<i64>> {
        db::quota::release_usage(&*self.pool, user_id, feature.as_str(), period_start).await
    }

    async fn insert_session(&self, session: &CheckoutSession) -> Res<CheckoutSession> {
        let row = SessionRow {
            session_id: session.session_id.clone(),
            user_id: session.user_id,
            target_plan: session.target_plan.as_str().to_string(),
            billing_period: session.billing_period.as_str().to_string(),
            status: session.status.as_str().to_string(),
            payment_status: session.payment_status.as_str().to_string(),
            redirect_url: session.redirect_url.clone(),
            created_at: session.created_at,
            reconciled_at: session.reconciled_at,
        };
        db::session::insert_session(&*self.pool, &row).await?.try_into()
    }

    async fn get_session(&self, session_id: &str) -> Res<Option<CheckoutSession>> {
        convert(db::session::get_session(&*self.pool, session_id).await?)
    }

    async fn update_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        payment_status: PaymentStatus,
        reconciled_at: Option<DateTime<Utc>>,
    ) -> Res<Option<CheckoutSession>> {
        convert(
            db::session::update_session_status(
                &*self.pool,
                session_id,
                status.as_str(),
                payment_status.as_str(),
                reconciled_at,
            )
            .await?,
        )
    }
}
