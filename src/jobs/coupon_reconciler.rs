use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::coupon_policy::{reconcile_held, release_template};
use super::JobContext;
use crate::error::{AppError, Result};
use crate::models::{AccountCredentials, CouponStatus, CouponTransition, CouponWithAccount};
use crate::services::fora::Session;
use crate::services::receipts::{fetch_receipts_since, money, refresh_if_expired};

#[derive(Debug, Default)]
pub struct ReconcileStats {
    pub coupons_checked: usize,
    pub applied: usize,
    pub canceled: usize,
    pub unchanged: usize,
    pub templates_checked: usize,
    pub released: usize,
    pub reported: usize,
    pub conflicts: usize,
    pub failures: usize,
}

impl ReconcileStats {
    fn count(&mut self, transition: &CouponTransition) {
        match transition.to {
            CouponStatus::Applied => self.applied += 1,
            CouponStatus::Canceled => self.canceled += 1,
            CouponStatus::Available => self.released += 1,
            CouponStatus::Reported => self.reported += 1,
            _ => {}
        }
    }
}

/// Sessions refreshed during this run, so an account backing several
/// coupons is refreshed once
#[derive(Default)]
struct Sessions(HashMap<String, Session>);

impl Sessions {
    async fn get(
        &mut self,
        ctx: JobContext<'_>,
        account: &AccountCredentials,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        if let Some(session) = self.0.get(&account.account_id) {
            return Ok(session.clone());
        }
        let session = refresh_if_expired(ctx.store, ctx.fora, account, now).await?;
        self.0.insert(account.account_id.clone(), session.clone());
        Ok(session)
    }
}

/// Settles coupons held by users against their receipts, then releases
/// template coupons whose bonus funding has arrived
pub async fn reconcile_coupons(ctx: JobContext<'_>, now: DateTime<Utc>) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();
    let mut sessions = Sessions::default();

    let held = ctx.store.coupons_to_reconcile().await?;
    stats.coupons_checked = held.len();

    tracing::info!(coupons = stats.coupons_checked, "Starting coupon reconciliation");

    for item in &held {
        match settle_held(ctx, &mut sessions, item, now).await {
            Ok(Some(transition)) => apply(ctx, &transition, &mut stats).await,
            Ok(None) => stats.unchanged += 1,
            Err(e) => {
                tracing::error!(
                    coupon_id = %item.coupon.id,
                    account_id = %item.account.account_id,
                    error = %e,
                    "Failed to reconcile coupon"
                );
                stats.failures += 1;
            }
        }
    }

    let templates = ctx.store.fundable_templates(now.date_naive()).await?;
    stats.templates_checked = templates.len();

    for item in &templates {
        match settle_template(ctx, &mut sessions, item, now).await {
            Ok(transition) => apply(ctx, &transition, &mut stats).await,
            Err(e) => {
                tracing::error!(
                    coupon_id = %item.coupon.id,
                    account_id = %item.account.account_id,
                    error = %e,
                    "Failed to release template coupon"
                );
                stats.failures += 1;
            }
        }
    }

    tracing::info!(?stats, "Coupon reconciliation completed");

    Ok(stats)
}

async fn settle_held(
    ctx: JobContext<'_>,
    sessions: &mut Sessions,
    item: &CouponWithAccount,
    now: DateTime<Utc>,
) -> Result<Option<CouponTransition>> {
    let coupon = &item.coupon;
    let session = sessions.get(ctx, &item.account, now).await?;

    let batch = fetch_receipts_since(ctx.fora, &session, coupon.id, coupon.created_at).await?;
    if !batch.receipts.is_empty() {
        ctx.store
            .insert_receipts(&batch.receipts, &batch.products)
            .await?;
        tracing::debug!(
            coupon_id = %coupon.id,
            receipts = batch.receipts.len(),
            products = batch.products.len(),
            "Synced receipts"
        );
    }

    Ok(reconcile_held(coupon, &batch.receipts, ctx.settings))
}

async fn settle_template(
    ctx: JobContext<'_>,
    sessions: &mut Sessions,
    item: &CouponWithAccount,
    now: DateTime<Utc>,
) -> Result<CouponTransition> {
    let session = sessions.get(ctx, &item.account, now).await?;
    let info = ctx.fora.get_personal_info(&session, true).await?;
    let balance = money(info.bonus.bonus_balance_amount)?;

    Ok(release_template(&item.coupon, balance))
}

/// Applies a transition; a coupon that moved on meanwhile is a conflict, not a failure
async fn apply(ctx: JobContext<'_>, transition: &CouponTransition, stats: &mut ReconcileStats) {
    if !transition.from.can_transition_to(transition.to) {
        let e = AppError::Integrity(format!(
            "refusing to move coupon {} from {} to {}",
            transition.coupon_id, transition.from, transition.to
        ));
        tracing::error!(error = %e, "Invalid coupon transition");
        stats.failures += 1;
        return;
    }

    match ctx.store.apply_transition(transition).await {
        Ok(true) => {
            tracing::info!(
                coupon_id = %transition.coupon_id,
                from = %transition.from,
                to = %transition.to,
                spawned = transition.spawn.is_some(),
                "Coupon status updated"
            );
            stats.count(transition);
        }
        Ok(false) => {
            tracing::warn!(
                coupon_id = %transition.coupon_id,
                expected = %transition.from,
                "Coupon changed status concurrently, skipping"
            );
            stats.conflicts += 1;
        }
        Err(e) => {
            tracing::error!(
                coupon_id = %transition.coupon_id,
                error = %e,
                "Failed to update coupon"
            );
            stats.failures += 1;
        }
    }
}
