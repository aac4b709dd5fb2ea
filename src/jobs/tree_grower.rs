use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::coupon_policy::start_of_day;
use super::referrer_tree::ReferrerTreeWalker;
use super::JobContext;
use crate::error::{AppError, Result};
use crate::models::{
    account::CreateAccountData, bonus::expiry_date, coupon::CreateCouponData, CouponStatus,
    Device, Subscription, TreeNode,
};
use crate::services::provisioning::register_account;
use crate::services::retry::{retry, RetryPolicy};

/// Children of every internal node of a referral tree
const TREE_FAN_OUT: i64 = 2;

#[derive(Debug, Default)]
pub struct GrowthStats {
    pub subscriptions: usize,
    pub accounts_created: usize,
    pub leaves_created: usize,
    pub trees_completed: usize,
    pub failures: usize,
}

/// Tops up the stock of available referral coupons of every active subscription
///
/// For each subscription short of its `surplus`:
/// 1. Plant a new tree (an empty account and a root it refers) if none is growing
/// 2. Register accounts under the next free parent until enough leaves exist
/// 3. Release the tree once it is complete so the next run plants a new one
pub async fn grow_referral_trees(ctx: JobContext<'_>, now: DateTime<Utc>) -> Result<GrowthStats> {
    let mut stats = GrowthStats::default();

    let subscriptions = ctx.store.active_subscriptions(now).await?;
    stats.subscriptions = subscriptions.len();

    tracing::info!(
        subscriptions = stats.subscriptions,
        "Starting referral tree growth"
    );

    if subscriptions.is_empty() {
        return Ok(stats);
    }
    let devices = ctx.store.list_devices().await?;

    for subscription in &subscriptions {
        if let Err(e) = grow_subscription(ctx, subscription, &devices, now, &mut stats).await {
            tracing::error!(
                subscription_id = %subscription.id,
                family_id = %subscription.family_id,
                error = %e,
                "Failed to grow referral tree"
            );
            stats.failures += 1;
        }
    }

    tracing::info!(?stats, "Referral tree growth completed");

    Ok(stats)
}

async fn grow_subscription(
    ctx: JobContext<'_>,
    subscription: &Subscription,
    devices: &[Device],
    now: DateTime<Utc>,
    stats: &mut GrowthStats,
) -> Result<()> {
    let available = ctx
        .store
        .count_available_referral_coupons(subscription.family_id, now)
        .await?;
    let quota = usize::try_from(i64::from(subscription.surplus) - available).unwrap_or(0);
    if quota == 0 {
        tracing::debug!(
            subscription_id = %subscription.id,
            available,
            "Coupon stock is full"
        );
        return Ok(());
    }

    let root_id = match &subscription.root_id {
        Some(root_id) => root_id.clone(),
        None => plant_tree(ctx, subscription, devices, now, stats).await?,
    };

    let mut walker = ReferrerTreeWalker::load(ctx.store, &root_id, subscription.height).await?;
    let mut leaves = 0;

    while !walker.is_empty() && leaves < quota {
        let parent = walker.peek().clone();
        let depth = parent.depth + 1;
        if depth > subscription.height {
            return Err(AppError::Integrity(format!(
                "referral tree {root_id} has node {} below its height",
                parent.id
            )));
        }
        let is_leaf = depth == subscription.height;

        let account = register_with_retry(ctx, devices, Some(&parent)).await?;
        let coupon = if is_leaf {
            leaf_coupon(ctx, subscription, &account.id, now)
        } else {
            template_coupon(ctx, subscription, &account.id, TREE_FAN_OUT, now)
        };
        ctx.store.create_account(&account, &coupon).await?;

        stats.accounts_created += 1;
        if is_leaf {
            leaves += 1;
            stats.leaves_created += 1;
        }

        tracing::info!(
            subscription_id = %subscription.id,
            account_id = %account.id,
            referrer_id = %parent.id,
            depth,
            is_leaf,
            "Grew referral tree"
        );

        walker.push(TreeNode {
            depth,
            id: account.id,
            session_id: account.session_id,
        });
    }

    if walker.is_empty() {
        ctx.store.set_subscription_root(subscription.id, None).await?;
        stats.trees_completed += 1;
        tracing::info!(
            subscription_id = %subscription.id,
            root_id = %root_id,
            "Referral tree completed"
        );
    }

    Ok(())
}

/// Registers the empty account and the root it refers, returning the root id
///
/// Both are registered before either is stored, so a failed root leaves no
/// orphan empty account behind.
async fn plant_tree(
    ctx: JobContext<'_>,
    subscription: &Subscription,
    devices: &[Device],
    now: DateTime<Utc>,
    stats: &mut GrowthStats,
) -> Result<String> {
    let empty = register_with_retry(ctx, devices, None).await?;
    let empty_node = TreeNode {
        depth: 0,
        id: empty.id.clone(),
        session_id: empty.session_id,
    };
    let root = register_with_retry(ctx, devices, Some(&empty_node)).await?;

    ctx.store
        .plant_tree(
            subscription.id,
            (&empty, &template_coupon(ctx, subscription, &empty.id, 1, now)),
            (
                &root,
                &template_coupon(ctx, subscription, &root.id, TREE_FAN_OUT, now),
            ),
        )
        .await?;
    stats.accounts_created += 2;

    tracing::info!(
        subscription_id = %subscription.id,
        empty_id = %empty.id,
        root_id = %root.id,
        "Planted referral tree"
    );

    Ok(root.id)
}

async fn register_with_retry(
    ctx: JobContext<'_>,
    devices: &[Device],
    referrer: Option<&TreeNode>,
) -> Result<CreateAccountData> {
    retry(RetryPolicy::from(ctx.settings), move || {
        register_account(ctx.fora, ctx.sms, devices, ctx.settings, referrer)
    })
    .await
}

/// Coupon a family member can claim right away
fn leaf_coupon(
    ctx: JobContext<'_>,
    subscription: &Subscription,
    account_id: &str,
    now: DateTime<Utc>,
) -> CreateCouponData {
    CreateCouponData {
        status: CouponStatus::Available,
        discount: ctx.settings.referral_reward_amount,
        ..template_coupon(ctx, subscription, account_id, 1, now)
    }
}

/// Coupon funded later by the referral bonuses of `children` referred accounts
fn template_coupon(
    ctx: JobContext<'_>,
    subscription: &Subscription,
    account_id: &str,
    children: i64,
    now: DateTime<Utc>,
) -> CreateCouponData {
    CreateCouponData {
        status: CouponStatus::Template,
        family_id: Some(subscription.family_id),
        account_id: account_id.to_string(),
        discount: ctx.settings.referral_reward_amount * Decimal::from(children),
        required_spend: ctx.settings.referral_minimum_spend,
        is_referral: true,
        expired_at: start_of_day(expiry_date(now.date_naive())),
    }
}
