use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{missing_account, ForaStore};
use crate::error::Result;
use crate::models::{
    account::CreateAccountData,
    coupon::{CouponTransition, CouponWithAccount, CreateCouponData},
    Account, Coupon, CouponStatus, Device, Receipt, ReceiptProduct, Subscription, TokenPair,
    TreeNode,
};

/// `ForaStore` backed by the Postgres schema in `migrations/`
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_accounts(&self, coupons: Vec<Coupon>) -> Result<Vec<CouponWithAccount>> {
        let mut items = Vec::with_capacity(coupons.len());
        for coupon in coupons {
            let account = Account::find_credentials(&self.pool, &coupon.account_id)
                .await?
                .ok_or_else(|| missing_account(&coupon.account_id))?;
            items.push(CouponWithAccount { coupon, account });
        }
        Ok(items)
    }
}

#[async_trait]
impl ForaStore for PgStore {
    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        Ok(Subscription::list_active(&self.pool, now).await?)
    }

    async fn set_subscription_root(
        &self,
        subscription_id: Uuid,
        root_id: Option<&str>,
    ) -> Result<()> {
        Ok(Subscription::set_root(&self.pool, subscription_id, root_id).await?)
    }

    async fn count_available_referral_coupons(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(Coupon::count_available_referral(&self.pool, family_id, now).await?)
    }

    async fn referrer_tree(&self, root_id: &str, height: i32) -> Result<Vec<TreeNode>> {
        Ok(Account::referrer_tree(&self.pool, root_id, height).await?)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(Device::list_all(&self.pool).await?)
    }

    async fn create_account(
        &self,
        account: &CreateAccountData,
        coupon: &CreateCouponData,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Account::create(&mut *tx, account).await?;
        Coupon::create(&mut *tx, coupon).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn plant_tree(
        &self,
        subscription_id: Uuid,
        (empty, empty_coupon): (&CreateAccountData, &CreateCouponData),
        (root, root_coupon): (&CreateAccountData, &CreateCouponData),
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Account::create(&mut *tx, empty).await?;
        Coupon::create(&mut *tx, empty_coupon).await?;
        Account::create(&mut *tx, root).await?;
        Coupon::create(&mut *tx, root_coupon).await?;
        Subscription::set_root(&mut *tx, subscription_id, Some(&root.id)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_tokens(&self, account_id: &str, tokens: &TokenPair) -> Result<()> {
        Ok(Account::update_tokens(&self.pool, account_id, tokens).await?)
    }

    async fn coupons_to_reconcile(&self) -> Result<Vec<CouponWithAccount>> {
        let coupons = Coupon::find_by_statuses(&self.pool, &CouponStatus::RECONCILABLE).await?;
        self.with_accounts(coupons).await
    }

    async fn fundable_templates(&self, today: NaiveDate) -> Result<Vec<CouponWithAccount>> {
        let coupons = Coupon::find_fundable_templates(&self.pool, today).await?;
        self.with_accounts(coupons).await
    }

    async fn insert_receipts(
        &self,
        receipts: &[Receipt],
        products: &[ReceiptProduct],
    ) -> Result<()> {
        Ok(Receipt::insert_ignoring_duplicates(&self.pool, receipts, products).await?)
    }

    async fn apply_transition(&self, transition: &CouponTransition) -> Result<bool> {
        Ok(Coupon::apply_transition(&self.pool, transition).await?)
    }

    async fn assign_available_coupon(
        &self,
        user_id: Uuid,
        family_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        Ok(Coupon::assign_available(&self.pool, user_id, family_id, now).await?)
    }

    async fn hide_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(Coupon::set_user_status(
            &self.pool,
            coupon_id,
            user_id,
            &[CouponStatus::Assigned],
            CouponStatus::Hidden,
        )
        .await?)
    }

    async fn await_receipt(&self, coupon_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(Coupon::set_user_status(
            &self.pool,
            coupon_id,
            user_id,
            &[CouponStatus::Assigned, CouponStatus::Hidden],
            CouponStatus::AwaitingReceipt,
        )
        .await?)
    }
}
