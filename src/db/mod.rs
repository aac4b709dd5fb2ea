use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    account::CreateAccountData,
    coupon::{CouponTransition, CouponWithAccount, CreateCouponData},
    Device, Receipt, ReceiptProduct, Subscription, TokenPair, TreeNode,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub async fn create_pool(database_url: &str) -> std::result::Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Storage operations the maintenance engine relies on
#[async_trait]
pub trait ForaStore: Send + Sync {
    // ==================== Subscriptions ====================

    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>>;

    async fn set_subscription_root(&self, subscription_id: Uuid, root_id: Option<&str>)
        -> Result<()>;

    async fn count_available_referral_coupons(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    // ==================== Referral tree ====================

    /// Root plus descendants down to `height` levels, ordered by insertion
    async fn referrer_tree(&self, root_id: &str, height: i32) -> Result<Vec<TreeNode>>;

    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Stores a registered account together with its first coupon
    async fn create_account(
        &self,
        account: &CreateAccountData,
        coupon: &CreateCouponData,
    ) -> Result<()>;

    /// Stores the empty account and the root it refers, with their coupons,
    /// and points the subscription at the root, all or nothing
    async fn plant_tree(
        &self,
        subscription_id: Uuid,
        empty: (&CreateAccountData, &CreateCouponData),
        root: (&CreateAccountData, &CreateCouponData),
    ) -> Result<()>;

    async fn update_tokens(&self, account_id: &str, tokens: &TokenPair) -> Result<()>;

    // ==================== Reconciliation ====================

    /// Coupons held by users whose receipts must be checked
    async fn coupons_to_reconcile(&self) -> Result<Vec<CouponWithAccount>>;

    /// Template coupons whose bonus funding covers their discount on `today`
    async fn fundable_templates(&self, today: NaiveDate) -> Result<Vec<CouponWithAccount>>;

    /// Insert-or-ignore on the natural keys
    async fn insert_receipts(&self, receipts: &[Receipt], products: &[ReceiptProduct])
        -> Result<()>;

    /// Applies a guarded transition; `false` if the coupon was no longer in `from`
    async fn apply_transition(&self, transition: &CouponTransition) -> Result<bool>;

    // ==================== User actions ====================

    /// Claims the soonest-expiring available coupon for a user
    async fn assign_available_coupon(
        &self,
        user_id: Uuid,
        family_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>>;

    /// assigned -> hidden
    async fn hide_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> Result<bool>;

    /// assigned | hidden -> awaiting_receipt
    async fn await_receipt(&self, coupon_id: Uuid, user_id: Uuid) -> Result<bool>;
}

pub(crate) fn missing_account(account_id: &str) -> crate::error::AppError {
    crate::error::AppError::Integrity(format!("coupon references missing account {account_id}"))
}
