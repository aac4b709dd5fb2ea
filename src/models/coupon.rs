use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::account::AccountCredentials;
use super::bonus::{Bonus, CreateBonusData};

/// Lifecycle of a coupon
///
/// ```text
/// template ──► available ──► assigned ──► hidden ──► awaiting_receipt
///    │                          │           │              │
///    ▼                          └───────────┴──────────────┴──► applied | canceled
/// reported                                                        │
///                                                                 ▼
///                                                   awaiting_refund ──► refunded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    Template,
    Available,
    Assigned,
    Hidden,
    AwaitingReceipt,
    Applied,
    Canceled,
    Reported,
    AwaitingRefund,
    Refunded,
}

impl CouponStatus {
    pub const RECONCILABLE: [CouponStatus; 3] = [
        CouponStatus::Assigned,
        CouponStatus::Hidden,
        CouponStatus::AwaitingReceipt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Template => "template",
            CouponStatus::Available => "available",
            CouponStatus::Assigned => "assigned",
            CouponStatus::Hidden => "hidden",
            CouponStatus::AwaitingReceipt => "awaiting_receipt",
            CouponStatus::Applied => "applied",
            CouponStatus::Canceled => "canceled",
            CouponStatus::Reported => "reported",
            CouponStatus::AwaitingRefund => "awaiting_refund",
            CouponStatus::Refunded => "refunded",
        }
    }

    /// Coupons in the hands of a user whose receipts must be checked
    pub fn is_reconcilable(&self) -> bool {
        Self::RECONCILABLE.contains(self)
    }

    /// Whether `self -> next` is a forward move of the lifecycle
    pub fn can_transition_to(&self, next: CouponStatus) -> bool {
        use CouponStatus::*;
        matches!(
            (*self, next),
            (Template, Available)
                | (Template, Reported)
                | (Available, Assigned)
                | (Assigned, Hidden)
                | (Assigned | Hidden, AwaitingReceipt)
                | (Assigned | Hidden | AwaitingReceipt, Applied)
                | (Assigned | Hidden | AwaitingReceipt, Canceled)
                | (Applied, AwaitingRefund)
                | (AwaitingRefund, Refunded)
        )
    }
}

impl fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CouponStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "template" => CouponStatus::Template,
            "available" => CouponStatus::Available,
            "assigned" => CouponStatus::Assigned,
            "hidden" => CouponStatus::Hidden,
            "awaiting_receipt" => CouponStatus::AwaitingReceipt,
            "applied" => CouponStatus::Applied,
            "canceled" => CouponStatus::Canceled,
            "reported" => CouponStatus::Reported,
            "awaiting_refund" => CouponStatus::AwaitingRefund,
            "refunded" => CouponStatus::Refunded,
            other => return Err(format!("unknown coupon status: {other}")),
        })
    }
}

impl TryFrom<String> for CouponStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: CouponStatus,
    pub family_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub account_id: String,
    pub discount: Decimal,
    pub required_spend: Decimal,
    pub is_referral: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateCouponData {
    pub status: CouponStatus,
    pub family_id: Option<Uuid>,
    pub account_id: String,
    pub discount: Decimal,
    pub required_spend: Decimal,
    pub is_referral: bool,
    pub expired_at: DateTime<Utc>,
}

/// A coupon together with the credentials of the account that backs it
#[derive(Debug, Clone)]
pub struct CouponWithAccount {
    pub coupon: Coupon,
    pub account: AccountCredentials,
}

/// One guarded status change and its side effects, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct CouponTransition {
    pub coupon_id: Uuid,
    pub from: CouponStatus,
    pub to: CouponStatus,
    /// New discount, when the transition pins it
    pub discount: Option<Decimal>,
    pub bonus: Option<CreateBonusData>,
    pub spawn: Option<CreateCouponData>,
}

impl CouponTransition {
    pub fn new(coupon_id: Uuid, from: CouponStatus, to: CouponStatus) -> Self {
        Self {
            coupon_id,
            from,
            to,
            discount: None,
            bonus: None,
            spawn: None,
        }
    }
}

impl Coupon {
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &CreateCouponData,
    ) -> Result<Uuid, sqlx::Error> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO fora.coupons (
                status, family_id, account_id, discount,
                required_spend, is_referral, expired_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(data.status.as_str())
        .bind(data.family_id)
        .bind(&data.account_id)
        .bind(data.discount)
        .bind(data.required_spend)
        .bind(data.is_referral)
        .bind(data.expired_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    pub async fn find_by_statuses(
        pool: &PgPool,
        statuses: &[CouponStatus],
    ) -> Result<Vec<Self>, sqlx::Error> {
        let statuses: Vec<&str> = statuses.iter().map(CouponStatus::as_str).collect();
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM fora.coupons
            WHERE status = ANY($1)
            ORDER BY created_at
            "#,
        )
        .bind(statuses)
        .fetch_all(pool)
        .await
    }

    /// Template coupons whose bonus funding now covers their discount
    ///
    /// Non-referral coupons are funded by the account's own active bonuses,
    /// referral coupons by the active bonuses of the accounts it referred.
    pub async fn find_fundable_templates(
        pool: &PgPool,
        today: NaiveDate,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT c.* FROM fora.coupons c
            LEFT JOIN (
                SELECT account_id, SUM(amount) AS amount
                FROM fora.bonuses
                WHERE accured_on <= $1 AND expired_on > $1
                GROUP BY account_id
            ) own ON own.account_id = c.account_id
            LEFT JOIN (
                SELECT a.referrer_id AS account_id, SUM(b.amount) AS amount
                FROM fora.bonuses b
                JOIN fora.accounts a ON a.id = b.account_id
                WHERE b.accured_on <= $1 AND b.expired_on > $1
                GROUP BY a.referrer_id
            ) referred ON referred.account_id = c.account_id
            WHERE c.status = 'template'
              AND (
                (NOT c.is_referral AND own.amount >= c.discount)
                OR (c.is_referral AND referred.amount >= c.discount)
              )
            ORDER BY c.created_at
            "#,
        )
        .bind(today)
        .fetch_all(pool)
        .await
    }

    pub async fn count_available_referral(
        pool: &PgPool,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM fora.coupons
            WHERE status = 'available'
              AND is_referral
              AND family_id = $1
              AND expired_at > $2
            "#,
        )
        .bind(family_id)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }

    /// Applies a transition inside a transaction
    ///
    /// The status update is guarded by the expected current status, so a
    /// concurrent change makes it a no-op and no side effects are written.
    pub async fn apply_transition(
        pool: &PgPool,
        transition: &CouponTransition,
    ) -> Result<bool, sqlx::Error> {
        let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE fora.coupons
            SET status = $3, discount = COALESCE($4, discount)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(transition.coupon_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.discount)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(bonus) = &transition.bonus {
            Bonus::create(&mut *tx, bonus).await?;
        }
        if let Some(coupon) = &transition.spawn {
            Self::create(&mut *tx, coupon).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Hands the soonest-expiring available coupon to a user
    ///
    /// `SKIP LOCKED` keeps concurrent requests from picking the same row.
    pub async fn assign_available(
        pool: &PgPool,
        user_id: Uuid,
        family_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        let assigned: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE fora.coupons
            SET status = 'assigned', user_id = $1, assigned_at = $3
            WHERE id = (
                SELECT id FROM fora.coupons
                WHERE status = 'available'
                  AND expired_at > $3
                  AND (family_id IS NULL OR family_id = $2)
                ORDER BY expired_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(family_id)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        Ok(assigned.map(|(id,)| id))
    }

    /// Moves a user's coupon between user-driven statuses
    pub async fn set_user_status(
        pool: &PgPool,
        coupon_id: Uuid,
        user_id: Uuid,
        from: &[CouponStatus],
        to: CouponStatus,
    ) -> Result<bool, sqlx::Error> {
        let from: Vec<&str> = from.iter().map(CouponStatus::as_str).collect();
        let updated = sqlx::query(
            r#"
            UPDATE fora.coupons
            SET status = $4
            WHERE id = $1 AND user_id = $2 AND status = ANY($3)
            "#,
        )
        .bind(coupon_id)
        .bind(user_id)
        .bind(from)
        .bind(to.as_str())
        .execute(pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }
}
