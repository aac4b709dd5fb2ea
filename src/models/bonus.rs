use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};

/// Days between a qualifying purchase and the bonus accrual
pub const ACCRUAL_DELAY_DAYS: u64 = 2;
/// Months a bonus stays spendable after accrual
pub const BONUS_LIFETIME_MONTHS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bonus {
    pub account_id: String,
    pub amount: Decimal,
    pub accured_on: NaiveDate,
    pub expired_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBonusData {
    pub account_id: String,
    pub amount: Decimal,
    pub accured_on: NaiveDate,
    pub expired_on: NaiveDate,
}

impl Bonus {
    /// Records an accrued bonus; a repeat accrual for the same day is ignored
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &CreateBonusData,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO fora.bonuses (account_id, amount, accured_on, expired_on)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_id, accured_on) DO NOTHING
            "#,
        )
        .bind(&data.account_id)
        .bind(data.amount)
        .bind(data.accured_on)
        .bind(data.expired_on)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.accured_on <= today && today < self.expired_on
    }
}

/// Accrual date of the bonus earned by a purchase made at `purchased_at`
pub fn accrual_date(purchased_at: DateTime<Utc>) -> NaiveDate {
    purchased_at.date_naive() + Days::new(ACCRUAL_DELAY_DAYS)
}

/// Last day (exclusive) a bonus accrued on `accured_on` can be spent
///
/// Clamped to the end of the target month, so Nov 30 expires on Feb 28/29.
pub fn expiry_date(accured_on: NaiveDate) -> NaiveDate {
    accured_on
        .checked_add_months(Months::new(BONUS_LIFETIME_MONTHS))
        .unwrap_or(NaiveDate::MAX)
}
