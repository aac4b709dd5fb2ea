use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;

use crate::config::MaintenanceSettings;
use crate::models::{
    bonus::{accrual_date, expiry_date, CreateBonusData},
    coupon::CreateCouponData,
    Coupon, CouponStatus, CouponTransition, Receipt,
};

/// Decides what happens to a coupon held by a user once its receipts are synced
///
/// Returns `None` while the coupon has not been used yet.
pub fn reconcile_held(
    coupon: &Coupon,
    receipts: &[Receipt],
    settings: &MaintenanceSettings,
) -> Option<CouponTransition> {
    if receipts.is_empty() {
        return None;
    }

    let transition = if coupon.is_referral {
        let trigger = receipts
            .iter()
            .filter(|r| r.total + r.discount >= settings.referral_minimum_spend)
            .min_by_key(|r| r.created_at);

        match trigger {
            Some(receipt) => referral_reward(coupon, receipt.created_at, settings),
            None => CouponTransition {
                spawn: Some(CreateCouponData {
                    status: CouponStatus::Available,
                    ..replacement(coupon)
                }),
                ..CouponTransition::new(coupon.id, coupon.status, CouponStatus::Canceled)
            },
        }
    } else {
        let used: Decimal = receipts.iter().map(|r| r.discount).sum();
        let remainder = coupon.discount - used;

        if remainder > settings.coupon_remainder_threshold {
            CouponTransition {
                spawn: Some(CreateCouponData {
                    status: CouponStatus::Template,
                    discount: Decimal::ZERO,
                    required_spend: Decimal::ZERO,
                    ..replacement(coupon)
                }),
                ..CouponTransition::new(coupon.id, coupon.status, CouponStatus::Canceled)
            }
        } else {
            CouponTransition::new(coupon.id, coupon.status, CouponStatus::Applied)
        }
    };

    Some(transition)
}

/// Decides the fate of a funded template from the account's live bonus balance
///
/// An empty balance never releases a coupon, even one whose discount is 0.
pub fn release_template(coupon: &Coupon, live_balance: Decimal) -> CouponTransition {
    if live_balance <= Decimal::ZERO || live_balance < coupon.discount {
        CouponTransition::new(coupon.id, coupon.status, CouponStatus::Reported)
    } else {
        CouponTransition {
            discount: Some(live_balance),
            ..CouponTransition::new(coupon.id, coupon.status, CouponStatus::Available)
        }
    }
}

fn referral_reward(
    coupon: &Coupon,
    purchased_at: DateTime<Utc>,
    settings: &MaintenanceSettings,
) -> CouponTransition {
    let accured_on = accrual_date(purchased_at);
    let expired_on = expiry_date(accured_on);

    CouponTransition {
        bonus: Some(CreateBonusData {
            account_id: coupon.account_id.clone(),
            amount: settings.referral_reward_amount,
            accured_on,
            expired_on,
        }),
        spawn: Some(CreateCouponData {
            status: CouponStatus::Template,
            family_id: coupon.family_id,
            account_id: coupon.account_id.clone(),
            discount: settings.referral_reward_amount,
            required_spend: Decimal::ZERO,
            is_referral: false,
            expired_at: start_of_day(expired_on),
        }),
        ..CouponTransition::new(coupon.id, coupon.status, CouponStatus::Applied)
    }
}

/// Same account, family and terms as `coupon`
fn replacement(coupon: &Coupon) -> CreateCouponData {
    CreateCouponData {
        status: coupon.status,
        family_id: coupon.family_id,
        account_id: coupon.account_id.clone(),
        discount: coupon.discount,
        required_spend: coupon.required_spend,
        is_referral: coupon.is_referral,
        expired_at: coupon.expired_at,
    }
}

pub(crate) fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
