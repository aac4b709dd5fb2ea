mod common;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use common::{harness, held_coupon, subscription, FakeSms};
use fora_farm::db::ForaStore;
use fora_farm::error::AppError;
use fora_farm::models::{account::CreateAccountData, Bonus, Coupon, CouponStatus};

// ==================== Tree growth ====================

#[tokio::test]
async fn test_fresh_subscription_plants_and_grows_tree() {
    let h = harness().await;
    let family_id = Uuid::new_v4();
    let sub = subscription(family_id, 3, 2);
    h.store.add_subscription(sub.clone()).await;

    let report = h.maintenance.run().await.unwrap();

    // empty account, root, then two depth-1 templates and three leaves
    assert_eq!(report.growth.accounts_created, 7);
    assert_eq!(report.growth.leaves_created, 3);
    assert_eq!(report.growth.trees_completed, 0);

    let accounts = h.store.accounts().await;
    assert_eq!(accounts.len(), 7);
    let empty = &accounts[0];
    let root = &accounts[1];
    assert_eq!(empty.referrer_id, None);
    assert_eq!(root.referrer_id.as_deref(), Some(empty.id.as_str()));
    assert_eq!(accounts[2].referrer_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(accounts[3].referrer_id, Some(accounts[2].id.clone()));
    assert_eq!(accounts[4].referrer_id, Some(accounts[2].id.clone()));
    assert_eq!(accounts[5].referrer_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(accounts[6].referrer_id, Some(accounts[5].id.clone()));

    let coupons = h.store.coupons().await;
    let leaves: Vec<_> = coupons
        .iter()
        .filter(|c| c.status == CouponStatus::Available)
        .collect();
    assert_eq!(leaves.len(), 3);
    assert!(leaves
        .iter()
        .all(|c| c.is_referral && c.discount == Decimal::new(50, 0)));

    let templates: Vec<_> = coupons
        .iter()
        .filter(|c| c.status == CouponStatus::Template)
        .collect();
    assert_eq!(templates.len(), 4);
    let empty_template = templates
        .iter()
        .find(|c| c.account_id == empty.id)
        .unwrap();
    assert_eq!(empty_template.discount, Decimal::new(50, 0));
    let root_template = templates.iter().find(|c| c.account_id == root.id).unwrap();
    assert_eq!(root_template.discount, Decimal::new(100, 0));
    assert!(coupons.iter().all(|c| c.family_id == Some(family_id)));

    let stored = h.store.subscription(sub.id).await.unwrap();
    assert_eq!(stored.root_id.as_deref(), Some(root.id.as_str()));

    // every account but the empty one was registered through a referral
    assert_eq!(h.fora.state.lock().unwrap().referrals.len(), 6);
    assert_eq!(h.fora.state.lock().unwrap().bonus_applied.len(), 7);
}

#[tokio::test]
async fn test_full_stock_is_left_alone() {
    let h = harness().await;
    h.store
        .add_subscription(subscription(Uuid::new_v4(), 3, 2))
        .await;

    h.maintenance.run().await.unwrap();
    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.growth.accounts_created, 0);
    assert_eq!(h.store.accounts().await.len(), 7);
    assert_eq!(h.sms.leased(), 7);
}

#[tokio::test]
async fn test_completed_tree_is_released() {
    let h = harness().await;
    let sub = subscription(Uuid::new_v4(), 4, 2);
    h.store.add_subscription(sub.clone()).await;

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.growth.accounts_created, 8);
    assert_eq!(report.growth.leaves_created, 4);
    assert_eq!(report.growth.trees_completed, 1);
    assert_eq!(h.store.subscription(sub.id).await.unwrap().root_id, None);

    // stock is full, so no new tree is planted
    let report = h.maintenance.run().await.unwrap();
    assert_eq!(report.growth.accounts_created, 0);
}

#[tokio::test]
async fn test_growth_resumes_existing_tree() {
    let h = harness().await;
    let family_id = Uuid::new_v4();
    let sub = subscription(family_id, 3, 2);
    h.store.add_subscription(sub.clone()).await;
    h.maintenance.run().await.unwrap();

    // a family member claims one coupon
    let claimed = h
        .store
        .assign_available_coupon(Uuid::new_v4(), Some(family_id), Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        h.store.coupon(claimed).await.unwrap().status,
        CouponStatus::Assigned
    );

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.growth.accounts_created, 1);
    assert_eq!(report.growth.trees_completed, 1);
    let accounts = h.store.accounts().await;
    assert_eq!(accounts.len(), 8);
    assert_eq!(accounts[7].referrer_id, Some(accounts[5].id.clone()));
    assert_eq!(h.store.subscription(sub.id).await.unwrap().root_id, None);
}

#[tokio::test]
async fn test_expired_subscription_is_skipped() {
    let h = harness().await;
    let mut sub = subscription(Uuid::new_v4(), 3, 2);
    sub.expired_at = Utc::now() - Duration::days(1);
    h.store.add_subscription(sub).await;

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.growth.subscriptions, 0);
    assert!(h.store.accounts().await.is_empty());
}

#[tokio::test]
async fn test_captcha_fails_run_and_releases_number() {
    let h = harness().await;
    h.fora.state.lock().unwrap().otp_send = false;
    h.store
        .add_subscription(subscription(Uuid::new_v4(), 3, 2))
        .await;

    let result = h.maintenance.run().await;

    assert!(matches!(result, Err(AppError::RunFailed { failed: 1 })));
    assert!(h.store.accounts().await.is_empty());
    assert_eq!(h.sms.leased(), 1);
    assert_eq!(h.sms.cancelled.lock().unwrap().as_slice(), ["1"]);
}

#[tokio::test]
async fn test_failed_root_leaves_no_orphan_empty_account() {
    let h = harness().await;
    h.fora.state.lock().unwrap().referral_enabled = false;
    let sub = subscription(Uuid::new_v4(), 3, 2);
    h.store.add_subscription(sub.clone()).await;

    for _ in 0..2 {
        let result = h.maintenance.run().await;
        assert!(matches!(result, Err(AppError::RunFailed { failed: 1 })));
    }

    assert!(h.store.accounts().await.is_empty());
    assert!(h.store.coupons().await.is_empty());
    assert_eq!(h.store.subscription(sub.id).await.unwrap().root_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_already_registered_number_is_retried() {
    let h = harness().await;
    h.fora
        .state
        .lock()
        .unwrap()
        .preregistered
        .insert(FakeSms::phone(1));
    h.store
        .add_subscription(subscription(Uuid::new_v4(), 1, 1))
        .await;

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.growth.accounts_created, 3);
    assert_eq!(h.sms.leased(), 4);
    let phones: Vec<_> = h
        .store
        .accounts()
        .await
        .into_iter()
        .map(|a| a.phone)
        .collect();
    assert!(!phones.contains(&"380500000001".to_string()));
}

// ==================== Coupon reconciliation ====================

#[tokio::test]
async fn test_discount_used_up_applies_coupon() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    let now = Utc::now();
    let coupon = held_coupon(&account.id, Uuid::new_v4(), 100, false, now - Duration::days(10));
    h.store.add_coupon(coupon.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(2), 400.0, 95.0);

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.applied, 1);
    assert_eq!(
        h.store.coupon(coupon.id).await.unwrap().status,
        CouponStatus::Applied
    );
    assert_eq!(h.store.coupons().await.len(), 1);

    let receipts = h.store.receipts().await;
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].coupon_id, coupon.id);
    assert_eq!(h.store.products().await.len(), 1);
}

#[tokio::test]
async fn test_large_remainder_cancels_and_spawns_template() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    let now = Utc::now();
    let family_id = Uuid::new_v4();
    let coupon = held_coupon(&account.id, family_id, 100, false, now - Duration::days(10));
    h.store.add_coupon(coupon.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(2), 400.0, 50.0);

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.canceled, 1);
    assert_eq!(
        h.store.coupon(coupon.id).await.unwrap().status,
        CouponStatus::Canceled
    );
    let spawned = h
        .store
        .coupons()
        .await
        .into_iter()
        .find(|c| c.id != coupon.id)
        .unwrap();
    assert_eq!(spawned.status, CouponStatus::Template);
    assert_eq!(spawned.account_id, account.id);
    assert_eq!(spawned.family_id, Some(family_id));
    assert!(!spawned.is_referral);
}

#[tokio::test]
async fn test_receipts_before_coupon_are_ignored() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    let now = Utc::now();
    let coupon = held_coupon(&account.id, Uuid::new_v4(), 100, false, now - Duration::days(10));
    h.store.add_coupon(coupon.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(20), 400.0, 95.0);

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.unchanged, 1);
    assert_eq!(
        h.store.coupon(coupon.id).await.unwrap().status,
        CouponStatus::AwaitingReceipt
    );
    assert!(h.store.receipts().await.is_empty());
}

#[tokio::test]
async fn test_referral_reward_funds_released_template() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    h.fora.set_balance(&account.id, 50.0);
    let now = Utc::now();
    let coupon = held_coupon(&account.id, Uuid::new_v4(), 50, true, now - Duration::days(10));
    h.store.add_coupon(coupon.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(3), 100.0, 20.0);

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.applied, 1);
    assert_eq!(report.reconcile.released, 1);
    assert_eq!(
        h.store.coupon(coupon.id).await.unwrap().status,
        CouponStatus::Applied
    );

    let bonuses = h.store.bonuses().await;
    assert_eq!(bonuses.len(), 1);
    assert_eq!(bonuses[0].account_id, account.id);
    assert_eq!(bonuses[0].amount, Decimal::new(50, 0));
    assert_eq!(
        bonuses[0].accured_on,
        (now - Duration::days(3)).date_naive() + Duration::days(2)
    );

    let released = h
        .store
        .coupons()
        .await
        .into_iter()
        .find(|c| c.id != coupon.id)
        .unwrap();
    assert_eq!(released.status, CouponStatus::Available);
    assert_eq!(released.discount, Decimal::new(50, 0));
    assert!(!released.is_referral);
}

#[tokio::test]
async fn test_short_live_balance_reports_template() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    h.fora.set_balance(&account.id, 30.0);
    let now = Utc::now();
    let coupon = held_coupon(&account.id, Uuid::new_v4(), 50, true, now - Duration::days(10));
    h.store.add_coupon(coupon.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(3), 150.0, 0.0);

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.reported, 1);
    let template = h
        .store
        .coupons()
        .await
        .into_iter()
        .find(|c| c.id != coupon.id)
        .unwrap();
    assert_eq!(template.status, CouponStatus::Reported);
}

#[tokio::test]
async fn test_referral_without_qualifying_purchase_is_replaced() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    let now = Utc::now();
    let family_id = Uuid::new_v4();
    let coupon = held_coupon(&account.id, family_id, 50, true, now - Duration::days(10));
    h.store.add_coupon(coupon.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(3), 40.0, 0.0);

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.canceled, 1);
    let replacement = h
        .store
        .coupons()
        .await
        .into_iter()
        .find(|c| c.id != coupon.id)
        .unwrap();
    assert_eq!(replacement.status, CouponStatus::Available);
    assert!(replacement.is_referral);
    assert_eq!(replacement.family_id, Some(family_id));
    assert!(h.store.bonuses().await.is_empty());
}

#[tokio::test]
async fn test_shared_receipts_are_stored_once() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    let now = Utc::now();
    let family_id = Uuid::new_v4();
    let first = held_coupon(&account.id, family_id, 100, false, now - Duration::days(10));
    let second = held_coupon(&account.id, family_id, 100, false, now - Duration::days(9));
    h.store.add_coupon(first.clone()).await;
    h.store.add_coupon(second.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(2), 400.0, 95.0);

    h.maintenance.run().await.unwrap();

    let receipts = h.store.receipts().await;
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].coupon_id, first.id);
    assert_eq!(h.store.products().await.len(), 1);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once_per_account() {
    let h = harness().await;
    let now = Utc::now();
    let account = h
        .fora
        .issue_account_expiring("+380671111111", now.timestamp() - 60);
    h.store.add_account(&account).await.unwrap();
    let family_id = Uuid::new_v4();
    for days in [10, 9] {
        h.store
            .add_coupon(held_coupon(&account.id, family_id, 50, true, now - Duration::days(days)))
            .await;
    }

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.unchanged, 2);
    assert_eq!(h.fora.state.lock().unwrap().refreshes, 1);
    let stored = &h.store.accounts().await[0];
    assert_ne!(stored.access_token, account.tokens.access_token);
    assert_ne!(stored.refresh_token, account.tokens.refresh_token);
}

#[tokio::test]
async fn test_unmatched_line_items_fail_coupon_not_run() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    let healthy = h.fora.issue_account("+380672222222");
    h.store.add_account(&healthy).await.unwrap();
    let now = Utc::now();
    let family_id = Uuid::new_v4();

    let broken = held_coupon(&account.id, family_id, 100, false, now - Duration::days(10));
    h.store.add_coupon(broken.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(2), 400.0, 95.0);
    h.fora.add_orphan_info(&account.id, now - Duration::days(1));

    let fine = held_coupon(&healthy.id, family_id, 100, false, now - Duration::days(10));
    h.store.add_coupon(fine.clone()).await;
    h.fora
        .add_cheque(&healthy.id, now - Duration::days(2), 400.0, 95.0);

    let result = h.maintenance.run().await;

    assert!(matches!(result, Err(AppError::RunFailed { failed: 1 })));
    assert_eq!(
        h.store.coupon(broken.id).await.unwrap().status,
        CouponStatus::AwaitingReceipt
    );
    assert_eq!(
        h.store.coupon(fine.id).await.unwrap().status,
        CouponStatus::Applied
    );
}

// ==================== Template release ====================

fn bonus(account_id: &str, amount: i64, accured_days_ago: i64, expires_in_days: i64) -> Bonus {
    let today = Utc::now().date_naive();
    Bonus {
        account_id: account_id.to_string(),
        amount: Decimal::new(amount, 0),
        accured_on: today - Duration::days(accured_days_ago),
        expired_on: today + Duration::days(expires_in_days),
    }
}

fn template(account_id: &str, discount: i64, is_referral: bool) -> Coupon {
    Coupon {
        status: CouponStatus::Template,
        user_id: None,
        assigned_at: None,
        ..held_coupon(
            account_id,
            Uuid::new_v4(),
            discount,
            is_referral,
            Utc::now() - Duration::days(1),
        )
    }
}

#[tokio::test]
async fn test_empty_balance_never_releases_zero_discount_template() {
    let h = harness().await;
    let account = h.fora.issue_account("+380671111111");
    h.store.add_account(&account).await.unwrap();
    h.store.add_bonus(bonus(&account.id, 50, 5, 60)).await;
    h.fora.set_balance(&account.id, 0.0);
    let now = Utc::now();
    let coupon = held_coupon(&account.id, Uuid::new_v4(), 100, false, now - Duration::days(10));
    h.store.add_coupon(coupon.clone()).await;
    h.fora
        .add_cheque(&account.id, now - Duration::days(2), 400.0, 50.0);

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.canceled, 1);
    assert_eq!(report.reconcile.released, 0);
    let spawned = h
        .store
        .coupons()
        .await
        .into_iter()
        .find(|c| c.id != coupon.id)
        .unwrap();
    assert_eq!(spawned.discount, Decimal::ZERO);
    assert_eq!(spawned.status, CouponStatus::Reported);
    assert!(h
        .store
        .coupons()
        .await
        .iter()
        .all(|c| c.status != CouponStatus::Available));
}

#[tokio::test]
async fn test_referral_template_funded_by_referred_accounts() {
    let h = harness().await;
    let parent = h.fora.issue_account("+380671111111");
    h.store.add_account(&parent).await.unwrap();
    for phone in ["+380672222222", "+380673333333"] {
        let child = CreateAccountData {
            referrer_id: Some(parent.id.clone()),
            ..h.fora.issue_account(phone)
        };
        h.store.add_account(&child).await.unwrap();
        h.store.add_bonus(bonus(&child.id, 50, 1, 60)).await;
    }
    h.fora.set_balance(&parent.id, 100.0);
    let coupon = template(&parent.id, 100, true);
    h.store.add_coupon(coupon.clone()).await;

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.templates_checked, 1);
    assert_eq!(report.reconcile.released, 1);
    let released = h.store.coupon(coupon.id).await.unwrap();
    assert_eq!(released.status, CouponStatus::Available);
    assert_eq!(released.discount, Decimal::new(100, 0));
}

#[tokio::test]
async fn test_expired_referred_bonus_does_not_fund_template() {
    let h = harness().await;
    let parent = h.fora.issue_account("+380671111111");
    h.store.add_account(&parent).await.unwrap();
    let active = CreateAccountData {
        referrer_id: Some(parent.id.clone()),
        ..h.fora.issue_account("+380672222222")
    };
    let lapsed = CreateAccountData {
        referrer_id: Some(parent.id.clone()),
        ..h.fora.issue_account("+380673333333")
    };
    h.store.add_account(&active).await.unwrap();
    h.store.add_account(&lapsed).await.unwrap();
    h.store.add_bonus(bonus(&active.id, 50, 1, 60)).await;
    // expired yesterday
    h.store.add_bonus(bonus(&lapsed.id, 50, 90, -1)).await;
    // not accrued yet
    h.store.add_bonus(bonus(&lapsed.id, 50, -1, 60)).await;
    h.fora.set_balance(&parent.id, 100.0);
    let coupon = template(&parent.id, 100, true);
    h.store.add_coupon(coupon.clone()).await;

    let report = h.maintenance.run().await.unwrap();

    assert_eq!(report.reconcile.templates_checked, 0);
    assert_eq!(
        h.store.coupon(coupon.id).await.unwrap().status,
        CouponStatus::Template
    );
}
