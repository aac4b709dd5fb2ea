//! In-memory `ForaStore`, used by tests and local dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{missing_account, ForaStore};
use crate::error::{AppError, Result};
use crate::models::{
    account::CreateAccountData,
    coupon::{CouponTransition, CouponWithAccount, CreateCouponData},
    Account, AccountCredentials, Bonus, Coupon, CouponStatus, Device, Receipt, ReceiptProduct,
    Subscription, TokenPair, TreeNode,
};

#[derive(Debug, Default)]
struct State {
    next_seq: i64,
    devices: Vec<Device>,
    accounts: Vec<Account>,
    coupons: Vec<Coupon>,
    bonuses: Vec<Bonus>,
    receipts: BTreeMap<(i32, i64), Receipt>,
    products: BTreeMap<(i32, i64, i64), ReceiptProduct>,
    subscriptions: Vec<Subscription>,
}

impl State {
    fn credentials(&self, account_id: &str) -> Result<AccountCredentials> {
        let account = self
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .ok_or_else(|| missing_account(account_id))?;
        let device = self
            .devices
            .iter()
            .find(|d| d.id == account.device_id)
            .cloned()
            .ok_or_else(|| AppError::Integrity(format!("missing device {}", account.device_id)))?;
        Ok(AccountCredentials {
            account_id: account.id.clone(),
            session_id: account.session_id,
            phone: account.phone.clone(),
            tokens: TokenPair {
                access_token: account.access_token.clone(),
                refresh_token: account.refresh_token.clone(),
            },
            device,
        })
    }

    fn push_coupon(&mut self, data: &CreateCouponData) -> Uuid {
        let id = Uuid::new_v4();
        self.coupons.push(Coupon {
            id,
            status: data.status,
            family_id: data.family_id,
            user_id: None,
            account_id: data.account_id.clone(),
            discount: data.discount,
            required_spend: data.required_spend,
            is_referral: data.is_referral,
            created_at: Utc::now(),
            expired_at: data.expired_at,
            assigned_at: None,
        });
        id
    }

    fn active_bonus(&self, account_id: &str, today: NaiveDate) -> Option<Decimal> {
        let active: Vec<Decimal> = self
            .bonuses
            .iter()
            .filter(|b| b.account_id == account_id && b.is_active(today))
            .map(|b| b.amount)
            .collect();
        (!active.is_empty()).then(|| active.into_iter().sum())
    }

    fn referred_bonus(&self, referrer_id: &str, today: NaiveDate) -> Option<Decimal> {
        let active: Vec<Decimal> = self
            .accounts
            .iter()
            .filter(|a| a.referrer_id.as_deref() == Some(referrer_id))
            .filter_map(|a| self.active_bonus(&a.id, today))
            .collect();
        (!active.is_empty()).then(|| active.into_iter().sum())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_device(&self, device: Device) {
        self.state.write().await.devices.push(device);
    }

    pub async fn add_subscription(&self, subscription: Subscription) {
        self.state.write().await.subscriptions.push(subscription);
    }

    pub async fn add_coupon(&self, coupon: Coupon) {
        self.state.write().await.coupons.push(coupon);
    }

    pub async fn add_bonus(&self, bonus: Bonus) {
        self.state.write().await.bonuses.push(bonus);
    }

    pub async fn add_account(&self, data: &CreateAccountData) -> Result<()> {
        let mut state = self.state.write().await;
        insert_account(&mut state, data)
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.state.read().await.accounts.clone()
    }

    pub async fn coupons(&self) -> Vec<Coupon> {
        self.state.read().await.coupons.clone()
    }

    pub async fn coupon(&self, id: Uuid) -> Option<Coupon> {
        self.state.read().await.coupons.iter().find(|c| c.id == id).cloned()
    }

    pub async fn bonuses(&self) -> Vec<Bonus> {
        self.state.read().await.bonuses.clone()
    }

    pub async fn receipts(&self) -> Vec<Receipt> {
        self.state.read().await.receipts.values().cloned().collect()
    }

    pub async fn products(&self) -> Vec<ReceiptProduct> {
        self.state.read().await.products.values().cloned().collect()
    }

    pub async fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.state
            .read()
            .await
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }
}

fn insert_account(state: &mut State, data: &CreateAccountData) -> Result<()> {
    if state.accounts.iter().any(|a| a.id == data.id) {
        return Err(AppError::Integrity(format!("duplicate account {}", data.id)));
    }
    if let Some(referrer) = &data.referrer_id {
        if !state.accounts.iter().any(|a| &a.id == referrer) {
            return Err(missing_account(referrer));
        }
    }
    state.next_seq += 1;
    state.accounts.push(Account {
        id: data.id.clone(),
        seq: state.next_seq,
        session_id: data.session_id,
        phone: data.phone.clone(),
        device_id: data.device_id,
        referrer_id: data.referrer_id.clone(),
        access_token: data.tokens.access_token.clone(),
        refresh_token: data.tokens.refresh_token.clone(),
        created_at: Utc::now(),
        expired_at: None,
    });
    Ok(())
}

#[async_trait]
impl ForaStore for MemoryStore {
    async fn active_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let state = self.state.read().await;
        let mut active: Vec<Subscription> = state
            .subscriptions
            .iter()
            .filter(|s| s.expired_at > now)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.expired_at);
        Ok(active)
    }

    async fn set_subscription_root(
        &self,
        subscription_id: Uuid,
        root_id: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(s) = state.subscriptions.iter_mut().find(|s| s.id == subscription_id) {
            s.root_id = root_id.map(str::to_string);
        }
        Ok(())
    }

    async fn count_available_referral_coupons(
        &self,
        family_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let state = self.state.read().await;
        let count = state
            .coupons
            .iter()
            .filter(|c| {
                c.status == CouponStatus::Available
                    && c.is_referral
                    && c.family_id == Some(family_id)
                    && c.expired_at > now
            })
            .count();
        Ok(count as i64)
    }

    async fn referrer_tree(&self, root_id: &str, height: i32) -> Result<Vec<TreeNode>> {
        let state = self.state.read().await;
        let mut found: Vec<(i64, TreeNode)> = Vec::new();
        let mut frontier: Vec<(i32, &Account)> = state
            .accounts
            .iter()
            .filter(|a| a.id == root_id)
            .map(|a| (0, a))
            .collect();

        while let Some((depth, account)) = frontier.pop() {
            found.push((
                account.seq,
                TreeNode {
                    depth,
                    id: account.id.clone(),
                    session_id: account.session_id,
                },
            ));
            if depth < height {
                frontier.extend(
                    state
                        .accounts
                        .iter()
                        .filter(|a| a.referrer_id.as_deref() == Some(account.id.as_str()))
                        .map(|a| (depth + 1, a)),
                );
            }
        }

        found.sort_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, node)| node).collect())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.state.read().await.devices.clone())
    }

    async fn create_account(
        &self,
        account: &CreateAccountData,
        coupon: &CreateCouponData,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        insert_account(&mut state, account)?;
        state.push_coupon(coupon);
        Ok(())
    }

    async fn plant_tree(
        &self,
        subscription_id: Uuid,
        (empty, empty_coupon): (&CreateAccountData, &CreateCouponData),
        (root, root_coupon): (&CreateAccountData, &CreateCouponData),
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.subscriptions.iter().any(|s| s.id == subscription_id) {
            return Err(AppError::Integrity(format!(
                "missing subscription {subscription_id}"
            )));
        }
        insert_account(&mut state, empty)?;
        if let Err(e) = insert_account(&mut state, root) {
            state.accounts.pop();
            return Err(e);
        }
        state.push_coupon(empty_coupon);
        state.push_coupon(root_coupon);
        if let Some(s) = state.subscriptions.iter_mut().find(|s| s.id == subscription_id) {
            s.root_id = Some(root.id.clone());
        }
        Ok(())
    }

    async fn update_tokens(&self, account_id: &str, tokens: &TokenPair) -> Result<()> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| a.id == account_id)
            .ok_or_else(|| missing_account(account_id))?;
        account.access_token = tokens.access_token.clone();
        account.refresh_token = tokens.refresh_token.clone();
        Ok(())
    }

    async fn coupons_to_reconcile(&self) -> Result<Vec<CouponWithAccount>> {
        let state = self.state.read().await;
        let mut coupons: Vec<&Coupon> = state
            .coupons
            .iter()
            .filter(|c| c.status.is_reconcilable())
            .collect();
        coupons.sort_by_key(|c| c.created_at);
        coupons
            .into_iter()
            .map(|c| {
                Ok(CouponWithAccount {
                    coupon: c.clone(),
                    account: state.credentials(&c.account_id)?,
                })
            })
            .collect()
    }

    async fn fundable_templates(&self, today: NaiveDate) -> Result<Vec<CouponWithAccount>> {
        let state = self.state.read().await;
        let mut fundable = Vec::new();
        for coupon in state
            .coupons
            .iter()
            .filter(|c| c.status == CouponStatus::Template)
        {
            let funding = if coupon.is_referral {
                state.referred_bonus(&coupon.account_id, today)
            } else {
                state.active_bonus(&coupon.account_id, today)
            };
            if funding.is_some_and(|amount| amount >= coupon.discount) {
                fundable.push(CouponWithAccount {
                    coupon: coupon.clone(),
                    account: state.credentials(&coupon.account_id)?,
                });
            }
        }
        fundable.sort_by_key(|item| item.coupon.created_at);
        Ok(fundable)
    }

    async fn insert_receipts(
        &self,
        receipts: &[Receipt],
        products: &[ReceiptProduct],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        for receipt in receipts {
            state
                .receipts
                .entry((receipt.filial_id, receipt.receipt_id))
                .or_insert_with(|| receipt.clone());
        }
        for product in products {
            if !state
                .receipts
                .contains_key(&(product.filial_id, product.receipt_id))
            {
                return Err(AppError::Integrity(format!(
                    "product {} references missing receipt {}/{}",
                    product.product_id, product.filial_id, product.receipt_id
                )));
            }
            state
                .products
                .entry((product.filial_id, product.receipt_id, product.product_id))
                .or_insert_with(|| product.clone());
        }
        Ok(())
    }

    async fn apply_transition(&self, transition: &CouponTransition) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(coupon) = state
            .coupons
            .iter_mut()
            .find(|c| c.id == transition.coupon_id && c.status == transition.from)
        else {
            return Ok(false);
        };

        coupon.status = transition.to;
        if let Some(discount) = transition.discount {
            coupon.discount = discount;
        }

        if let Some(bonus) = &transition.bonus {
            let exists = state
                .bonuses
                .iter()
                .any(|b| b.account_id == bonus.account_id && b.accured_on == bonus.accured_on);
            if !exists {
                state.bonuses.push(Bonus {
                    account_id: bonus.account_id.clone(),
                    amount: bonus.amount,
                    accured_on: bonus.accured_on,
                    expired_on: bonus.expired_on,
                });
            }
        }
        if let Some(spawn) = &transition.spawn {
            state.push_coupon(spawn);
        }
        Ok(true)
    }

    async fn assign_available_coupon(
        &self,
        user_id: Uuid,
        family_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        // The write lock plays the role of FOR UPDATE SKIP LOCKED
        let mut state = self.state.write().await;
        let candidate = state
            .coupons
            .iter_mut()
            .filter(|c| {
                c.status == CouponStatus::Available
                    && c.expired_at > now
                    && (c.family_id.is_none() || c.family_id == family_id)
            })
            .min_by_key(|c| c.expired_at);

        Ok(candidate.map(|coupon| {
            coupon.status = CouponStatus::Assigned;
            coupon.user_id = Some(user_id);
            coupon.assigned_at = Some(now);
            coupon.id
        }))
    }

    async fn hide_coupon(&self, coupon_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(set_user_status(
            &mut state.coupons,
            coupon_id,
            user_id,
            &[CouponStatus::Assigned],
            CouponStatus::Hidden,
        ))
    }

    async fn await_receipt(&self, coupon_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(set_user_status(
            &mut state.coupons,
            coupon_id,
            user_id,
            &[CouponStatus::Assigned, CouponStatus::Hidden],
            CouponStatus::AwaitingReceipt,
        ))
    }
}

fn set_user_status(
    coupons: &mut [Coupon],
    coupon_id: Uuid,
    user_id: Uuid,
    from: &[CouponStatus],
    to: CouponStatus,
) -> bool {
    match coupons
        .iter_mut()
        .find(|c| c.id == coupon_id && c.user_id == Some(user_id) && from.contains(&c.status))
    {
        Some(coupon) => {
            coupon.status = to;
            true
        }
        None => false,
    }
}
