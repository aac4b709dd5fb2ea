use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::fora::{is_access_token_expired, ChequeIdentity, ForaApi, Session};
use crate::db::ForaStore;
use crate::error::{AppError, Result};
use crate::models::{AccountCredentials, Receipt, ReceiptProduct};

/// Receipts of one account and their line items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiptBatch {
    pub receipts: Vec<Receipt>,
    pub products: Vec<ReceiptProduct>,
}

/// Returns a session with a usable access token
///
/// Refreshes the token pair when the access token is about to expire and
/// persists the new pair before returning.
pub async fn refresh_if_expired(
    store: &dyn ForaStore,
    fora: &dyn ForaApi,
    account: &AccountCredentials,
    now: DateTime<Utc>,
) -> Result<Session> {
    let session = Session::for_account(account)?;
    if !is_access_token_expired(&account.tokens.access_token, now) {
        return Ok(session);
    }

    let tokens = fora
        .refresh_token(&session.with_token(&account.tokens.refresh_token))
        .await?;
    store.update_tokens(&account.account_id, &tokens).await?;

    tracing::info!(account_id = %account.account_id, "Refreshed access token");

    Ok(session.with_token(tokens.access_token))
}

/// Fetches every receipt made at or after `since`, with its products
pub async fn fetch_receipts_since(
    fora: &dyn ForaApi,
    session: &Session,
    coupon_id: Uuid,
    since: DateTime<Utc>,
) -> Result<ReceiptBatch> {
    let months = fora.get_last_cheque_headers_fast(session).await?;

    let mut identities = Vec::new();
    let mut order = Vec::new();
    let mut receipts: HashMap<String, Receipt> = HashMap::new();

    for header in months.iter().flat_map(|month| &month.headers) {
        let created_at = parse_created(&header.created)?;
        if created_at < since {
            continue;
        }

        identities.push(ChequeIdentity::from(header));
        if !receipts.contains_key(&header.created) {
            order.push(header.created.clone());
        }
        receipts.insert(
            header.created.clone(),
            Receipt {
                coupon_id,
                filial_id: header.fil_id,
                receipt_id: header.cheque_id,
                fiscal_string: header.identification_string.clone(),
                fiscal_number: header.fiscal_number.clone(),
                discount: Decimal::ZERO,
                total: money(header.sum_reg)?,
                created_at,
            },
        );
    }

    if identities.is_empty() {
        return Ok(ReceiptBatch::default());
    }

    let mut products = Vec::new();
    for info in fora.get_cheques_infos(session, &identities).await? {
        let receipt = receipts.get_mut(&info.created).ok_or_else(|| {
            AppError::Integrity(format!(
                "cheque {}/{} created at {} has no header",
                info.fil_id, info.cheque_id, info.created
            ))
        })?;
        receipt.discount = money(info.sum_discount)?;

        for line in info.cheque_lines {
            products.push(ReceiptProduct {
                filial_id: info.fil_id,
                receipt_id: info.cheque_id,
                product_id: line.lager_id,
                name: line.lager_name_ua,
                unit: line.lager_unit,
                quantity: decimal(line.kolvo, 3)?,
                price: money(line.price_out)?,
                value: money(line.sum_line)?,
            });
        }
    }

    let receipts = order
        .iter()
        .filter_map(|created| receipts.remove(created))
        .collect();

    Ok(ReceiptBatch { receipts, products })
}

/// Receipt timestamps come either with an offset or as naive UTC
pub fn parse_created(created: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(created) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(created, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| AppError::Schema(format!("invalid receipt timestamp {created:?}: {e}")))
}

pub(crate) fn money(value: f64) -> Result<Decimal> {
    decimal(value, 2)
}

fn decimal(value: f64, scale: u32) -> Result<Decimal> {
    Decimal::try_from(value)
        .map(|d| d.round_dp(scale))
        .map_err(|e| AppError::Schema(format!("invalid amount {value}: {e}")))
}
