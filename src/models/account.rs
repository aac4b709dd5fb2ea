use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

use super::device::Device;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String, // EAN-13 loyalty barcode
    pub seq: i64,   // insertion order
    pub session_id: Uuid,
    pub phone: String,
    pub device_id: i32,
    pub referrer_id: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct CreateAccountData {
    pub id: String,
    pub session_id: Uuid,
    pub phone: String,
    pub device_id: i32,
    pub referrer_id: Option<String>,
    pub tokens: TokenPair,
}

/// A node of a referral tree as returned by the recursive descendant query
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TreeNode {
    pub depth: i32,
    pub id: String,
    pub session_id: Uuid,
}

/// Everything needed to talk to the Fora API on behalf of an account
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub account_id: String,
    pub session_id: Uuid,
    pub phone: String,
    pub tokens: TokenPair,
    pub device: Device,
}

#[derive(FromRow)]
struct CredentialsRow {
    account_id: String,
    session_id: Uuid,
    phone: String,
    access_token: String,
    refresh_token: String,
    device_id: i32,
    device_title: String,
    brand: String,
    model: String,
    fingerprint: String,
}

impl From<CredentialsRow> for AccountCredentials {
    fn from(row: CredentialsRow) -> Self {
        Self {
            account_id: row.account_id,
            session_id: row.session_id,
            phone: row.phone,
            tokens: TokenPair {
                access_token: row.access_token,
                refresh_token: row.refresh_token,
            },
            device: Device {
                id: row.device_id,
                title: row.device_title,
                brand: row.brand,
                model: row.model,
                fingerprint: row.fingerprint,
            },
        }
    }
}

impl Account {
    /// Inserts a freshly registered account
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &CreateAccountData,
    ) -> Result<Self, sqlx::Error> {
        let account = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO fora.accounts (
                id, session_id, phone, device_id, referrer_id,
                access_token, refresh_token
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&data.id)
        .bind(data.session_id)
        .bind(&data.phone)
        .bind(data.device_id)
        .bind(&data.referrer_id)
        .bind(&data.tokens.access_token)
        .bind(&data.tokens.refresh_token)
        .fetch_one(executor)
        .await?;

        Ok(account)
    }

    /// Loads the tokens and device of an account
    pub async fn find_credentials(
        pool: &PgPool,
        account_id: &str,
    ) -> Result<Option<AccountCredentials>, sqlx::Error> {
        let row = sqlx::query_as::<_, CredentialsRow>(
            r#"
            SELECT
                a.id AS account_id, a.session_id, a.phone,
                a.access_token, a.refresh_token,
                d.id AS device_id, d.title AS device_title,
                d.brand, d.model, d.fingerprint
            FROM fora.accounts a
            JOIN devices d ON d.id = a.device_id
            WHERE a.id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(AccountCredentials::from))
    }

    /// Stores a refreshed token pair
    pub async fn update_tokens(
        pool: &PgPool,
        account_id: &str,
        tokens: &TokenPair,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE fora.accounts
            SET access_token = $2, refresh_token = $3
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Returns the root and all its descendants down to `height` levels,
    /// in insertion order
    pub async fn referrer_tree(
        pool: &PgPool,
        root_id: &str,
        height: i32,
    ) -> Result<Vec<TreeNode>, sqlx::Error> {
        sqlx::query_as::<_, TreeNode>(
            r#"
            WITH RECURSIVE tree AS (
                SELECT 0 AS depth, id, session_id, seq
                FROM fora.accounts
                WHERE id = $1

                UNION ALL

                SELECT tree.depth + 1, a.id, a.session_id, a.seq
                FROM tree
                JOIN fora.accounts a ON a.referrer_id = tree.id
                WHERE tree.depth < $2
            )
            SELECT depth, id, session_id FROM tree ORDER BY seq
            "#,
        )
        .bind(root_id)
        .bind(height)
        .fetch_all(pool)
        .await
    }
}
