use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

/// A family's standing order for referral coupons
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub family_id: Uuid,
    pub surplus: i32,             // available referral coupons to keep in stock
    pub height: i32,              // referral tree height
    pub root_id: Option<String>,  // tree currently being grown
    pub expired_at: DateTime<Utc>,
}

impl Subscription {
    pub async fn list_active(
        pool: &PgPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM fora.subscriptions
            WHERE expired_at > $1
            ORDER BY expired_at
            "#,
        )
        .bind(now)
        .fetch_all(pool)
        .await
    }

    /// Points the subscription at a new tree root, or clears it
    pub async fn set_root<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
        root_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE fora.subscriptions
            SET root_id = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(root_id)
        .execute(executor)
        .await?;

        Ok(())
    }
}
