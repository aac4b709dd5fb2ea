use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

// Keeps a single INSERT below the Postgres bind parameter limit
const INSERT_CHUNK: usize = 1_000;

/// A purchase synced from the Fora API, keyed by (filial_id, receipt_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Receipt {
    pub coupon_id: Uuid,
    pub filial_id: i32,
    pub receipt_id: i64,
    pub fiscal_string: String,
    pub fiscal_number: Option<String>,
    pub discount: Decimal,
    pub total: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A receipt line, keyed by (filial_id, receipt_id, product_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ReceiptProduct {
    pub filial_id: i32,
    pub receipt_id: i64,
    pub product_id: i64,
    pub name: String,
    pub unit: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub value: Decimal,
}

impl Receipt {
    /// Inserts receipts and their lines, silently skipping rows already stored
    pub async fn insert_ignoring_duplicates(
        pool: &PgPool,
        receipts: &[Receipt],
        products: &[ReceiptProduct],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        for chunk in receipts.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fora.receipts (coupon_id, filial_id, receipt_id, fiscal_string, \
                 fiscal_number, discount, total, created_at) ",
            );
            builder.push_values(chunk, |mut row, r| {
                row.push_bind(r.coupon_id)
                    .push_bind(r.filial_id)
                    .push_bind(r.receipt_id)
                    .push_bind(&r.fiscal_string)
                    .push_bind(&r.fiscal_number)
                    .push_bind(r.discount)
                    .push_bind(r.total)
                    .push_bind(r.created_at);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }

        for chunk in products.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fora.receipt_products (filial_id, receipt_id, product_id, name, \
                 unit, quantity, price, value) ",
            );
            builder.push_values(chunk, |mut row, p| {
                row.push_bind(p.filial_id)
                    .push_bind(p.receipt_id)
                    .push_bind(p.product_id)
                    .push_bind(&p.name)
                    .push_bind(&p.unit)
                    .push_bind(p.quantity)
                    .push_bind(p.price)
                    .push_bind(p.value);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await
    }
}
