use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// A real Android device profile used to build the `user-info` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: i32,
    pub title: String,
    pub brand: String,
    pub model: String,
    pub fingerprint: String, // e.g. "google/redfin/redfin:13/TQ3A.230805.001/10316531:user/release-keys"
}

impl Device {
    pub async fn list_all(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT id, title, brand, model, fingerprint FROM devices ORDER BY id")
            .fetch_all(pool)
            .await
    }
}
