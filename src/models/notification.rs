use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub async fn create(
        pool: &PgPool,
        user_id: Uuid,
        kind: &str,
        title: &str,
        body: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO notifications (user_id, kind, title, body)
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(user_id)
        .bind(kind)
        .bind(title)
        .bind(body)
        .fetch_one(pool)
        .await
    }

    /// Notifications are a non-critical side effect: failures are logged and
    /// never bubble into the caller's control flow.
    pub async fn create_best_effort(
        pool: &PgPool,
        user_id: Uuid,
        kind: &str,
        title: &str,
        body: Option<&str>,
    ) {
        if let Err(e) = Self::create(pool, user_id, kind, title, body).await {
            tracing::warn!("Failed to write {} notification for {}: {}", kind, user_id, e);
        }
    }

    pub async fn list_for_user(
        pool: &PgPool,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM notifications WHERE user_id = $1
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
