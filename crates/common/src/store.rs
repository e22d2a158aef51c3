//! Durable store for notifications awaiting their scheduled time or an
//! external trigger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::types::{NotificationRequest, StoredNotification};

#[async_trait]
pub trait NotifyStore: Send + Sync {
    /// Persist a delayed notification and return its generated id.
    async fn insert(&self, request: &NotificationRequest) -> Result<i64, AppError>;

    /// Every record scheduled at or before `now`, oldest first.
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<StoredNotification>, AppError>;

    async fn find_by_external_key(&self, key: &str)
    -> Result<Option<StoredNotification>, AppError>;

    /// Remove a record. Deleting an id that is already gone is not an error.
    async fn delete_by_id(&self, id: i64) -> Result<(), AppError>;
}

/// Row shape of the `notify` table.
#[derive(Debug, sqlx::FromRow)]
struct NotifyRow {
    id: i64,
    caller: String,
    url: String,
    method: String,
    content_type: String,
    data: String,
    scheduled_time: Option<DateTime<Utc>>,
    need_response: bool,
    expect_response: String,
    run_once: bool,
    routing_key: String,
    external_key: Option<String>,
    retry_count: i32,
}

impl TryFrom<NotifyRow> for StoredNotification {
    type Error = AppError;

    fn try_from(row: NotifyRow) -> Result<Self, Self::Error> {
        Ok(StoredNotification {
            id: row.id,
            request: NotificationRequest {
                caller: row.caller,
                url: row.url,
                method: row.method.parse()?,
                content_type: row.content_type.parse()?,
                data: row.data,
                scheduled_time: row.scheduled_time,
                send_immediate: false,
                need_response: row.need_response,
                run_once: row.run_once,
                expect_response: row.expect_response,
                routing_key: row.routing_key,
                external_key: row.external_key,
                retry_count: row.retry_count.max(0) as u32,
            },
        })
    }
}

const SELECT_COLUMNS: &str = "id, caller, url, method, content_type, data, scheduled_time, \
     need_response, expect_response, run_once, routing_key, external_key, retry_count";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgNotifyStore {
    pool: PgPool,
}

impl PgNotifyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotifyStore for PgNotifyStore {
    async fn insert(&self, request: &NotificationRequest) -> Result<i64, AppError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO notify (caller, url, method, content_type, data, scheduled_time,
                                need_response, expect_response, run_once, routing_key,
                                external_key, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(&request.caller)
        .bind(&request.url)
        .bind(request.method.as_str())
        .bind(request.content_type.as_str())
        .bind(&request.data)
        .bind(request.scheduled_time)
        .bind(request.need_response)
        .bind(&request.expect_response)
        .bind(request.run_once)
        .bind(&request.routing_key)
        .bind(request.external_key.as_deref().filter(|k| !k.is_empty()))
        .bind(request.retry_count as i32)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(id, routing_key = %request.routing_key, "Delayed notification stored");
        Ok(id)
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<StoredNotification>, AppError> {
        let rows: Vec<NotifyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM notify WHERE scheduled_time <= $1 ORDER BY id ASC",
            SELECT_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredNotification::try_from).collect()
    }

    async fn find_by_external_key(
        &self,
        key: &str,
    ) -> Result<Option<StoredNotification>, AppError> {
        let row: Option<NotifyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM notify WHERE external_key = $1 ORDER BY id ASC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredNotification::try_from).transpose()
    }

    async fn delete_by_id(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM notify WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
