use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{AuditLogEntry, NewAuditLogEntry};

/// 監査ログの永続化（追記のみ）
///
/// 更新・削除のメソッドは意図的に持たない
#[async_trait]
pub trait AuditLogStore: Send + Sync {
    async fn insert(&self, entry: NewAuditLogEntry) -> Result<AuditLogEntry, sqlx::Error>;

    /// ユーザーの監査ログを新しい順に取得
    async fn list_by_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, sqlx::Error>;
}

#[derive(Clone)]
pub struct AuditLogRepository {
    pool: PgPool,
}

impl AuditLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLogStore for AuditLogRepository {
    async fn insert(&self, entry: NewAuditLogEntry) -> Result<AuditLogEntry, sqlx::Error> {
        sqlx::query_as::<_, AuditLogEntry>(
            r#"
            INSERT INTO audit_logs
                (user_id, action, resource_type, resource_id, ip_address, user_agent, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, user_id, action, resource_type, resource_id, ip_address,
                      user_agent, metadata, created_at
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(entry.resource_type)
        .bind(entry.resource_id)
        .bind(entry.ip_address)
        .bind(entry.user_agent)
        .bind(Json(entry.metadata))
        .fetch_one(&self.pool)
        .await
    }

    async fn list_by_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, sqlx::Error> {
        sqlx::query_as::<_, AuditLogEntry>(
            r#"
            SELECT id, user_id, action, resource_type, resource_id, ip_address,
                   user_agent, metadata, created_at
            FROM audit_logs
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}
