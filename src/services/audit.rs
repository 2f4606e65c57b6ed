use std::sync::Arc;

use uuid::Uuid;

use crate::error::AppError;
use crate::extract::ClientContext;
use crate::models::{AuditAction, AuditLogEntry, NewAuditLogEntry};
use crate::repositories::AuditLogStore;
use crate::services::ip_lookup::IpLookupClient;

pub const MAX_LIST_LIMIT: i64 = 200;

/// 記録するイベント
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    /// 既定のリソース種別でイベントを作成
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            resource_type: action.default_resource_type().to_string(),
            resource_id: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: Option<String>) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = resource_id;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 監査ログサービス
///
/// `log` はエラーを返さない。記録失敗は診断ログにのみ出力し、
/// 監査対象の操作そのものは止めない
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn AuditLogStore>,
    ip_lookup: Option<IpLookupClient>,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditLogStore>, ip_lookup: Option<IpLookupClient>) -> Self {
        Self { store, ip_lookup }
    }

    /// 監査ログを1件追記（ベストエフォート）
    pub async fn log(&self, user_id: Uuid, client: &ClientContext, event: AuditEvent) {
        let action = event.action;
        match self.try_log(user_id, client, event).await {
            Ok(entry) => {
                tracing::info!(
                    user_id = %user_id,
                    action = %action,
                    audit_id = %entry.id,
                    "監査ログ記録"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = ?e,
                    user_id = %user_id,
                    action = %action,
                    "監査ログの記録に失敗"
                );
            }
        }
    }

    async fn try_log(
        &self,
        user_id: Uuid,
        client: &ClientContext,
        event: AuditEvent,
    ) -> Result<AuditLogEntry, sqlx::Error> {
        let ip_address = match &client.ip_address {
            Some(ip) => Some(ip.clone()),
            None => self.lookup_ip().await,
        };

        self.store
            .insert(NewAuditLogEntry {
                user_id,
                action: event.action,
                resource_type: event.resource_type,
                resource_id: event.resource_id,
                ip_address,
                user_agent: client.user_agent.clone(),
                metadata: event.metadata,
            })
            .await
    }

    async fn lookup_ip(&self) -> Option<String> {
        match &self.ip_lookup {
            Some(client) => client.lookup().await,
            None => None,
        }
    }

    /// ユーザーの監査ログを新しい順に取得
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list_by_user(user_id, limit).await?)
    }
}
