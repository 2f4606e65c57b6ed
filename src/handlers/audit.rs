use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use garde::Validate;
use serde::Deserialize;

use crate::error::AppError;
use crate::extract::{ClientContext, CurrentUser};
use crate::handlers::validate_request;
use crate::models::{AuditAction, AuditLogEntry};
use crate::services::audit::AuditEvent;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;

/// 監査ログ記録リクエスト
///
/// action は閉じた語彙（`AuditAction`）のみ受け付ける
#[derive(Debug, Deserialize, Validate)]
pub struct RecordAuditRequest {
    #[garde(skip)]
    pub action: AuditAction,
    #[garde(length(min = 1, max = 64))]
    pub resource_type: Option<String>,
    #[garde(length(min = 1, max = 128))]
    pub resource_id: Option<String>,
    #[garde(skip)]
    pub metadata: Option<serde_json::Value>,
}

/// POST /api/audit-logs
///
/// フロントエンドからの監査イベント記録（ログイン・文書エクスポート等）
///
/// 記録の成否に関わらず 202 を返す（ベストエフォート）
pub async fn record_audit_log(
    State(state): State<AppState>,
    user: CurrentUser,
    client: ClientContext,
    Json(request): Json<RecordAuditRequest>,
) -> Result<StatusCode, AppError> {
    validate_request(&request, "Requête d'audit invalide")?;

    let mut event = AuditEvent::new(request.action);
    if let Some(resource_type) = request.resource_type {
        event = event.resource(resource_type, request.resource_id);
    } else {
        event.resource_id = request.resource_id;
    }
    if let Some(metadata) = request.metadata {
        event = event.metadata(metadata);
    }

    state.audit.log(user.id, &client, event).await;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct ListAuditQuery {
    pub limit: Option<i64>,
}

/// GET /api/audit-logs
///
/// 自分の監査ログを新しい順に返す
pub async fn list_audit_logs(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListAuditQuery>,
) -> Result<Json<Vec<AuditLogEntry>>, AppError> {
    let entries = state
        .audit
        .list_for_user(user.id, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(entries))
}
