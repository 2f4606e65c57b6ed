use axum::{Json, extract::State, http::HeaderMap};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::USER_ID_HEADER;
use crate::services::verifier::{CodeVerifier, VerifierError, is_well_formed_code};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyCodeResponse {
    pub valid: bool,
}

/// POST /api/totp/verify
///
/// TOTP検証サーバーのエンドポイント（`RemoteVerifier` の接続先）
///
/// 処理フロー:
/// 1. `x-user-id` ヘッダーから対象ユーザーを特定
/// 2. 形式不正なコードは検証せず `valid: false`
/// 3. 時間ウィンドウ・リプレイ防止・試行回数制限込みで検証
///
/// # Security
/// - コードはログ出力禁止
/// - 同一タイムステップのコードは1回のみ有効
/// - 試行回数超過時は 429 + `Retry-After`
pub async fn verify_totp_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VerifyCodeRequest>,
) -> Result<Json<VerifyCodeResponse>, AppError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or(AppError::Unauthenticated)?;

    let code = request.code.trim();
    if !is_well_formed_code(code) {
        return Ok(Json(VerifyCodeResponse { valid: false }));
    }

    let valid = state
        .local_verifier
        .verify(user_id, code)
        .await
        .map_err(|e| match e {
            VerifierError::RateLimited { retry_after_secs } => {
                AppError::TooManyAttempts { retry_after_secs }
            }
            VerifierError::Unavailable(_) => {
                tracing::error!(error = %e, user_id = %user_id, "ローカル検証エラー");
                AppError::VerifierUnavailable
            }
        })?;

    tracing::info!(user_id = %user_id, valid, "TOTPコード検証");

    Ok(Json(VerifyCodeResponse { valid }))
}
