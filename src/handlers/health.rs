use axum::{Json, extract::State};
use serde::Serialize;

use crate::state::AppState;

/// ヘルスチェックレスポンス
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// TOTP検証の転送先（"local" / "remote"）
    pub verifier: &'static str,
}

/// ヘルスチェックハンドラー
///
/// GET /api/health
///
/// ロードバランサーやモニタリングツールから呼び出される。
/// DBには接続しない
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let verifier = if state.config.verifier_url.is_some() {
        "remote"
    } else {
        "local"
    };

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        verifier,
    })
}
