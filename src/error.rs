use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::services::enrollment::EnrollmentStep;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("認証情報がありません")]
    Unauthenticated,

    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    #[error("乱数生成エラー")]
    Generation(#[from] crate::services::secret::GenerationError),

    #[error("認証コードが無効です")]
    TotpInvalid,

    #[error("検証サーバーに接続できません")]
    VerifierUnavailable,

    #[error("検証の試行回数が上限を超えました: {retry_after_secs}秒後に再試行")]
    TooManyAttempts { retry_after_secs: u64 },

    #[error("二要素認証は既に有効です")]
    TotpAlreadyEnabled,

    #[error("二要素認証が有効化されていません")]
    TotpNotEnabled,

    #[error("二要素認証の設定が必要です")]
    TotpSetupRequired,

    #[error("バックアップコードが無効です")]
    BackupCodeInvalid,

    #[error("登録ステップが不正です: expected {expected}, actual {actual}")]
    InvalidEnrollmentStep {
        expected: EnrollmentStep,
        actual: EnrollmentStep,
    },
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "Vous devez être connecté pour effectuer cette action".to_string(),
            ),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Une erreur interne est survenue, veuillez réessayer".to_string(),
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Une erreur interne est survenue, veuillez réessayer".to_string(),
                )
            }
            Self::Generation(e) => {
                tracing::error!(error = ?e, "乱数生成エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Impossible de générer le secret, veuillez réessayer".to_string(),
                )
            }
            Self::TotpInvalid => (
                StatusCode::UNAUTHORIZED,
                "Code de vérification incorrect, veuillez réessayer".to_string(),
            ),
            Self::VerifierUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service de vérification indisponible, veuillez réessayer plus tard".to_string(),
            ),
            Self::TooManyAttempts { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "Trop de tentatives, veuillez réessayer dans {} secondes",
                    retry_after_secs
                ),
            ),
            Self::TotpAlreadyEnabled => (
                StatusCode::CONFLICT,
                "L'authentification à deux facteurs est déjà activée".to_string(),
            ),
            Self::TotpNotEnabled => (
                StatusCode::BAD_REQUEST,
                "L'authentification à deux facteurs n'est pas activée".to_string(),
            ),
            Self::TotpSetupRequired => (
                StatusCode::BAD_REQUEST,
                "Veuillez recommencer la configuration de l'authentification à deux facteurs"
                    .to_string(),
            ),
            Self::BackupCodeInvalid => (
                StatusCode::UNAUTHORIZED,
                "Code de secours invalide ou déjà utilisé".to_string(),
            ),
            Self::InvalidEnrollmentStep { expected, actual } => {
                tracing::warn!(%expected, %actual, "不正な登録ステップ遷移");
                (
                    StatusCode::CONFLICT,
                    "Cette étape de configuration n'est pas disponible".to_string(),
                )
            }
        };

        let mut response = (status, Json(ErrorResponse { error: message })).into_response();
        if let Self::TooManyAttempts { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}
