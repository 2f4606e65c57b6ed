use axum::{Json, extract::State};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::extract::{ClientContext, CurrentUser};
use crate::handlers::validate_request;
use crate::services::enrollment::{EnrollmentSession, TwoFactorStatus};
use crate::state::AppState;

/// 6桁の数字のみ
pub(crate) fn six_digits(value: &str, _ctx: &()) -> garde::Result {
    if value.len() == 6 && value.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(garde::Error::new("must be exactly 6 digits"))
    }
}

// === 2FA Status ===

/// GET /api/2fa/status
pub async fn status_2fa(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<TwoFactorStatus>, AppError> {
    let status = state.two_factor.status(user.id).await?;
    Ok(Json(status))
}

// === 2FA Setup ===

/// POST /api/2fa/setup
///
/// 2FA設定を開始（シークレット・バックアップコード生成、URI返却）
///
/// # Security
/// - シークレット平文はログ出力禁止
pub async fn setup_2fa(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<EnrollmentSession>, AppError> {
    let session = state.two_factor.start_enrollment(&user).await?;
    Ok(Json(session))
}

// === 2FA Verify ===

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyRequest {
    #[garde(skip)]
    pub session: EnrollmentSession,
    #[garde(custom(six_digits))]
    pub code: String,
}

/// POST /api/2fa/verify
///
/// 2FA設定確認（初回コード検証で有効化）
///
/// # Security
/// - コードはログ出力禁止
pub async fn verify_2fa(
    State(state): State<AppState>,
    user: CurrentUser,
    client: ClientContext,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<EnrollmentSession>, AppError> {
    validate_request(&request, "Le code doit contenir exactement 6 chiffres")?;

    let VerifyRequest { mut session, code } = request;
    state
        .two_factor
        .submit_code(&mut session, &user, &client, &code)
        .await?;

    Ok(Json(session))
}

// === 2FA Acknowledge ===

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub session: EnrollmentSession,
}

/// POST /api/2fa/acknowledge
///
/// バックアップコード保管の確認（登録完了）
pub async fn acknowledge_2fa(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<AcknowledgeRequest>,
) -> Result<Json<EnrollmentSession>, AppError> {
    let mut session = request.session;
    state
        .two_factor
        .acknowledge_backup_codes(&mut session, &user)
        .await?;

    Ok(Json(session))
}

// === 2FA Disable ===

#[derive(Debug, Deserialize, Validate)]
pub struct DisableRequest {
    #[garde(custom(six_digits))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct DisableResponse {
    pub disabled: bool,
}

/// POST /api/2fa/disable
///
/// 2FA無効化（TOTPコード確認必須）
pub async fn disable_2fa(
    State(state): State<AppState>,
    user: CurrentUser,
    client: ClientContext,
    Json(request): Json<DisableRequest>,
) -> Result<Json<DisableResponse>, AppError> {
    validate_request(&request, "Le code doit contenir exactement 6 chiffres")?;

    state.two_factor.disable(&user, &client, &request.code).await?;

    Ok(Json(DisableResponse { disabled: true }))
}

// === Backup code ===

#[derive(Debug, Deserialize, Validate)]
pub struct RedeemBackupCodeRequest {
    #[garde(length(min = 8, max = 16))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct RedeemBackupCodeResponse {
    pub remaining: usize,
}

/// POST /api/2fa/backup-codes/redeem
///
/// # Security
/// - バックアップコードはログ出力禁止
pub async fn redeem_backup_code(
    State(state): State<AppState>,
    user: CurrentUser,
    client: ClientContext,
    Json(request): Json<RedeemBackupCodeRequest>,
) -> Result<Json<RedeemBackupCodeResponse>, AppError> {
    validate_request(&request, "Code de secours invalide")?;

    let remaining = state
        .two_factor
        .redeem_backup_code(&user, &client, &request.code)
        .await?;

    Ok(Json(RedeemBackupCodeResponse { remaining }))
}
