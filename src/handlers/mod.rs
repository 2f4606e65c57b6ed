pub mod audit;
pub mod health;
pub mod two_factor;
pub mod verifier;

pub use audit::{list_audit_logs, record_audit_log};
pub use health::health_check;
pub use two_factor::{
    acknowledge_2fa, disable_2fa, redeem_backup_code, setup_2fa, status_2fa, verify_2fa,
};
pub use verifier::verify_totp_code;

use garde::Validate;

use crate::error::AppError;

/// garde によるリクエスト検証
///
/// 詳細はログのみに出し、利用者には定型メッセージを返す
pub(crate) fn validate_request<T>(request: &T, message: &str) -> Result<(), AppError>
where
    T: Validate<Context = ()>,
{
    request.validate().map_err(|report| {
        tracing::debug!(report = %report, "リクエストバリデーションエラー");
        AppError::Validation(message.to_string())
    })
}
