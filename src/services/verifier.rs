//! TOTPコード検証ゲート
//!
//! 時間ウィンドウ・リプレイ防止・試行回数制限は検証サーバー側（`LocalVerifier`）のみが扱う。
//! ゲートは6桁コードを転送し、結果を「不一致」「検証不能」「試行回数超過」に分けて返す

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::USER_ID_HEADER;
use crate::repositories::User2faSecretStore;
use crate::services::TotpService;
use crate::services::rate_limit::{AttemptKind, AttemptLimiter};

/// 検証サーバーとの通信・内部処理の失敗
///
/// 「コード不一致」とは区別して扱うこと
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("verifier unavailable: {0}")]
    Unavailable(String),

    #[error("too many attempts, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

/// TOTPコード検証
#[async_trait]
pub trait CodeVerifier: Send + Sync {
    async fn verify(&self, user_id: Uuid, code: &str) -> Result<bool, VerifierError>;
}

/// 6桁の数字かどうか
pub fn is_well_formed_code(code: &str) -> bool {
    code.len() == 6 && code.chars().all(|c| c.is_ascii_digit())
}

/// 検証ゲート
///
/// 形式チェック後に `CodeVerifier` へ転送する
#[derive(Clone)]
pub struct VerificationGate {
    verifier: Arc<dyn CodeVerifier>,
}

impl VerificationGate {
    pub fn new(verifier: Arc<dyn CodeVerifier>) -> Self {
        Self { verifier }
    }

    /// コードを検証
    ///
    /// # Errors
    /// - 形式不正: `AppError::Validation`
    /// - 検証サーバー障害: `AppError::VerifierUnavailable`
    /// - 試行回数超過: `AppError::TooManyAttempts`
    pub async fn check(&self, user_id: Uuid, code: &str) -> Result<bool, AppError> {
        let code = code.trim();
        if !is_well_formed_code(code) {
            return Err(AppError::Validation(
                "Le code doit contenir exactement 6 chiffres".to_string(),
            ));
        }

        self.verifier
            .verify(user_id, code)
            .await
            .map_err(|e| match e {
                VerifierError::RateLimited { retry_after_secs } => {
                    AppError::TooManyAttempts { retry_after_secs }
                }
                VerifierError::Unavailable(_) => {
                    tracing::error!(error = %e, user_id = %user_id, "TOTP検証サーバーエラー");
                    AppError::VerifierUnavailable
                }
            })
    }
}

#[derive(Debug, Serialize)]
struct VerifyCodeRequest<'a> {
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyCodeResponse {
    valid: bool,
}

/// リモート検証サーバーのクライアント
///
/// `POST {url}` に `{ "code": ... }` と `x-user-id` ヘッダーを送り、`{ "valid": bool }` を受け取る。
/// 429 は `Retry-After` 付きの試行回数超過として扱う
#[derive(Clone)]
pub struct RemoteVerifier {
    client: reqwest::Client,
    url: String,
}

impl RemoteVerifier {
    /// 新しい RemoteVerifier を作成
    pub fn new(url: String, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                tracing::error!(error = ?e, "HTTPクライアントの初期化に失敗");
                AppError::Internal(anyhow::anyhow!("http client initialization error"))
            })?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl CodeVerifier for RemoteVerifier {
    async fn verify(&self, user_id: Uuid, code: &str) -> Result<bool, VerifierError> {
        let response = self
            .client
            .post(&self.url)
            .header(USER_ID_HEADER, user_id.to_string())
            .json(&VerifyCodeRequest { code })
            .send()
            .await
            .map_err(|e| VerifierError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(1);
            tracing::warn!(user_id = %user_id, retry_after_secs, "検証サーバーが試行回数超過を返却");
            return Err(VerifierError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, "検証サーバーがエラーを返却");
            return Err(VerifierError::Unavailable(format!(
                "verifier returned status: {}",
                status
            )));
        }

        let body: VerifyCodeResponse = response.json().await.map_err(|e| {
            tracing::error!(error = ?e, "検証サーバーレスポンスのパースエラー");
            VerifierError::Unavailable("malformed verifier response".to_string())
        })?;

        tracing::debug!(user_id = %user_id, valid = body.valid, "リモート検証完了");
        Ok(body.valid)
    }
}

/// 現在時刻（UNIX秒）の取得
pub trait Clock: Send + Sync {
    fn unix_time(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// ローカル検証（検証サーバー本体）
///
/// # Security
/// - 前後1ステップの時間ウィンドウを許容
/// - 受理したステップを記録し、同一ステップ以前のコード再利用を拒否
/// - ユーザー単位の試行回数を制限（超過中は照合しない）
#[derive(Clone)]
pub struct LocalVerifier {
    store: Arc<dyn User2faSecretStore>,
    totp_service: TotpService,
    limiter: AttemptLimiter,
    clock: Arc<dyn Clock>,
}

impl LocalVerifier {
    pub fn new(
        store: Arc<dyn User2faSecretStore>,
        totp_service: TotpService,
        limiter: AttemptLimiter,
    ) -> Self {
        Self::with_clock(store, totp_service, limiter, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn User2faSecretStore>,
        totp_service: TotpService,
        limiter: AttemptLimiter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            totp_service,
            limiter,
            clock,
        }
    }

    async fn verify_inner(&self, user_id: Uuid, code: &str) -> Result<bool, AppError> {
        let Some(record) = self.store.find_by_user_id(user_id).await? else {
            tracing::debug!(user_id = %user_id, "2FAシークレット未登録");
            return Ok(false);
        };

        let secret = self.totp_service.decrypt_secret(&record.secret_encrypted)?;
        let Some(step) =
            self.totp_service
                .matching_step(&secret, code, self.clock.unix_time())?
        else {
            return Ok(false);
        };

        let step = i64::try_from(step).map_err(|e| AppError::Internal(e.into()))?;
        if !self.store.record_used_step(user_id, step).await? {
            tracing::warn!(user_id = %user_id, "TOTPコードの再利用を拒否");
            return Ok(false);
        }

        Ok(true)
    }
}

#[async_trait]
impl CodeVerifier for LocalVerifier {
    async fn verify(&self, user_id: Uuid, code: &str) -> Result<bool, VerifierError> {
        self.limiter
            .check(AttemptKind::Totp, user_id)
            .map_err(|retry_after_secs| VerifierError::RateLimited { retry_after_secs })?;

        self.verify_inner(user_id, code)
            .await
            .map_err(|e| VerifierError::Unavailable(e.to_string()))
    }
}
