use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::{
    AuditLogRepository, AuditLogStore, User2faSecretRepository, User2faSecretStore,
};
use crate::services::ip_lookup::IpLookupClient;
use crate::services::rate_limit::AttemptLimiter;
use crate::services::verifier::{CodeVerifier, LocalVerifier, RemoteVerifier, VerificationGate};
use crate::services::{AuditService, TotpService, TwoFactorService};
use secrecy::ExposeSecret;

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// 2FA登録・無効化サービス
    pub two_factor: TwoFactorService,
    /// 監査ログサービス
    pub audit: AuditService,
    /// 検証サーバーとしてのローカル検証器
    pub local_verifier: LocalVerifier,
}

impl AppState {
    /// PostgreSQL リポジトリで AppState を作成
    pub fn new(db_pool: PgPool, config: Config) -> Result<Self, AppError> {
        let secret_store: Arc<dyn User2faSecretStore> =
            Arc::new(User2faSecretRepository::new(db_pool.clone()));
        let audit_store: Arc<dyn AuditLogStore> = Arc::new(AuditLogRepository::new(db_pool));

        Self::from_stores(config, secret_store, audit_store)
    }

    /// リポジトリ実装を指定して AppState を作成
    pub fn from_stores(
        config: Config,
        secret_store: Arc<dyn User2faSecretStore>,
        audit_store: Arc<dyn AuditLogStore>,
    ) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let totp_service = TotpService::new(
            config.totp_issuer.clone(),
            config.encryption_key.expose_secret(),
        )?;

        // TOTP検証とバックアップコードで共有（キーは用途ごとに分離）
        let limiter = AttemptLimiter::new(
            config.verify_max_attempts,
            config.verify_attempt_window_secs,
        );

        let local_verifier =
            LocalVerifier::new(secret_store.clone(), totp_service.clone(), limiter.clone());

        // 検証先の選択（リモート設定があればそちらへ転送）
        let verifier: Arc<dyn CodeVerifier> = match &config.verifier_url {
            Some(url) => {
                tracing::info!(verifier_url = %url, "リモート検証サーバーを使用");
                Arc::new(RemoteVerifier::new(
                    url.clone(),
                    Duration::from_secs(config.verifier_timeout_secs),
                )?)
            }
            None => {
                tracing::info!("ローカル検証を使用");
                Arc::new(local_verifier.clone())
            }
        };

        let ip_lookup = match &config.ip_lookup_url {
            Some(url) => {
                let client = IpLookupClient::new(
                    url.clone(),
                    Duration::from_millis(config.ip_lookup_timeout_ms),
                )
                .map_err(|e| {
                    tracing::error!(error = ?e, "IP取得クライアントの初期化に失敗");
                    AppError::Internal(anyhow::anyhow!("ip lookup client initialization error"))
                })?;
                Some(client)
            }
            None => None,
        };

        let audit = AuditService::new(audit_store, ip_lookup);

        let two_factor = TwoFactorService::new(
            secret_store,
            VerificationGate::new(verifier),
            audit.clone(),
            totp_service,
            limiter,
            config.backup_code_count,
        );

        Ok(Self {
            config,
            two_factor,
            audit,
            local_verifier,
        })
    }
}
