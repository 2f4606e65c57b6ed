//! 二要素認証の登録フロー
//!
//! generate → verify → backup → complete の一方向遷移。
//! セッションはクライアント側で保持し、サーバーには保存しない
//! （サーバー側の真実は `user_2fa_secrets.verified`）

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::{ClientContext, CurrentUser};
use crate::models::AuditAction;
use crate::repositories::User2faSecretStore;
use crate::services::TotpService;
use crate::services::audit::{AuditEvent, AuditService};
use crate::services::rate_limit::{AttemptKind, AttemptLimiter};
use crate::services::secret::{generate_backup_codes, generate_secret, hash_backup_code};
use crate::services::verifier::VerificationGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStep {
    Generate,
    Verify,
    Backup,
    Complete,
}

impl EnrollmentStep {
    /// 次のステップ（complete は終端）
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Generate => Some(Self::Verify),
            Self::Verify => Some(Self::Backup),
            Self::Backup => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Verify => "verify",
            Self::Backup => "backup",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for EnrollmentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 登録セッション（クライアント保持）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentSession {
    step: EnrollmentStep,
    pub secret: String,
    pub qr_code_uri: String,
    pub backup_codes: Vec<String>,
    pub submitted_code: Option<String>,
}

impl EnrollmentSession {
    /// generate ステップの空セッション
    pub fn new() -> Self {
        Self {
            step: EnrollmentStep::Generate,
            secret: String::new(),
            qr_code_uri: String::new(),
            backup_codes: Vec::new(),
            submitted_code: None,
        }
    }

    pub fn step(&self) -> EnrollmentStep {
        self.step
    }

    pub fn is_complete(&self) -> bool {
        self.step == EnrollmentStep::Complete
    }

    fn expect_step(&self, expected: EnrollmentStep) -> Result<(), AppError> {
        if self.step != expected {
            return Err(AppError::InvalidEnrollmentStep {
                expected,
                actual: self.step,
            });
        }
        Ok(())
    }

    /// 1ステップだけ前進（スキップ・後退なし）
    fn advance(&mut self) -> Result<(), AppError> {
        let next = self.step.next().ok_or(AppError::InvalidEnrollmentStep {
            expected: self.step,
            actual: self.step,
        })?;
        self.step = next;
        Ok(())
    }
}

impl Default for EnrollmentSession {
    fn default() -> Self {
        Self::new()
    }
}

/// 2FAの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    pub backup_codes_remaining: usize,
}

/// 二要素認証サービス
#[derive(Clone)]
pub struct TwoFactorService {
    store: Arc<dyn User2faSecretStore>,
    gate: VerificationGate,
    audit: AuditService,
    totp_service: TotpService,
    limiter: AttemptLimiter,
    backup_code_count: usize,
}

impl TwoFactorService {
    pub fn new(
        store: Arc<dyn User2faSecretStore>,
        gate: VerificationGate,
        audit: AuditService,
        totp_service: TotpService,
        limiter: AttemptLimiter,
        backup_code_count: usize,
    ) -> Self {
        Self {
            store,
            gate,
            audit,
            totp_service,
            limiter,
            backup_code_count,
        }
    }

    /// 2FAが有効か（検証済みレコードが存在するか）
    pub async fn is_enabled(&self, user_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .store
            .find_by_user_id(user_id)
            .await?
            .is_some_and(|r| r.verified))
    }

    /// 2FAの状態（未検証レコードは無効扱い）
    pub async fn status(&self, user_id: Uuid) -> Result<TwoFactorStatus, AppError> {
        let status = match self.store.find_by_user_id(user_id).await? {
            Some(record) if record.verified => TwoFactorStatus {
                enabled: true,
                backup_codes_remaining: record.backup_codes_remaining(),
            },
            _ => TwoFactorStatus {
                enabled: false,
                backup_codes_remaining: 0,
            },
        };
        Ok(status)
    }

    /// generate: シークレット・バックアップコード・URIを生成して保存
    ///
    /// # Note
    /// 未検証のレコードが残っている場合は上書きする。
    /// 保存に成功した場合のみ verify ステップのセッションを返す
    ///
    /// # Security
    /// - シークレット・バックアップコードはログ出力禁止
    pub async fn start_enrollment(&self, user: &CurrentUser) -> Result<EnrollmentSession, AppError> {
        let mut session = EnrollmentSession::new();

        if self.is_enabled(user.id).await? {
            return Err(AppError::TotpAlreadyEnabled);
        }

        let secret = generate_secret()?;
        let backup_codes = generate_backup_codes(self.backup_code_count)?;
        let qr_code_uri = self.totp_service.provisioning_uri(&user.email, &secret);

        let encrypted = self.totp_service.encrypt_secret(&secret)?;
        let hashes: Vec<String> = backup_codes.iter().map(|c| hash_backup_code(c)).collect();

        // 検証済みレコードとの競合時は None（上書きしない）
        self.store
            .upsert_unverified(user.id, &encrypted, &hashes)
            .await?
            .ok_or(AppError::TotpAlreadyEnabled)?;

        session.secret = secret;
        session.qr_code_uri = qr_code_uri;
        session.backup_codes = backup_codes;
        session.advance()?;

        tracing::info!(user_id = %user.id, "2FA設定開始");

        Ok(session)
    }

    /// verify: 入力コードを検証し、成功時に有効化
    ///
    /// 失敗時はセッションを verify のまま残す（再試行可能）。
    /// 監査ログの失敗は有効化を巻き戻さない
    ///
    /// # Security
    /// - コードはログ出力禁止
    pub async fn submit_code(
        &self,
        session: &mut EnrollmentSession,
        user: &CurrentUser,
        client: &ClientContext,
        code: &str,
    ) -> Result<(), AppError> {
        session.expect_step(EnrollmentStep::Verify)?;
        session.submitted_code = Some(code.trim().to_string());

        if !self.gate.check(user.id, code).await? {
            tracing::info!(user_id = %user.id, "2FA検証失敗: コード不一致");
            return Err(AppError::TotpInvalid);
        }

        if !self.store.mark_verified(user.id).await? {
            // 別セッションで上書き・削除された、または既に有効化済み
            tracing::warn!(user_id = %user.id, "2FA有効化対象のレコードが存在しない");
            return Err(AppError::TotpSetupRequired);
        }

        self.audit
            .log(
                user.id,
                client,
                AuditEvent::new(AuditAction::TwoFactorEnabled)
                    .resource("user_2fa", Some(user.id.to_string()))
                    .metadata(serde_json::json!({ "method": "totp" })),
            )
            .await;

        session.advance()?;

        tracing::info!(user_id = %user.id, "2FA有効化完了");

        Ok(())
    }

    /// backup: バックアップコード保管の確認で完了
    pub async fn acknowledge_backup_codes(
        &self,
        session: &mut EnrollmentSession,
        user: &CurrentUser,
    ) -> Result<(), AppError> {
        session.expect_step(EnrollmentStep::Backup)?;

        // クライアント保持のセッションは改ざんされ得るため、サーバー側の状態で確認
        if !self.is_enabled(user.id).await? {
            tracing::warn!(user_id = %user.id, "未検証のまま backup 確認が要求された");
            return Err(AppError::InvalidEnrollmentStep {
                expected: EnrollmentStep::Verify,
                actual: EnrollmentStep::Backup,
            });
        }

        session.advance()?;
        session.submitted_code = None;

        tracing::info!(user_id = %user.id, "2FA登録完了");

        Ok(())
    }

    /// 2FA無効化（レコードを完全に削除）
    pub async fn disable(
        &self,
        user: &CurrentUser,
        client: &ClientContext,
        code: &str,
    ) -> Result<(), AppError> {
        if !self.is_enabled(user.id).await? {
            return Err(AppError::TotpNotEnabled);
        }

        if !self.gate.check(user.id, code).await? {
            return Err(AppError::TotpInvalid);
        }

        self.store.delete(user.id).await?;

        self.audit
            .log(
                user.id,
                client,
                AuditEvent::new(AuditAction::TwoFactorDisabled)
                    .resource("user_2fa", Some(user.id.to_string())),
            )
            .await;

        tracing::info!(user_id = %user.id, "2FA無効化完了");

        Ok(())
    }

    /// バックアップコードを1件消費
    ///
    /// 試行回数はユーザー単位で制限し、超過中は照合しない
    ///
    /// # Returns
    /// 残りのバックアップコード数
    pub async fn redeem_backup_code(
        &self,
        user: &CurrentUser,
        client: &ClientContext,
        code: &str,
    ) -> Result<usize, AppError> {
        if !self.is_enabled(user.id).await? {
            return Err(AppError::TotpNotEnabled);
        }

        self.limiter
            .check(AttemptKind::BackupCode, user.id)
            .map_err(|retry_after_secs| AppError::TooManyAttempts { retry_after_secs })?;

        let remaining = self
            .store
            .consume_backup_code(user.id, &hash_backup_code(code))
            .await?
            .ok_or_else(|| {
                tracing::warn!(user_id = %user.id, "無効なバックアップコード");
                AppError::BackupCodeInvalid
            })?;

        self.audit
            .log(
                user.id,
                client,
                AuditEvent::new(AuditAction::TwoFactorBackupCodeUsed)
                    .resource("user_2fa", Some(user.id.to_string()))
                    .metadata(serde_json::json!({ "remaining": remaining })),
            )
            .await;

        tracing::info!(user_id = %user.id, remaining, "バックアップコード使用");

        Ok(remaining)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::repositories::memory::{InMemory2faStore, InMemoryAuditLogStore};
    use crate::services::totp::tests::create_test_service;
    use crate::services::verifier::tests::StaticVerifier;
    use std::sync::atomic::Ordering;

    pub(crate) const VALID_CODE: &str = "424242";

    pub(crate) struct Fixture {
        pub service: TwoFactorService,
        pub store: Arc<InMemory2faStore>,
        pub audit_store: Arc<InMemoryAuditLogStore>,
        pub verifier: Arc<StaticVerifier>,
        pub user: CurrentUser,
    }

    pub(crate) fn fixture() -> Fixture {
        let store = Arc::new(InMemory2faStore::default());
        let audit_store = Arc::new(InMemoryAuditLogStore::default());
        let verifier = Arc::new(StaticVerifier::new(VALID_CODE));
        let service = TwoFactorService::new(
            store.clone(),
            VerificationGate::new(verifier.clone()),
            AuditService::new(audit_store.clone(), None),
            create_test_service(),
            AttemptLimiter::new(5, 300),
            10,
        );

        Fixture {
            service,
            store,
            audit_store,
            verifier,
            user: CurrentUser {
                id: Uuid::new_v4(),
                email: "demo@secugenie.com".to_string(),
            },
        }
    }

    fn client() -> ClientContext {
        ClientContext {
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        }
    }

    fn enabled_entries(f: &Fixture) -> usize {
        f.audit_store
            .entries()
            .iter()
            .filter(|e| e.action == "user.2fa_enabled")
            .count()
    }

    async fn enroll(f: &Fixture) -> EnrollmentSession {
        let mut session = f.service.start_enrollment(&f.user).await.unwrap();
        f.service
            .submit_code(&mut session, &f.user, &client(), VALID_CODE)
            .await
            .unwrap();
        f.service
            .acknowledge_backup_codes(&mut session, &f.user)
            .await
            .unwrap();
        session
    }

    #[test]
    fn test_steps_only_move_forward() {
        assert_eq!(EnrollmentStep::Generate.next(), Some(EnrollmentStep::Verify));
        assert_eq!(EnrollmentStep::Verify.next(), Some(EnrollmentStep::Backup));
        assert_eq!(EnrollmentStep::Backup.next(), Some(EnrollmentStep::Complete));
        assert_eq!(EnrollmentStep::Complete.next(), None);
    }

    #[test]
    fn test_session_serializes_snake_case_step() {
        let json = serde_json::to_value(EnrollmentSession::new()).unwrap();
        assert_eq!(json["step"], "generate");
    }

    #[tokio::test]
    async fn test_demo_user_scenario() {
        let f = fixture();

        // generate
        let mut session = f.service.start_enrollment(&f.user).await.unwrap();
        assert_eq!(session.step(), EnrollmentStep::Verify);
        assert_eq!(session.secret.len(), 32);
        assert_eq!(session.backup_codes.len(), 10);
        assert!(
            session
                .qr_code_uri
                .starts_with("otpauth://totp/SecuGenie:demo%40secugenie.com?secret=")
        );
        let record = f.store.get(f.user.id).unwrap();
        assert!(!record.verified);
        assert_eq!(record.backup_codes.len(), 10);

        // 誤ったコード
        let result = f
            .service
            .submit_code(&mut session, &f.user, &client(), "000000")
            .await;
        assert!(matches!(result, Err(AppError::TotpInvalid)));
        assert_eq!(session.step(), EnrollmentStep::Verify);
        assert!(!f.store.get(f.user.id).unwrap().verified);
        assert_eq!(enabled_entries(&f), 0);

        // 正しいコード
        f.service
            .submit_code(&mut session, &f.user, &client(), VALID_CODE)
            .await
            .unwrap();
        assert_eq!(session.step(), EnrollmentStep::Backup);
        assert!(f.store.get(f.user.id).unwrap().verified);
        assert_eq!(enabled_entries(&f), 1);

        let entry = &f.audit_store.entries()[0];
        assert_eq!(entry.user_id, f.user.id);
        assert_eq!(entry.ip_address.as_deref(), Some("203.0.113.7"));

        // backup
        f.service
            .acknowledge_backup_codes(&mut session, &f.user)
            .await
            .unwrap();
        assert!(session.is_complete());
        assert!(f.service.is_enabled(f.user.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_block_verification() {
        let f = fixture();
        let mut session = f.service.start_enrollment(&f.user).await.unwrap();

        f.audit_store.set_fail_inserts(true);
        f.service
            .submit_code(&mut session, &f.user, &client(), VALID_CODE)
            .await
            .unwrap();

        assert!(f.store.get(f.user.id).unwrap().verified);
        assert_eq!(session.step(), EnrollmentStep::Backup);
        assert!(f.audit_store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_verifier_outage_keeps_verify_step() {
        let f = fixture();
        let mut session = f.service.start_enrollment(&f.user).await.unwrap();

        f.verifier.unavailable.store(true, Ordering::SeqCst);
        let result = f
            .service
            .submit_code(&mut session, &f.user, &client(), VALID_CODE)
            .await;
        assert!(matches!(result, Err(AppError::VerifierUnavailable)));
        assert_eq!(session.step(), EnrollmentStep::Verify);
        assert!(!f.store.get(f.user.id).unwrap().verified);

        // 復旧後は再試行できる
        f.verifier.unavailable.store(false, Ordering::SeqCst);
        f.service
            .submit_code(&mut session, &f.user, &client(), VALID_CODE)
            .await
            .unwrap();
        assert_eq!(session.step(), EnrollmentStep::Backup);
    }

    #[tokio::test]
    async fn test_cannot_force_advance_to_backup() {
        let f = fixture();
        let mut session = f.service.start_enrollment(&f.user).await.unwrap();

        // verify を経ずに backup 確認
        let result = f.service.acknowledge_backup_codes(&mut session, &f.user).await;
        assert!(matches!(
            result,
            Err(AppError::InvalidEnrollmentStep {
                expected: EnrollmentStep::Backup,
                actual: EnrollmentStep::Verify
            })
        ));
        assert_eq!(session.step(), EnrollmentStep::Verify);

        // generate 前のセッションでコード送信
        let mut fresh = EnrollmentSession::new();
        let result = f
            .service
            .submit_code(&mut fresh, &f.user, &client(), VALID_CODE)
            .await;
        assert!(matches!(result, Err(AppError::InvalidEnrollmentStep { .. })));
        assert_eq!(fresh.step(), EnrollmentStep::Generate);
        assert!(!f.store.get(f.user.id).unwrap().verified);
    }

    #[tokio::test]
    async fn test_forged_backup_session_rejected() {
        let f = fixture();
        let session = f.service.start_enrollment(&f.user).await.unwrap();

        // クライアント側でステップを書き換えたセッション
        let mut json = serde_json::to_value(&session).unwrap();
        json["step"] = serde_json::json!("backup");
        let mut forged: EnrollmentSession = serde_json::from_value(json).unwrap();

        let result = f.service.acknowledge_backup_codes(&mut forged, &f.user).await;
        assert!(matches!(result, Err(AppError::InvalidEnrollmentStep { .. })));
        assert_eq!(forged.step(), EnrollmentStep::Backup);
        assert!(!f.service.is_enabled(f.user.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_is_terminal() {
        let f = fixture();
        let mut session = enroll(&f).await;

        let result = f
            .service
            .submit_code(&mut session, &f.user, &client(), VALID_CODE)
            .await;
        assert!(matches!(result, Err(AppError::InvalidEnrollmentStep { .. })));
        let result = f.service.acknowledge_backup_codes(&mut session, &f.user).await;
        assert!(matches!(result, Err(AppError::InvalidEnrollmentStep { .. })));
        assert!(session.is_complete());
        assert_eq!(enabled_entries(&f), 1);
    }

    #[tokio::test]
    async fn test_start_rejected_when_already_enabled() {
        let f = fixture();
        enroll(&f).await;

        let result = f.service.start_enrollment(&f.user).await;
        assert!(matches!(result, Err(AppError::TotpAlreadyEnabled)));
        assert!(f.store.get(f.user.id).unwrap().verified);
    }

    #[tokio::test]
    async fn test_abandoned_enrollment_is_overwritten() {
        let f = fixture();
        let first = f.service.start_enrollment(&f.user).await.unwrap();
        let first_record = f.store.get(f.user.id).unwrap();

        let second = f.service.start_enrollment(&f.user).await.unwrap();
        let second_record = f.store.get(f.user.id).unwrap();

        assert_ne!(first.secret, second.secret);
        assert_ne!(first_record.secret_encrypted, second_record.secret_encrypted);
        assert_ne!(first_record.backup_codes, second_record.backup_codes);
        assert!(!second_record.verified);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_generate_step() {
        let f = fixture();
        f.store.set_fail_writes(true);

        let result = f.service.start_enrollment(&f.user).await;
        assert!(matches!(result, Err(AppError::Database(_))));
        assert!(f.store.get(f.user.id).is_none());
    }

    #[tokio::test]
    async fn test_verify_after_record_removed_requires_setup() {
        let f = fixture();
        let mut session = f.service.start_enrollment(&f.user).await.unwrap();
        f.store.delete(f.user.id).await.unwrap();

        let result = f
            .service
            .submit_code(&mut session, &f.user, &client(), VALID_CODE)
            .await;
        assert!(matches!(result, Err(AppError::TotpSetupRequired)));
        assert_eq!(session.step(), EnrollmentStep::Verify);
        assert_eq!(enabled_entries(&f), 0);
    }

    #[tokio::test]
    async fn test_disable_removes_record() {
        let f = fixture();
        enroll(&f).await;

        let result = f.service.disable(&f.user, &client(), "000000").await;
        assert!(matches!(result, Err(AppError::TotpInvalid)));
        assert!(f.service.is_enabled(f.user.id).await.unwrap());

        f.service.disable(&f.user, &client(), VALID_CODE).await.unwrap();
        assert!(f.store.get(f.user.id).is_none());
        assert!(!f.service.is_enabled(f.user.id).await.unwrap());

        let disabled = f
            .audit_store
            .entries()
            .iter()
            .filter(|e| e.action == "user.2fa_disabled")
            .count();
        assert_eq!(disabled, 1);
    }

    #[tokio::test]
    async fn test_disable_when_not_enabled() {
        let f = fixture();
        let result = f.service.disable(&f.user, &client(), VALID_CODE).await;
        assert!(matches!(result, Err(AppError::TotpNotEnabled)));

        // 未検証のレコードだけでは無効化対象にならない
        f.service.start_enrollment(&f.user).await.unwrap();
        let result = f.service.disable(&f.user, &client(), VALID_CODE).await;
        assert!(matches!(result, Err(AppError::TotpNotEnabled)));
    }

    #[tokio::test]
    async fn test_backup_code_single_use() {
        let f = fixture();
        let session = enroll(&f).await;
        let code = session.backup_codes[3].clone();

        let remaining = f
            .service
            .redeem_backup_code(&f.user, &client(), &code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(remaining, 9);

        let result = f.service.redeem_backup_code(&f.user, &client(), &code).await;
        assert!(matches!(result, Err(AppError::BackupCodeInvalid)));

        let used = f
            .audit_store
            .entries()
            .iter()
            .filter(|e| e.action == "user.2fa_backup_code_used")
            .count();
        assert_eq!(used, 1);

        let status = f.service.status(f.user.id).await.unwrap();
        assert!(status.enabled);
        assert_eq!(status.backup_codes_remaining, 9);
    }

    #[tokio::test]
    async fn test_backup_code_before_verification_rejected() {
        let f = fixture();
        let session = f.service.start_enrollment(&f.user).await.unwrap();

        let result = f
            .service
            .redeem_backup_code(&f.user, &client(), &session.backup_codes[0])
            .await;
        assert!(matches!(result, Err(AppError::TotpNotEnabled)));
    }

    #[tokio::test]
    async fn test_backup_code_guessing_is_rate_limited() {
        let f = fixture();
        let session = enroll(&f).await;

        for _ in 0..5 {
            let result = f
                .service
                .redeem_backup_code(&f.user, &client(), "ZZZZZZZZ")
                .await;
            assert!(matches!(result, Err(AppError::BackupCodeInvalid)));
        }

        // 上限到達後は正しいコードでも消費しない
        let result = f
            .service
            .redeem_backup_code(&f.user, &client(), &session.backup_codes[0])
            .await;
        assert!(matches!(result, Err(AppError::TooManyAttempts { .. })));
        assert_eq!(f.store.get(f.user.id).unwrap().backup_codes.len(), 10);
    }
}
