use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use totp_rs::{Algorithm, TOTP};

use crate::error::AppError;
use crate::services::provisioning::build_provisioning_uri;

/// TOTPの時間ステップ（秒）
pub const TOTP_PERIOD_SECS: u64 = 30;

/// 前後に許容するステップ数（±30秒）
pub const TOTP_SKEW_STEPS: u64 = 1;

const NONCE_LEN: usize = 12;

/// TOTP (Time-based One-Time Password) サービス
///
/// # Security
/// - シークレットはAES-256-GCMで暗号化してDB保存
/// - シークレット平文はログに出力しない
#[derive(Clone)]
pub struct TotpService {
    issuer: String,
    encryption_key: [u8; 32],
}

impl TotpService {
    /// 新しい TotpService を作成
    ///
    /// # Arguments
    /// * `issuer` - TOTP発行者名（アプリ名）
    /// * `encryption_key_base64` - Base64エンコードされた32バイトの暗号化キー
    pub fn new(issuer: String, encryption_key_base64: &str) -> Result<Self, AppError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let key_bytes = STANDARD.decode(encryption_key_base64).map_err(|e| {
            tracing::error!(error = ?e, "TOTP暗号化キーのBase64デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid encryption key format"))
        })?;

        if key_bytes.len() != 32 {
            tracing::error!(
                expected = 32,
                actual = key_bytes.len(),
                "TOTP暗号化キーの長さが不正"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "encryption key must be 32 bytes"
            )));
        }

        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&key_bytes);

        Ok(Self {
            issuer,
            encryption_key,
        })
    }

    /// 認証アプリ登録用のプロビジョニングURIを構築
    pub fn provisioning_uri(&self, account_label: &str, secret: &str) -> String {
        build_provisioning_uri(&self.issuer, account_label, secret)
    }

    /// シークレットをAES-256-GCMで暗号化
    ///
    /// # Returns
    /// 96ビットnonce (12バイト) + 暗号文
    pub fn encrypt_secret(&self, secret: &str) -> Result<Vec<u8>, AppError> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.try_fill_bytes(&mut nonce_bytes).map_err(|e| {
            tracing::error!(error = ?e, "nonce生成エラー");
            AppError::Internal(anyhow::anyhow!("nonce generation error"))
        })?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレット暗号化エラー");
            AppError::Internal(anyhow::anyhow!("encryption error"))
        })?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// 暗号化されたシークレットを復号
    pub fn decrypt_secret(&self, encrypted: &[u8]) -> Result<String, AppError> {
        if encrypted.len() < NONCE_LEN {
            tracing::error!(len = encrypted.len(), "暗号化データが短すぎる");
            return Err(AppError::Internal(anyhow::anyhow!(
                "encrypted data too short"
            )));
        }

        let cipher = self.cipher()?;

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|e| {
            tracing::error!(error = ?e, "シークレット復号エラー");
            AppError::Internal(anyhow::anyhow!("decryption error"))
        })?;

        String::from_utf8(plaintext).map_err(|e| {
            tracing::error!(error = ?e, "復号データのUTF-8変換エラー");
            AppError::Internal(anyhow::anyhow!("invalid utf8 after decryption"))
        })
    }

    /// 指定時刻でTOTPコードを照合し、一致したタイムステップを返す
    ///
    /// 前後 `TOTP_SKEW_STEPS` ステップを許容する。
    /// リプレイ防止のため、呼び出し側は返却されたステップを記録すること
    pub fn matching_step(
        &self,
        secret: &str,
        code: &str,
        unix_time: u64,
    ) -> Result<Option<u64>, AppError> {
        if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }

        let totp = self.create_totp(secret)?;
        let current_step = unix_time / TOTP_PERIOD_SECS;

        let first = current_step.saturating_sub(TOTP_SKEW_STEPS);
        let last = current_step + TOTP_SKEW_STEPS;

        // skew=0 のTOTPでステップごとに比較（check は定数時間比較）
        Ok((first..=last).find(|step| totp.check(code, step * TOTP_PERIOD_SECS)))
    }

    /// 指定時刻のTOTPコードを生成
    #[cfg(test)]
    pub(crate) fn code_at(&self, secret: &str, unix_time: u64) -> Result<String, AppError> {
        Ok(self.create_totp(secret)?.generate(unix_time))
    }

    fn cipher(&self) -> Result<Aes256Gcm, AppError> {
        Aes256Gcm::new_from_slice(&self.encryption_key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })
    }

    fn create_totp(&self, secret: &str) -> Result<TOTP, AppError> {
        let secret_bytes = BASE32_NOPAD.decode(secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレットのBase32デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid base32 secret"))
        })?;

        TOTP::new(
            Algorithm::SHA1,
            6,
            0, // skew は matching_step 側で扱う
            TOTP_PERIOD_SECS,
            secret_bytes,
            None,
            String::new(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "TOTP作成エラー");
            AppError::Internal(anyhow::anyhow!("totp creation error"))
        })
    }
}
