use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// ユーザーの二要素認証（TOTP）シークレット
///
/// シークレットは AES-256-GCM で暗号化、バックアップコードは SHA256 ハッシュで保存される
/// 平文シークレット・バックアップコードはログに出力禁止
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User2faSecret {
    pub user_id: Uuid,
    #[serde(skip)]
    pub secret_encrypted: Vec<u8>,
    #[serde(skip)]
    pub backup_codes: Vec<String>,
    pub verified: bool,
    /// 最後に受理したTOTPタイムステップ（リプレイ防止）
    #[serde(skip)]
    pub last_used_step: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User2faSecret {
    pub fn backup_codes_remaining(&self) -> usize {
        self.backup_codes.len()
    }
}
