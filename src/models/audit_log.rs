use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

/// 監査対象アクション（閉じた語彙）
///
/// 新しいアクションを記録する場合はここにバリアントを追加すること。
/// 任意文字列での記録は受け付けない
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "user.login")]
    Login,
    #[serde(rename = "user.logout")]
    Logout,
    #[serde(rename = "user.signup")]
    Signup,
    #[serde(rename = "user.password_change")]
    PasswordChange,
    #[serde(rename = "user.2fa_enabled")]
    TwoFactorEnabled,
    #[serde(rename = "user.2fa_disabled")]
    TwoFactorDisabled,
    #[serde(rename = "user.2fa_backup_code_used")]
    TwoFactorBackupCodeUsed,
    #[serde(rename = "user.account_deletion_requested")]
    AccountDeletionRequested,
    #[serde(rename = "document.create")]
    DocumentCreate,
    #[serde(rename = "document.update")]
    DocumentUpdate,
    #[serde(rename = "document.delete")]
    DocumentDelete,
    #[serde(rename = "document.sign")]
    DocumentSign,
    #[serde(rename = "document.export")]
    DocumentExport,
    #[serde(rename = "data.export")]
    DataExport,
}

impl AuditAction {
    pub const ALL: [AuditAction; 14] = [
        Self::Login,
        Self::Logout,
        Self::Signup,
        Self::PasswordChange,
        Self::TwoFactorEnabled,
        Self::TwoFactorDisabled,
        Self::TwoFactorBackupCodeUsed,
        Self::AccountDeletionRequested,
        Self::DocumentCreate,
        Self::DocumentUpdate,
        Self::DocumentDelete,
        Self::DocumentSign,
        Self::DocumentExport,
        Self::DataExport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "user.login",
            Self::Logout => "user.logout",
            Self::Signup => "user.signup",
            Self::PasswordChange => "user.password_change",
            Self::TwoFactorEnabled => "user.2fa_enabled",
            Self::TwoFactorDisabled => "user.2fa_disabled",
            Self::TwoFactorBackupCodeUsed => "user.2fa_backup_code_used",
            Self::AccountDeletionRequested => "user.account_deletion_requested",
            Self::DocumentCreate => "document.create",
            Self::DocumentUpdate => "document.update",
            Self::DocumentDelete => "document.delete",
            Self::DocumentSign => "document.sign",
            Self::DocumentExport => "document.export",
            Self::DataExport => "data.export",
        }
    }

    /// アクションが対象とするリソース種別の既定値
    pub fn default_resource_type(self) -> &'static str {
        match self {
            Self::Login
            | Self::Logout
            | Self::Signup
            | Self::PasswordChange
            | Self::AccountDeletionRequested => "user",
            Self::TwoFactorEnabled | Self::TwoFactorDisabled | Self::TwoFactorBackupCodeUsed => {
                "user_2fa"
            }
            Self::DocumentCreate
            | Self::DocumentUpdate
            | Self::DocumentDelete
            | Self::DocumentSign
            | Self::DocumentExport => "document",
            Self::DataExport => "user_data",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown audit action: {0}")]
pub struct UnknownAuditAction(pub String);

impl FromStr for AuditAction {
    type Err = UnknownAuditAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownAuditAction(s.to_string()))
    }
}

/// 監査ログ（追記のみ、更新・削除しない）
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Json<serde_json::Value>,
    pub created_at: OffsetDateTime,
}

impl AuditLogEntry {
    pub fn action(&self) -> Result<AuditAction, UnknownAuditAction> {
        self.action.parse()
    }
}

/// 監査ログ挿入用データ
#[derive(Debug, Clone)]
pub struct NewAuditLogEntry {
    pub user_id: Uuid,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
}
