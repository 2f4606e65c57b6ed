use secrecy::SecretBox;
use serde::Deserialize;

use crate::services::rate_limit;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    #[serde(default = "default_totp_issuer")]
    pub totp_issuer: String,
    /// AES-256暗号化キー（Base64エンコード、32バイト）
    pub encryption_key: SecretBox<String>,
    /// 登録時に発行するバックアップコードの数
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,

    // 検証サーバー設定
    /// リモート検証エンドポイント（未設定ならローカル検証）
    #[serde(default)]
    pub verifier_url: Option<String>,
    #[serde(default = "default_verifier_timeout_secs")]
    pub verifier_timeout_secs: u64,
    /// ユーザーごとの検証試行の上限（TOTP・バックアップコード別々に数える）
    #[serde(default = "default_verify_max_attempts")]
    pub verify_max_attempts: u32,
    /// 試行1回分が回復するまでの秒数
    #[serde(default = "default_verify_attempt_window_secs")]
    pub verify_attempt_window_secs: u64,

    // 監査ログ設定
    /// 外部IP取得サービス（未設定ならリクエストヘッダーのみ使用）
    #[serde(default)]
    pub ip_lookup_url: Option<String>,
    #[serde(default = "default_ip_lookup_timeout_ms")]
    pub ip_lookup_timeout_ms: u64,

    // CORS設定（フロントエンドのオリジン）
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TOTP_ISSUER: &str = "SecuGenie";
const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
const DEFAULT_VERIFIER_TIMEOUT_SECS: u64 = 5;
const DEFAULT_IP_LOOKUP_TIMEOUT_MS: u64 = 1500;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_totp_issuer() -> String {
    DEFAULT_TOTP_ISSUER.to_string()
}

fn default_backup_code_count() -> usize {
    DEFAULT_BACKUP_CODE_COUNT
}

fn default_verifier_timeout_secs() -> u64 {
    DEFAULT_VERIFIER_TIMEOUT_SECS
}

fn default_verify_max_attempts() -> u32 {
    rate_limit::DEFAULT_MAX_ATTEMPTS
}

fn default_verify_attempt_window_secs() -> u64 {
    rate_limit::DEFAULT_WINDOW_SECS
}

fn default_ip_lookup_timeout_ms() -> u64 {
    DEFAULT_IP_LOOKUP_TIMEOUT_MS
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// 環境変数の一覧から設定を構築（テスト用）
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars)
    }
}
