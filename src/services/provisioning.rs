//! otpauth プロビジョニングURIの構築
//!
//! 形式: `otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}`
//! 認証アプリ（Google Authenticator 等）との互換性のため形式は変更しないこと

use urlencoding::encode;

/// プロビジョニングURIを構築
///
/// # Arguments
/// * `issuer` - 発行者名（アプリ名）
/// * `account_label` - アカウント識別子（通常はメールアドレス）
/// * `secret` - Base32エンコードされたシークレット
///
/// # Note
/// 発行者名とアカウント名はパーセントエンコードする（`@` や空白を含むため）
pub fn build_provisioning_uri(issuer: &str, account_label: &str, secret: &str) -> String {
    let issuer = encode(issuer);
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}",
        issuer,
        encode(account_label),
        secret,
        issuer
    )
}
