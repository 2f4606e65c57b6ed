//! リクエストからの利用者情報の抽出
//!
//! 認証自体は上流の認証ゲートウェイが行い、検証済みの識別情報を
//! `x-user-id` / `x-user-email` ヘッダーで渡す前提

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};
use uuid::Uuid;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// 認証済みユーザー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: String,
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_str(&parts.headers, USER_ID_HEADER)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| {
                tracing::warn!("ユーザーIDヘッダーが無いか不正");
                AppError::Unauthenticated
            })?;

        let email = header_str(&parts.headers, USER_EMAIL_HEADER)
            .filter(|v| v.contains('@'))
            .ok_or_else(|| {
                tracing::warn!(user_id = %id, "メールアドレスヘッダーが無いか不正");
                AppError::Unauthenticated
            })?
            .to_string();

        Ok(Self { id, email })
    }
}

/// 監査ログ用のクライアント情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        // X-Real-IP はゲートウェイが設定する。X-Forwarded-For の先頭は
        // クライアントが偽装できるため、ゲートウェイが追記した末尾を使う
        let ip_address = header_str(headers, "x-real-ip")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                header_str(headers, "x-forwarded-for")
                    .and_then(|v| v.rsplit(',').next())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
            .map(str::to_string);

        let user_agent = header_str(headers, "user-agent").map(str::to_string);

        Self {
            ip_address,
            user_agent,
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
