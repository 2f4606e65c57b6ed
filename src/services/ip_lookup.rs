use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct IpLookupResponse {
    ip: String,
}

/// 外部IP取得サービスのクライアント（ベストエフォート）
///
/// 失敗・タイムアウト時は None を返し、呼び出し側を止めない
#[derive(Clone)]
pub struct IpLookupClient {
    client: reqwest::Client,
    url: String,
}

impl IpLookupClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    /// `GET {url}` → `{ "ip": "..." }`
    pub async fn lookup(&self) -> Option<String> {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "IP取得リクエスト失敗");
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "IP取得サービスがエラーを返却");
            return None;
        }

        match response.json::<IpLookupResponse>().await {
            Ok(body) if !body.ip.trim().is_empty() => Some(body.ip.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "IP取得レスポンスのパースエラー");
                None
            }
        }
    }
}
