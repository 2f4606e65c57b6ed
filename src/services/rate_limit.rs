//! コード検証の試行回数制限
//!
//! ユーザー単位・用途単位のキーで試行を数える。
//! 上限に達したキーは回復するまで検証そのものを行わない

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
};
use uuid::Uuid;

/// N回ごとに古いキーを掃除する
const SHRINK_INTERVAL: u64 = 1000;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// 試行の種類（キーを分ける）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Totp,
    BackupCode,
}

impl AttemptKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::BackupCode => "backup",
        }
    }
}

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock, NoOpMiddleware>;

/// ユーザー単位の試行回数制限
///
/// `max_attempts` 回まで即時に許可し、以降は `window_secs` ごとに1回分回復する
#[derive(Clone)]
pub struct AttemptLimiter {
    limiter: Arc<KeyedLimiter>,
    request_count: Arc<AtomicU64>,
}

impl AttemptLimiter {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        let burst = NonZeroU32::new(max_attempts).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(Duration::from_secs(window_secs.max(1)))
            .unwrap_or_else(|| Quota::per_minute(burst))
            .allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            request_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 1回分の試行を消費
    ///
    /// 上限超過時は再試行までの秒数を返す
    pub fn check(&self, kind: AttemptKind, user_id: Uuid) -> Result<(), u64> {
        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count % SHRINK_INTERVAL == 0 && count > 0 {
            self.limiter.retain_recent();
        }

        let key = format!("{}:{}", kind.prefix(), user_id);
        match self.limiter.check_key(&key) {
            Ok(_) => Ok(()),
            Err(not_until) => {
                let wait =
                    not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
                tracing::warn!(
                    user_id = %user_id,
                    kind = kind.prefix(),
                    retry_after_secs = wait.as_secs().max(1),
                    "検証試行回数の上限超過"
                );
                Err(wait.as_secs().max(1))
            }
        }
    }
}

impl Default for AttemptLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW_SECS)
    }
}
