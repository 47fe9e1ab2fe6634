use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::store::Store;

/// Length of one counting window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Offset stored under a subject's field at the start of each window. A post-increment value
/// at or below this means the field was unset.
const BASE: i64 = 1 << 32;

/// Store-backed rate limiter using fixed one-minute windows.
///
/// All requests of a subject within `[k*60s, (k+1)*60s)` share one counter in the hash
/// `{prefix}:{k}`. Counting restarts at every window boundary, so a subject can spend its full
/// limit at the end of one window and again at the start of the next: up to twice the limit in
/// a short burst across the boundary. This is not a sliding window.
///
/// Store failures allow the request.
pub struct FixedWindowRateLimiter {
    store: Arc<dyn Store>,
    prefix: String,
    limit: u64,
}

impl FixedWindowRateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>, limit: u64) -> Self {
        Self { store, prefix: prefix.into(), limit }
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Counts one request for `subject` in the current window. Returns `false` if it exceeds
    /// the limit.
    pub async fn check(&self, subject: &str) -> bool {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        self.check_at(subject, now).await
    }

    /// Same as [`check`](Self::check) with an explicit clock in Unix seconds.
    pub async fn check_at(&self, subject: &str, now_secs: u64) -> bool {
        let window = now_secs / WINDOW.as_secs();
        let key = format!("{}:{window}", self.prefix);

        let mut value = match self.store.hincr(&key, subject, 1).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(subject = subject, error = %e, "rate limit check failed, allowing");
                return true;
            }
        };

        if value <= BASE {
            value = BASE + 1;
            if let Err(e) = self.store.hset(&key, subject, value).await {
                tracing::warn!(subject = subject, error = %e, "rate limit base write failed");
            }
            if let Err(e) = self.store.expire_nx(&key, WINDOW).await {
                tracing::warn!(key = %key, error = %e, "rate limit window expiry failed");
            }
        }

        let used = u64::try_from(value - BASE).unwrap_or(0);
        let allowed = used <= self.limit;
        if !allowed {
            tracing::debug!(subject = subject, used = used, limit = self.limit, "rate limited");
        }
        allowed
    }
}
