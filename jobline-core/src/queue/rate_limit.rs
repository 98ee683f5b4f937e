//! Per-queue token-bucket rate limiting on the Enqueue path (§4.1).

use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Redis-side token bucket, refilled lazily on each acquisition rather than via a background
/// tick — the same approach the teacher's HTTP-layer rate limiter uses for its token-bucket
/// algorithm.
mod script {
    use redis::Script;

    pub fn acquire() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local rate = tonumber(ARGV[2])
            local burst = tonumber(ARGV[3])
            local requested = tonumber(ARGV[4])

            local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
            local tokens = tonumber(bucket[1])
            local last_update = tonumber(bucket[2]) or now
            if tokens == nil then
                tokens = burst
            end

            local elapsed = math.max(0, now - last_update)
            tokens = math.min(burst, tokens + elapsed * rate)

            if tokens >= requested then
                tokens = tokens - requested
                redis.call('HMSET', key, 'tokens', tokens, 'last_update', now)
                redis.call('EXPIRE', key, math.ceil(burst / rate) + 1)
                return {1, tokens}
            else
                local deficit = requested - tokens
                local wait_seconds = deficit / rate
                redis.call('HMSET', key, 'tokens', tokens, 'last_update', now)
                redis.call('EXPIRE', key, math.ceil(burst / rate) + 1)
                return {0, wait_seconds}
            end
            "#,
        )
    }
}

/// A token bucket bound to one Redis key (one queue). `rate` is tokens/second, `burst` the
/// bucket capacity.
pub struct TokenBucket {
    key: String,
    rate: f64,
    burst: f64,
    script: Script,
}

impl TokenBucket {
    pub fn new(key: impl Into<String>, rate: f64, burst: f64) -> Self {
        Self {
            key: key.into(),
            rate,
            burst,
            script: script::acquire(),
        }
    }

    /// Attempts to take one token without waiting. Used by `TryEnqueue`.
    pub async fn try_acquire(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let now = now_secs();
        let (allowed, _): (i64, f64) = self
            .script
            .key(&self.key)
            .arg(now)
            .arg(self.rate)
            .arg(self.burst)
            .arg(1.0)
            .invoke_async(conn)
            .await?;
        Ok(allowed == 1)
    }

    /// Blocks (with a deadline) until a token is available, smoothing bursts with jitter as
    /// required by §4.1.
    pub async fn acquire(&self, conn: &mut ConnectionManager, deadline: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            let now = now_secs();
            let (allowed, wait_or_tokens): (i64, f64) = self
                .script
                .key(&self.key)
                .arg(now)
                .arg(self.rate)
                .arg(self.burst)
                .arg(1.0)
                .invoke_async(conn)
                .await?;
            if allowed == 1 {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(QueueError::RateLimited(format!(
                    "queue {} rate limit exceeded",
                    self.key
                )));
            }
            let jitter = rand::random::<f64>() * 0.05;
            let wait = Duration::from_secs_f64((wait_or_tokens + jitter).max(0.0))
                .min(deadline.saturating_sub(start.elapsed()));
            tokio::time::sleep(wait).await;
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
