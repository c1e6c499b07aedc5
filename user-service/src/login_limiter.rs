use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::warn;

const DEFAULT_THRESHOLD: i64 = 5;
const DEFAULT_WINDOW_SECS: u64 = 15 * 60;

/// Atomic counter with TTL + lockout detection (C7).
#[async_trait]
pub trait LoginLimiter: Send + Sync {
    /// Store unavailability is logged and treated as *not locked* — fail-open,
    /// since availability outranks strict enforcement during an outage (§4.7).
    async fn is_locked(&self, email: &str) -> bool;
    async fn record_failure(&self, email: &str) -> anyhow::Result<i64>;
    async fn reset_attempts(&self, email: &str) -> anyhow::Result<()>;
}

/// `INCR` then, only on the first increment, `EXPIRE` — executed as a single
/// Lua script so a crash between the two calls can never leave a permanent lock.
const RECORD_FAILURE_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if tonumber(count) == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Clone)]
pub struct RedisLoginLimiter {
    manager: ConnectionManager,
    threshold: i64,
    window_secs: u64,
}

impl RedisLoginLimiter {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        Self::connect_with(redis_url, DEFAULT_THRESHOLD, DEFAULT_WINDOW_SECS).await
    }

    pub async fn connect_with(redis_url: &str, threshold: i64, window_secs: u64) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            threshold,
            window_secs,
        })
    }

    fn key(email: &str) -> String {
        format!("login_attempts:{email}")
    }
}

#[async_trait]
impl LoginLimiter for RedisLoginLimiter {
    async fn is_locked(&self, email: &str) -> bool {
        let mut conn = self.manager.clone();
        let count: redis::RedisResult<Option<i64>> = conn.get(Self::key(email)).await;
        match count {
            Ok(count) => count.unwrap_or(0) >= self.threshold,
            Err(e) => {
                warn!("login limiter store unavailable, failing open: {e}");
                false
            }
        }
    }

    async fn record_failure(&self, email: &str) -> anyhow::Result<i64> {
        let mut conn = self.manager.clone();
        let script = Script::new(RECORD_FAILURE_SCRIPT);
        let count: i64 = script
            .key(Self::key(email))
            .arg(self.window_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn reset_attempts(&self, email: &str) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(Self::key(email)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryLoginLimiter {
        counts: Mutex<HashMap<String, i64>>,
        threshold: i64,
    }

    impl InMemoryLoginLimiter {
        pub fn new(threshold: i64) -> Self {
            Self {
                counts: Mutex::new(HashMap::new()),
                threshold,
            }
        }
    }

    #[async_trait]
    impl LoginLimiter for InMemoryLoginLimiter {
        async fn is_locked(&self, email: &str) -> bool {
            let counts = self.counts.lock().await;
            counts.get(email).copied().unwrap_or(0) >= self.threshold
        }

        async fn record_failure(&self, email: &str) -> anyhow::Result<i64> {
            let mut counts = self.counts.lock().await;
            let entry = counts.entry(email.to_string()).or_insert(0);
            *entry += 1;
            Ok(*entry)
        }

        async fn reset_attempts(&self, email: &str) -> anyhow::Result<()> {
            self.counts.lock().await.remove(email);
            Ok(())
        }
    }

    #[tokio::test]
    async fn locks_after_threshold_failures() {
        let limiter = InMemoryLoginLimiter::new(5);
        for _ in 0..5 {
            limiter.record_failure("a@b.com").await.unwrap();
        }
        assert!(limiter.is_locked("a@b.com").await);
    }

    #[tokio::test]
    async fn reset_clears_the_counter() {
        let limiter = InMemoryLoginLimiter::new(5);
        for _ in 0..5 {
            limiter.record_failure("a@b.com").await.unwrap();
        }
        limiter.reset_attempts("a@b.com").await.unwrap();
        assert!(!limiter.is_locked("a@b.com").await);
    }
}
