use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Per-token revocation and per-user mass invalidation against a key-value
/// store (C6). Two independent mechanisms, same backing store.
#[async_trait]
pub trait Blacklist: Send + Sync {
    /// Adds `jti` to the blacklist until `expires_at`. A no-op if the token is
    /// already dead (`expires_at <= now`) — nothing left to revoke.
    async fn add(&self, jti: &str, expires_at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn check(&self, jti: &str) -> anyhow::Result<bool>;
    async fn invalidate_user(&self, user_id: &str, refresh_ttl_secs: u64) -> anyhow::Result<()>;
    /// `true` iff a mass invalidation was recorded for `user_id` after `issued_at`.
    async fn is_user_invalidated(&self, user_id: &str, issued_at: DateTime<Utc>) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct RedisBlacklist {
    manager: ConnectionManager,
}

impl RedisBlacklist {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    fn blacklist_key(jti: &str) -> String {
        format!("jwt:blacklist:{jti}")
    }

    fn invalidated_key(user_id: &str) -> String {
        format!("jwt:invalidated:{user_id}")
    }
}

#[async_trait]
impl Blacklist for RedisBlacklist {
    async fn add(&self, jti: &str, expires_at: DateTime<Utc>) -> anyhow::Result<()> {
        let ttl = (expires_at - Utc::now()).num_seconds();
        if ttl <= 0 {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(Self::blacklist_key(jti), "1", ttl as u64).await?;
        Ok(())
    }

    async fn check(&self, jti: &str) -> anyhow::Result<bool> {
        let mut conn = self.manager.clone();
        let exists: bool = conn.exists(Self::blacklist_key(jti)).await?;
        Ok(exists)
    }

    async fn invalidate_user(&self, user_id: &str, refresh_ttl_secs: u64) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        let now = Utc::now().timestamp();
        let _: () = conn
            .set_ex(Self::invalidated_key(user_id), now, refresh_ttl_secs)
            .await?;
        Ok(())
    }

    async fn is_user_invalidated(&self, user_id: &str, issued_at: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut conn = self.manager.clone();
        let stored: Option<i64> = conn.get(Self::invalidated_key(user_id)).await?;
        Ok(match stored {
            Some(invalidated_at) => issued_at.timestamp() < invalidated_at,
            None => false,
        })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryBlacklist {
        tokens: Mutex<HashMap<String, DateTime<Utc>>>,
        invalidated: Mutex<HashMap<String, i64>>,
    }

    impl InMemoryBlacklist {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Blacklist for InMemoryBlacklist {
        async fn add(&self, jti: &str, expires_at: DateTime<Utc>) -> anyhow::Result<()> {
            if expires_at <= Utc::now() {
                return Ok(());
            }
            self.tokens.lock().await.insert(jti.to_string(), expires_at);
            Ok(())
        }

        async fn check(&self, jti: &str) -> anyhow::Result<bool> {
            let tokens = self.tokens.lock().await;
            Ok(match tokens.get(jti) {
                Some(expires_at) => *expires_at > Utc::now(),
                None => false,
            })
        }

        async fn invalidate_user(&self, user_id: &str, _refresh_ttl_secs: u64) -> anyhow::Result<()> {
            self.invalidated
                .lock()
                .await
                .insert(user_id.to_string(), Utc::now().timestamp());
            Ok(())
        }

        async fn is_user_invalidated(&self, user_id: &str, issued_at: DateTime<Utc>) -> anyhow::Result<bool> {
            let invalidated = self.invalidated.lock().await;
            Ok(match invalidated.get(user_id) {
                Some(invalidated_at) => issued_at.timestamp() < *invalidated_at,
                None => false,
            })
        }
    }

    #[tokio::test]
    async fn blacklisted_token_is_found_until_it_is_not() {
        let bl = InMemoryBlacklist::new();
        let jti = "abc";
        bl.add(jti, Utc::now() + chrono::Duration::seconds(60)).await.unwrap();
        assert!(bl.check(jti).await.unwrap());
    }

    #[tokio::test]
    async fn already_expired_add_is_a_no_op() {
        let bl = InMemoryBlacklist::new();
        bl.add("abc", Utc::now() - chrono::Duration::seconds(1)).await.unwrap();
        assert!(!bl.check("abc").await.unwrap());
    }

    #[tokio::test]
    async fn mass_invalidation_boundary() {
        let bl = InMemoryBlacklist::new();
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        bl.invalidate_user("u1", 86400).await.unwrap();
        assert!(bl.is_user_invalidated("u1", t0).await.unwrap());
        let future = Utc::now() + chrono::Duration::seconds(10);
        assert!(!bl.is_user_invalidated("u1", future).await.unwrap());
    }
}
