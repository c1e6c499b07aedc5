use std::sync::Arc;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::blacklist::Blacklist;
use crate::error::{AuthError, Result};
use crate::login_limiter::LoginLimiter;
use crate::models::User;
use crate::repository::UserRepository;
use crate::tokens::{Claims, TokenManager, TokenPair};

const BCRYPT_COST: u32 = 12;
const MIN_PASSWORD_LEN: usize = 8;

pub struct RegisterInput {
    pub email: String,
    pub password: String,
    pub name: String,
}

pub struct LoginOutput {
    pub tokens: TokenPair,
}

/// Register / Login / Logout / ValidateToken / GetUser (C8), composed over
/// the user store (C2-shaped repository), the token manager (C5), the
/// blacklist (C6), and the login limiter (C7).
pub struct AuthService {
    repository: Arc<dyn UserRepository>,
    tokens: Arc<TokenManager>,
    blacklist: Option<Arc<dyn Blacklist>>,
    limiter: Arc<dyn LoginLimiter>,
}

impl AuthService {
    pub fn new(
        repository: Arc<dyn UserRepository>,
        tokens: Arc<TokenManager>,
        blacklist: Option<Arc<dyn Blacklist>>,
        limiter: Arc<dyn LoginLimiter>,
    ) -> Self {
        Self {
            repository,
            tokens,
            blacklist,
            limiter,
        }
    }

    pub async fn register(&self, input: RegisterInput) -> Result<Uuid> {
        if input.password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let hash = bcrypt::hash(&input.password, BCRYPT_COST)
            .map_err(|e| AuthError::Io(anyhow::anyhow!("failed to hash password: {e}")))?;
        let user = User::new(input.name, input.email, hash)?;
        self.repository.create(&user).await?;
        Ok(user.id)
    }

    /// Rejects with `InvalidCredentials` for both unknown email and wrong
    /// password — the same generic outcome, so failed attempts cannot be used
    /// to enumerate registered emails.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutput> {
        if self.limiter.is_locked(email).await {
            return Err(AuthError::AccountLocked);
        }

        let user = match self.repository.try_get_by_email(email).await? {
            Some(user) => user,
            None => {
                let _ = self.limiter.record_failure(email).await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        let matches = bcrypt::verify(password, &user.password)
            .map_err(|e| AuthError::Io(anyhow::anyhow!("failed to verify password: {e}")))?;
        if !matches {
            let _ = self.limiter.record_failure(email).await;
            return Err(AuthError::InvalidCredentials);
        }

        let _ = self.limiter.reset_attempts(email).await;
        let tokens = self.tokens.generate_token_pair(user.id, None)?;
        Ok(LoginOutput { tokens })
    }

    pub async fn logout(&self, access_token: &str) -> Result<()> {
        let claims = self.tokens.validate_token(access_token)?;
        let Some(blacklist) = &self.blacklist else {
            tracing::info!("logout requested with no blacklist configured, degrading gracefully");
            return Ok(());
        };
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .unwrap_or_else(Utc::now);
        blacklist
            .add(&claims.jti, expires_at)
            .await
            .map_err(AuthError::Io)?;
        Ok(())
    }

    pub async fn validate_token(&self, access_token: &str) -> Result<Claims> {
        let mut claims = self.validate_with_blacklist(access_token).await?;
        let user = self.repository.get_by_id(claims.user_id).await?;
        claims.sub = user.email;
        Ok(claims)
    }

    /// Full signature/claim validation, then blacklist probes (§4.6): a
    /// per-token hit or a mass invalidation whose instant postdates `iat`
    /// both reject as revoked.
    async fn validate_with_blacklist(&self, token: &str) -> Result<Claims> {
        let claims = self.tokens.validate_token(token)?;

        if let Some(blacklist) = &self.blacklist {
            if blacklist.check(&claims.jti).await.map_err(AuthError::Io)? {
                return Err(AuthError::TokenRevoked);
            }
            let issued_at = Utc
                .timestamp_opt(claims.iat, 0)
                .single()
                .unwrap_or_else(Utc::now);
            if blacklist
                .is_user_invalidated(&claims.user_id.to_string(), issued_at)
                .await
                .map_err(AuthError::Io)?
            {
                return Err(AuthError::TokenRevoked);
            }
        }

        Ok(claims)
    }

    pub async fn invalidate_user(&self, user_id: Uuid) -> Result<()> {
        let Some(blacklist) = &self.blacklist else {
            return Ok(());
        };
        blacklist
            .invalidate_user(&user_id.to_string(), self.tokens.refresh_ttl().as_secs())
            .await
            .map_err(AuthError::Io)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User> {
        self.repository.get_by_id(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::fake::InMemoryBlacklist;
    use crate::login_limiter::fake::InMemoryLoginLimiter;
    use crate::repository::fake::InMemoryUserRepository;
    use std::time::Duration;

    const PRIVATE_KEY: &[u8] = include_bytes!("../testdata/test_private.pem");
    const PUBLIC_KEY: &[u8] = include_bytes!("../testdata/test_public.pem");

    fn service() -> AuthService {
        let tokens = TokenManager::new(
            Some(PRIVATE_KEY),
            PUBLIC_KEY,
            "user-service".to_string(),
            Duration::from_secs(900),
            Duration::from_secs(86400),
        )
        .unwrap();
        AuthService::new(
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(tokens),
            Some(Arc::new(InMemoryBlacklist::new())),
            Arc::new(InMemoryLoginLimiter::new(5)),
        )
    }

    #[tokio::test]
    async fn register_then_login_succeeds() {
        let svc = service();
        svc.register(RegisterInput {
            email: "ann@example.com".to_string(),
            password: "hunter22".to_string(),
            name: "Ann".to_string(),
        })
        .await
        .unwrap();

        let result = svc.login("ann@example.com", "hunter22").await.unwrap();
        assert!(!result.tokens.access.is_empty());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let svc = service();
        let input = || RegisterInput {
            email: "ann@example.com".to_string(),
            password: "hunter22".to_string(),
            name: "Ann".to_string(),
        };
        svc.register(input()).await.unwrap();
        let err = svc.register(input()).await.unwrap_err();
        assert!(matches!(err, AuthError::EmailExists));
    }

    #[tokio::test]
    async fn wrong_password_is_generic_invalid_credentials() {
        let svc = service();
        svc.register(RegisterInput {
            email: "ann@example.com".to_string(),
            password: "hunter22".to_string(),
            name: "Ann".to_string(),
        })
        .await
        .unwrap();

        let err = svc.login("ann@example.com", "wrong-pass").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn unknown_email_is_also_generic_invalid_credentials() {
        let svc = service();
        let err = svc.login("nobody@example.com", "whatever1").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn lockout_after_five_failures() {
        let svc = service();
        svc.register(RegisterInput {
            email: "ann@example.com".to_string(),
            password: "hunter22".to_string(),
            name: "Ann".to_string(),
        })
        .await
        .unwrap();

        for _ in 0..5 {
            let _ = svc.login("ann@example.com", "wrong-pass").await;
        }
        let err = svc.login("ann@example.com", "hunter22").await.unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked));
    }

    #[tokio::test]
    async fn logout_revokes_the_token() {
        let svc = service();
        svc.register(RegisterInput {
            email: "ann@example.com".to_string(),
            password: "hunter22".to_string(),
            name: "Ann".to_string(),
        })
        .await
        .unwrap();
        let login = svc.login("ann@example.com", "hunter22").await.unwrap();

        svc.logout(&login.tokens.access).await.unwrap();
        let err = svc.validate_with_blacklist(&login.tokens.access).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenRevoked));
    }

    #[tokio::test]
    async fn mass_invalidation_rejects_prior_tokens_only() {
        let svc = service();
        svc.register(RegisterInput {
            email: "ann@example.com".to_string(),
            password: "hunter22".to_string(),
            name: "Ann".to_string(),
        })
        .await
        .unwrap();
        let first = svc.login("ann@example.com", "hunter22").await.unwrap();
        let user = svc.repository.get_by_email("ann@example.com").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        svc.invalidate_user(user.id).await.unwrap();
        let second = svc.login("ann@example.com", "hunter22").await.unwrap();

        assert!(svc
            .validate_with_blacklist(&first.tokens.access)
            .await
            .is_err());
        assert!(svc
            .validate_with_blacklist(&second.tokens.access)
            .await
            .is_ok());
    }
}
