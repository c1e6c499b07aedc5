use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;

/// Registered claims plus the `user_id`/`role` extensions §3 requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub expires_at: chrono::DateTime<Utc>,
}

/// Asymmetric (RS256) token issuance and validation (C5). The encoding key is
/// optional: a deployment that only validates tokens (no issuance) carries a
/// public key file alone.
pub struct TokenManager {
    encoding_key: Option<EncodingKey>,
    decoding_key: DecodingKey,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenManager {
    pub fn new(
        private_key_pem: Option<&[u8]>,
        public_key_pem: &[u8],
        issuer: String,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> anyhow::Result<Self> {
        let encoding_key = private_key_pem
            .map(EncodingKey::from_rsa_pem)
            .transpose()?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)?;
        Ok(Self {
            encoding_key,
            decoding_key,
            issuer,
            access_ttl,
            refresh_ttl,
        })
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Issues an access + refresh pair for `user_id`. Requires an encoding key.
    pub fn generate_token_pair(&self, user_id: Uuid, role: Option<String>) -> Result<TokenPair, AuthError> {
        let encoding_key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Io(anyhow::anyhow!("no signing key configured; cannot issue tokens")))?;

        let now = Utc::now();
        let access_exp = now + chrono::Duration::from_std(self.access_ttl).unwrap();
        let refresh_exp = now + chrono::Duration::from_std(self.refresh_ttl).unwrap();

        let access_claims = Claims {
            sub: user_id.to_string(),
            user_id,
            role: role.clone(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: access_exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let refresh_claims = Claims {
            sub: user_id.to_string(),
            user_id,
            role: None,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: refresh_exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let header = Header::new(Algorithm::RS256);
        let access = encode(&header, &access_claims, encoding_key)
            .map_err(|e| AuthError::Io(anyhow::anyhow!("failed to sign access token: {e}")))?;
        let refresh = encode(&header, &refresh_claims, encoding_key)
            .map_err(|e| AuthError::Io(anyhow::anyhow!("failed to sign refresh token: {e}")))?;

        Ok(TokenPair {
            access,
            refresh,
            expires_at: access_exp,
        })
    }

    /// Verifies signature and standard claims. Algorithms are pinned to RS256
    /// so a token signed with a symmetric algorithm is always rejected
    /// (property 10, algorithm-confusion rejection).
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(data.claims)
    }

    /// Parses `jti` without verifying the signature, so the blacklist can be
    /// probed cheaply before the full validation cost is paid.
    pub fn get_token_id(&self, token: &str) -> Result<String, AuthError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(data.claims.jti)
    }
}
