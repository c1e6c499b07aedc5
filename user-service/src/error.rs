use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password must be at least 8 characters")]
    WeakPassword,
    #[error("name must not be empty")]
    EmptyName,
    #[error("email already registered")]
    EmailExists,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid token")]
    InvalidToken,
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("account is locked, try again later")]
    AccountLocked,
    #[error("user not found")]
    UserNotFound,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
