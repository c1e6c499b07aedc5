use thiserror::Error;

/// Stable, enumerated error kinds for the payment domain. Free-form text inside a
/// variant is diagnostic only — callers must match on the variant, not the message.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("payment not found")]
    PaymentNotFound,

    #[error("duplicate payment for idempotency key")]
    DuplicatePayment,

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
