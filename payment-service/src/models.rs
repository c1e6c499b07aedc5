use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PaymentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "COMPLETED" => PaymentStatus::Completed,
            "FAILED" => PaymentStatus::Failed,
            "REFUNDED" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }
}

/// The domain record backing a row in `payments`. Status is a proper enum here;
/// `DbPayment` is the `Queryable`/`Insertable` shape diesel talks to the `Varchar`
/// column through, the same split the teacher uses between `SagaTransaction` and
/// `DbSagaTransaction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: String,
    pub failure_reason: Option<String>,
    pub refund_id: Option<Uuid>,
    pub refund_reason: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(primary_key(id))]
pub struct DbPayment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    pub failure_reason: Option<String>,
    pub refund_id: Option<Uuid>,
    pub refund_reason: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewDbPayment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `Update` targets only these columns (§4.2): status + terminal-state metadata +
/// `updated_at`. `created_at` and `idempotency_key` are immutable after insert.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::payments)]
pub struct PaymentChangeset {
    pub status: String,
    pub failure_reason: Option<String>,
    pub refund_id: Option<Uuid>,
    pub refund_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Payment> for NewDbPayment {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id,
            order_id: p.order_id,
            saga_id: p.saga_id,
            user_id: p.user_id,
            amount: p.amount,
            currency: p.currency,
            status: p.status.as_str().to_string(),
            payment_method: p.payment_method,
            idempotency_key: p.idempotency_key,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

impl From<DbPayment> for Payment {
    fn from(row: DbPayment) -> Self {
        Self {
            id: row.id,
            order_id: row.order_id,
            saga_id: row.saga_id,
            user_id: row.user_id,
            amount: row.amount,
            currency: row.currency,
            status: PaymentStatus::parse(&row.status),
            payment_method: row.payment_method,
            failure_reason: row.failure_reason,
            refund_id: row.refund_id,
            refund_reason: row.refund_reason,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl Payment {
    /// Construct a fresh PENDING payment keyed by `saga_id`, validating §3 invariants.
    pub fn new(
        order_id: Uuid,
        saga_id: Uuid,
        user_id: Uuid,
        amount: i64,
        currency: String,
        payment_method: String,
    ) -> Result<Self, PaymentError> {
        if order_id.is_nil() || saga_id.is_nil() || user_id.is_nil() {
            return Err(PaymentError::InvalidAmount(
                "order_id, saga_id and user_id must be set".to_string(),
            ));
        }
        if amount <= 0 {
            return Err(PaymentError::InvalidAmount(format!(
                "amount must be positive, got {amount}"
            )));
        }
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(PaymentError::InvalidAmount(format!(
                "currency must be ISO 4217 (3 ASCII uppercase letters), got {currency}"
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            order_id,
            saga_id,
            user_id,
            amount,
            currency,
            status: PaymentStatus::Pending,
            payment_method,
            failure_reason: None,
            refund_id: None,
            refund_reason: None,
            idempotency_key: saga_id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn changeset(&self) -> PaymentChangeset {
        PaymentChangeset {
            status: self.status.as_str().to_string(),
            failure_reason: self.failure_reason.clone(),
            refund_id: self.refund_id,
            refund_reason: self.refund_reason.clone(),
            updated_at: self.updated_at,
        }
    }

    pub fn can_transition_to(&self, new: PaymentStatus) -> bool {
        matches!(
            (self.status, new),
            (PaymentStatus::Pending, PaymentStatus::Completed)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Completed, PaymentStatus::Refunded)
        )
    }

    fn transition_to(&mut self, new: PaymentStatus) -> Result<(), PaymentError> {
        if !self.can_transition_to(new) {
            return Err(PaymentError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", new),
            });
        }
        self.status = new;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), PaymentError> {
        self.transition_to(PaymentStatus::Completed)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), PaymentError> {
        self.transition_to(PaymentStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn refund(&mut self, refund_id: Uuid, reason: impl Into<String>) -> Result<(), PaymentError> {
        self.transition_to(PaymentStatus::Refunded)?;
        self.refund_id = Some(refund_id);
        self.refund_reason = Some(reason.into());
        Ok(())
    }
}
