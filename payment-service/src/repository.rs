use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::{DbPayment, NewDbPayment, Payment, PaymentChangeset};
use crate::schema::payments;

pub type DbPool = Pool<AsyncPgConnection>;

/// The payment store capability (C2). A trait so the saga command handler and the
/// payment service can be exercised against an in-memory fake in tests, the same
/// role the teacher gives its broker producer as an injectable capability.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn create(&self, payment: &Payment) -> Result<(), PaymentError>;
    async fn get_by_id(&self, id: Uuid) -> Result<Payment, PaymentError>;
    async fn get_by_saga_id(&self, saga_id: Uuid) -> Result<Payment, PaymentError>;
    async fn try_get_by_saga_id(&self, saga_id: Uuid) -> Result<Option<Payment>, PaymentError>;
    async fn update(&self, payment: &Payment) -> Result<(), PaymentError>;
    async fn get_stuck_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, PaymentError>;
}

pub struct PostgresPaymentRepository {
    pool: DbPool,
}

impl PostgresPaymentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

}

/// Maps a pool-acquisition failure into the infrastructure error kind; the
/// explicit helper exists only because every operation below needs it.
macro_rules! conn_or_err {
    ($self:expr) => {
        $self
            .pool
            .get()
            .await
            .map_err(|e| PaymentError::Io(anyhow::anyhow!("failed to acquire db connection: {e}")))?
    };
}

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    async fn create(&self, payment: &Payment) -> Result<(), PaymentError> {
        let mut conn = conn_or_err!(self);
        let new_row: NewDbPayment = payment.clone().into();

        diesel::insert_into(payments::table)
            .values(&new_row)
            .execute(&mut conn)
            .await
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    PaymentError::DuplicatePayment
                }
                other => PaymentError::Io(anyhow::anyhow!("failed to insert payment: {other}")),
            })?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Payment, PaymentError> {
        let mut conn = conn_or_err!(self);
        let row = payments::table
            .filter(payments::id.eq(id))
            .first::<DbPayment>(&mut conn)
            .await
            .optional()
            .map_err(|e| PaymentError::Io(anyhow::anyhow!("failed to load payment: {e}")))?;
        row.map(Payment::from).ok_or(PaymentError::PaymentNotFound)
    }

    async fn get_by_saga_id(&self, saga_id: Uuid) -> Result<Payment, PaymentError> {
        self.try_get_by_saga_id(saga_id)
            .await?
            .ok_or(PaymentError::PaymentNotFound)
    }

    async fn try_get_by_saga_id(&self, saga_id: Uuid) -> Result<Option<Payment>, PaymentError> {
        let mut conn = conn_or_err!(self);
        let row = payments::table
            .filter(payments::saga_id.eq(saga_id))
            .first::<DbPayment>(&mut conn)
            .await
            .optional()
            .map_err(|e| PaymentError::Io(anyhow::anyhow!("failed to load payment: {e}")))?;
        Ok(row.map(Payment::from))
    }

    async fn update(&self, payment: &Payment) -> Result<(), PaymentError> {
        let mut conn = conn_or_err!(self);
        let changeset: PaymentChangeset = payment.changeset();

        let updated_rows = diesel::update(payments::table.filter(payments::id.eq(payment.id)))
            .set(&changeset)
            .execute(&mut conn)
            .await
            .map_err(|e| PaymentError::Io(anyhow::anyhow!("failed to update payment: {e}")))?;

        if updated_rows == 0 {
            return Err(PaymentError::PaymentNotFound);
        }
        Ok(())
    }

    async fn get_stuck_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, PaymentError> {
        let mut conn = conn_or_err!(self);
        let rows = payments::table
            .filter(payments::status.eq("PENDING"))
            .filter(payments::created_at.lt(older_than))
            .order(payments::created_at.asc())
            .limit(limit)
            .load::<DbPayment>(&mut conn)
            .await
            .map_err(|e| PaymentError::Io(anyhow::anyhow!("failed to load stuck payments: {e}")))?;
        Ok(rows.into_iter().map(Payment::from).collect())
    }
}
