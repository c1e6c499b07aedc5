use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::AuthError;
use crate::models::{DbUser, NewDbUser, User};
use crate::schema::users;

pub type DbPool = Pool<AsyncPgConnection>;

/// The user store capability (§3 `users` table), a trait for the same reason
/// the payment repository is one: the auth service is exercised in tests
/// against an in-memory fake.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &User) -> Result<(), AuthError>;
    async fn get_by_id(&self, id: Uuid) -> Result<User, AuthError>;
    async fn get_by_email(&self, email: &str) -> Result<User, AuthError>;
    async fn try_get_by_email(&self, email: &str) -> Result<Option<User>, AuthError>;
}

pub struct PostgresUserRepository {
    pool: DbPool,
}

impl PostgresUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

macro_rules! conn_or_err {
    ($self:expr) => {
        $self
            .pool
            .get()
            .await
            .map_err(|e| AuthError::Io(anyhow::anyhow!("failed to acquire db connection: {e}")))?
    };
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create(&self, user: &User) -> Result<(), AuthError> {
        let mut conn = conn_or_err!(self);
        let new_row: NewDbUser = user.clone().into();

        diesel::insert_into(users::table)
            .values(&new_row)
            .execute(&mut conn)
            .await
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    AuthError::EmailExists
                }
                other => AuthError::Io(anyhow::anyhow!("failed to insert user: {other}")),
            })?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<User, AuthError> {
        let mut conn = conn_or_err!(self);
        let row = users::table
            .filter(users::id.eq(id))
            .first::<DbUser>(&mut conn)
            .await
            .optional()
            .map_err(|e| AuthError::Io(anyhow::anyhow!("failed to load user: {e}")))?;
        row.map(User::from).ok_or(AuthError::UserNotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User, AuthError> {
        self.try_get_by_email(email)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    async fn try_get_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let mut conn = conn_or_err!(self);
        let row = users::table
            .filter(users::email.eq(email))
            .first::<DbUser>(&mut conn)
            .await
            .optional()
            .map_err(|e| AuthError::Io(anyhow::anyhow!("failed to load user: {e}")))?;
        Ok(row.map(User::from))
    }
}
