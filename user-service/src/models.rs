use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AuthError;
use crate::schema::users;

/// Domain record for `users` (§3). `password` always holds a bcrypt hash,
/// never plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Constructs a new user, validating the invariants Register (C8) requires:
    /// non-empty name and a syntactically plausible email. Password strength is
    /// checked by the caller before hashing, since this type only ever holds a hash.
    pub fn new(name: String, email: String, password_hash: String) -> Result<Self, AuthError> {
        if name.trim().is_empty() {
            return Err(AuthError::EmptyName);
        }
        if !is_valid_email(&email) {
            return Err(AuthError::InvalidEmail);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            email,
            password: password_hash,
            created_at: now,
            updated_at: now,
        })
    }
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct DbUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewDbUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for NewDbUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            name: u.name,
            email: u.email,
            password: u.password,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

impl From<DbUser> for User {
    fn from(row: DbUser) -> Self {
        Self {
            id: row.id,
            name: row.name,
            email: row.email,
            password: row.password,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let err = User::new("  ".to_string(), "a@b.com".to_string(), "hash".to_string())
            .unwrap_err();
        assert!(matches!(err, AuthError::EmptyName));
    }

    #[test]
    fn rejects_malformed_email() {
        let err = User::new("Ann".to_string(), "not-an-email".to_string(), "hash".to_string())
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidEmail));
    }

    #[test]
    fn accepts_well_formed_input() {
        let user = User::new("Ann".to_string(), "ann@example.com".to_string(), "hash".to_string())
            .unwrap();
        assert_eq!(user.email, "ann@example.com");
    }
}
