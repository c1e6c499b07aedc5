use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stub order row (SPEC_FULL §2): just enough persistence to drive the
/// saga command/reply protocol end-to-end. Full order CRUD is out of scope
/// (spec.md §1).
#[derive(Debug, Clone, Queryable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub saga_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(saga_id: Uuid, user_id: Uuid, amount: i64, currency: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            saga_id,
            user_id,
            amount,
            currency,
            status: "PENDING".to_string(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
