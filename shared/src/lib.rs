use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const COMMANDS_TOPIC: &str = "saga.commands";
pub const REPLIES_TOPIC: &str = "saga.replies";
pub const DLQ_TOPIC: &str = "dlq.saga";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub saga_id: Uuid,
    pub order_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub amount: i64,
    pub currency: String,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    ProcessPayment,
    RefundPayment,
    /// Any `type` value this workspace doesn't recognize. A well-formed
    /// envelope with an unrecognized type is not malformed JSON (§4.4 step 3)
    /// — it still deserializes and gets a FAILED reply, rather than falling
    /// into the no-reply poison-message path.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub saga_id: Uuid,
    pub order_id: Uuid,
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    Success,
    Failed,
}

impl CommandReply {
    pub fn success(saga_id: Uuid, order_id: Uuid, payment_id: Option<Uuid>) -> Self {
        Self {
            saga_id,
            order_id,
            status: ReplyStatus::Success,
            payment_id,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(saga_id: Uuid, order_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            saga_id,
            order_id,
            status: ReplyStatus::Failed,
            payment_id: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Headers every outbound message on `saga.commands` / `saga.replies` / `dlq.saga` carries.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub trace_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Derive a child context that keeps the correlation id but mints a fresh trace id,
    /// the way correlation is expected to propagate across a saga's hops.
    pub fn child(&self) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            correlation_id: self.correlation_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_success_has_no_error() {
        let r = CommandReply::success(Uuid::new_v4(), Uuid::new_v4(), Some(Uuid::new_v4()));
        assert_eq!(r.status, ReplyStatus::Success);
        assert!(r.error.is_none());
    }

    #[test]
    fn reply_failed_has_no_payment_id() {
        let r = CommandReply::failed(Uuid::new_v4(), Uuid::new_v4(), "boom");
        assert_eq!(r.status, ReplyStatus::Failed);
        assert!(r.payment_id.is_none());
        assert_eq!(r.error.as_deref(), Some("boom"));
    }

    #[test]
    fn command_type_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&CommandType::ProcessPayment).unwrap();
        assert_eq!(json, "\"PROCESS_PAYMENT\"");
    }

    #[test]
    fn unrecognized_command_type_deserializes_as_unknown() {
        let parsed: CommandType = serde_json::from_str("\"CANCEL_ORDER\"").unwrap();
        assert_eq!(parsed, CommandType::Unknown);
    }
}
