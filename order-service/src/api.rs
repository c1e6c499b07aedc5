use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use shared::{Command, CommandType};
use uuid::Uuid;

use crate::models::Order;
use crate::schema::orders;

type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub producer: FutureProducer,
    pub command_topic: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/refund", post(refund_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub saga_id: Uuid,
    pub status: String,
    pub failure_reason: Option<String>,
}

impl From<Order> for OrderResponse {
    fn from(o: Order) -> Self {
        Self {
            order_id: o.id,
            saga_id: o.saga_id,
            status: o.status,
            failure_reason: o.failure_reason,
        }
    }
}

/// Persists a stub order row, then emits `ProcessPayment` on `saga.commands`
/// keyed by `saga_id` — the trigger that drives the payment core's saga
/// protocol (spec §2 data flow). Order CRUD beyond this stub is out of scope
/// (spec.md §1).
async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<OrderResponse>, (StatusCode, Json<ErrorResponse>)> {
    let order = Order::new(Uuid::new_v4(), request.user_id, request.amount, request.currency);

    let mut conn = state.pool.get().await.map_err(internal_error)?;
    diesel::insert_into(orders::table)
        .values(&order)
        .execute(&mut conn)
        .await
        .map_err(internal_error)?;

    let command = Command {
        saga_id: order.saga_id,
        order_id: order.id,
        command_type: CommandType::ProcessPayment,
        amount: order.amount,
        currency: order.currency.clone(),
        user_id: order.user_id,
        timestamp: Utc::now(),
    };
    publish_command(&state, &command).await.map_err(internal_error)?;

    Ok(Json(order.into()))
}

#[derive(Debug, Deserialize)]
pub struct RefundOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Emits a `RefundPayment` command for the order's saga. A missing reason
/// falls back to a generic one; the payment core's compensation path is
/// idempotent regardless of whether a payment was ever completed (spec §4.4).
async fn refund_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(_request): Json<RefundOrderRequest>,
) -> Result<Json<OrderResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut conn = state.pool.get().await.map_err(internal_error)?;
    let order: Order = orders::table
        .filter(orders::id.eq(id))
        .first(&mut conn)
        .await
        .optional()
        .map_err(internal_error)?
        .ok_or_else(|| not_found("order not found"))?;

    let command = Command {
        saga_id: order.saga_id,
        order_id: order.id,
        command_type: CommandType::RefundPayment,
        amount: order.amount,
        currency: order.currency.clone(),
        user_id: order.user_id,
        timestamp: Utc::now(),
    };
    publish_command(&state, &command).await.map_err(internal_error)?;

    Ok(Json(order.into()))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut conn = state.pool.get().await.map_err(internal_error)?;
    let order: Order = orders::table
        .filter(orders::id.eq(id))
        .first(&mut conn)
        .await
        .optional()
        .map_err(internal_error)?
        .ok_or_else(|| not_found("order not found"))?;
    Ok(Json(order.into()))
}

async fn publish_command(state: &AppState, command: &Command) -> anyhow::Result<()> {
    let json = serde_json::to_string(command)?;
    let key = command.saga_id.to_string();
    let headers = OwnedHeaders::new()
        .insert(Header {
            key: "trace_id",
            value: Some(&Uuid::new_v4().to_string()),
        })
        .insert(Header {
            key: "correlation_id",
            value: Some(&Uuid::new_v4().to_string()),
        })
        .insert(Header {
            key: "timestamp",
            value: Some(&Utc::now().to_rfc3339()),
        });

    let record = FutureRecord::to(&state.command_topic)
        .payload(&json)
        .key(&key)
        .headers(headers);

    state
        .producer
        .send(record, Duration::from_secs(5))
        .await
        .map_err(|(e, _)| anyhow::anyhow!("failed to publish command: {e}"))?;
    Ok(())
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    tracing::error!("order-service request failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: err.to_string() }),
    )
}

fn not_found(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: msg.to_string() }),
    )
}

async fn health_check() -> &'static str {
    "OK"
}
