use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use shared::{CommandReply, ReplyStatus};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::schema::orders;

type DbPool = Pool<AsyncPgConnection>;

/// Consumes `saga.replies` and applies the outcome to the stub order row
/// (SPEC_FULL §2). Mirrors the teacher's `SagaManager::run_reply_handler`
/// loop shape, narrowed to this spec's saga protocol: there is no
/// multi-step saga to advance here, just a terminal reply to apply.
pub struct ReplyHandler {
    pool: DbPool,
}

impl ReplyHandler {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn run(&self, consumer: StreamConsumer, mut shutdown: watch::Receiver<bool>) {
        let mut message_stream = consumer.stream();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reply handler shutting down");
                        break;
                    }
                }
                message = message_stream.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(m) => {
                            if let Some(Ok(json_str)) = m.payload_view::<str>() {
                                match serde_json::from_str::<CommandReply>(json_str) {
                                    Ok(reply) => {
                                        if let Err(e) = self.apply_reply(&reply).await {
                                            error!("failed to apply saga reply: {e}");
                                        }
                                    }
                                    Err(e) => warn!("malformed reply payload, skipping: {e}"),
                                }
                            }
                            if let Err(e) = consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async) {
                                error!("failed to commit reply offset: {e}");
                            }
                        }
                        Err(e) => error!("error receiving reply message: {e}"),
                    }
                }
            }
        }
    }

    async fn apply_reply(&self, reply: &CommandReply) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;

        let (status, failure_reason) = match reply.status {
            ReplyStatus::Success => ("COMPLETED", None),
            ReplyStatus::Failed => ("FAILED", reply.error.clone()),
        };

        let updated_rows = diesel::update(orders::table.filter(orders::saga_id.eq(reply.saga_id)))
            .set((
                orders::status.eq(status),
                orders::failure_reason.eq(failure_reason),
                orders::updated_at.eq(chrono::Utc::now()),
            ))
            .execute(&mut conn)
            .await?;

        if updated_rows == 0 {
            warn!("reply for unknown saga {}: no matching order", reply.saga_id);
        } else {
            info!("order for saga {} updated to {}", reply.saga_id, status);
        }
        Ok(())
    }
}
