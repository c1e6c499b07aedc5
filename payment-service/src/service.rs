use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::{Payment, PaymentStatus};
use crate::repository::PaymentRepository;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const STUCK_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const STUCK_BATCH_LIMIT: i64 = 100;
const DECLINE_MODULUS: i64 = 666;

/// The best-effort idempotency probe (§9 "best-effort idempotency cache"): a
/// latency optimization only, never the correctness mechanism. Correctness rests
/// on the unique index `PaymentRepository::create` enforces. Failures of this
/// capability are logged and ignored by the caller.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    /// Set `key` to `value` with `ttl`, but only if absent. Returns true if this
    /// call won the race and set the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;
    /// Best-effort overwrite, used once the real payment id is known.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
}

pub struct ProcessPaymentInput {
    pub saga_id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct ProcessPaymentOutput {
    pub payment_id: Uuid,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub already_exists: bool,
}

pub struct PaymentService {
    repository: Arc<dyn PaymentRepository>,
    idempotency: Arc<dyn IdempotencyCache>,
}

impl PaymentService {
    pub fn new(repository: Arc<dyn PaymentRepository>, idempotency: Arc<dyn IdempotencyCache>) -> Self {
        Self { repository, idempotency }
    }

    /// Idempotent ProcessPayment (§4.3). Preserves exactly-one-effect per `saga_id`.
    pub async fn process_payment(
        &self,
        input: ProcessPaymentInput,
    ) -> Result<ProcessPaymentOutput, PaymentError> {
        let idempotency_key = format!("payment:idempotency:{}", input.saga_id);

        // Step 1: fast idempotency probe. A store failure here is logged and ignored;
        // the unique index on `create` below is the authoritative check.
        match self
            .idempotency
            .set_if_absent(&idempotency_key, "processing", IDEMPOTENCY_TTL)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                if let Some(existing) = self.repository.try_get_by_saga_id(input.saga_id).await? {
                    return Ok(ProcessPaymentOutput {
                        payment_id: existing.id,
                        success: matches!(existing.status, PaymentStatus::Completed),
                        failure_reason: existing.failure_reason,
                        already_exists: true,
                    });
                }
                // Key existed but no row yet (racing writer hasn't inserted); fall through
                // to attempt our own insert, which the unique index will arbitrate.
            }
            Err(e) => {
                warn!("idempotency cache probe failed, falling back to the store: {e}");
            }
        }

        // Step 2/3: construct + insert, collapsing a lost race via DuplicatePayment.
        let mut payment = Payment::new(
            input.order_id,
            input.saga_id,
            input.user_id,
            input.amount,
            input.currency,
            "simulated".to_string(),
        )?;

        match self.repository.create(&payment).await {
            Ok(()) => {}
            Err(PaymentError::DuplicatePayment) => {
                let existing = self.repository.get_by_saga_id(input.saga_id).await?;
                return Ok(ProcessPaymentOutput {
                    payment_id: existing.id,
                    success: matches!(existing.status, PaymentStatus::Completed),
                    failure_reason: existing.failure_reason,
                    already_exists: true,
                });
            }
            Err(e) => return Err(e),
        }

        // Step 4: simulate processing. Implementations swap this for a real provider
        // call but must preserve this interface.
        let failure_reason = simulate_processing(payment.amount);

        // Step 5: transition + persist.
        match &failure_reason {
            Some(reason) => payment.fail(reason.clone())?,
            None => payment.complete()?,
        }
        self.repository.update(&payment).await?;

        // Step 6: best-effort overwrite of the idempotency key with the real id.
        if let Err(e) = self
            .idempotency
            .set(&idempotency_key, &payment.id.to_string(), IDEMPOTENCY_TTL)
            .await
        {
            warn!("failed to overwrite idempotency cache key: {e}");
        }

        Ok(ProcessPaymentOutput {
            payment_id: payment.id,
            success: failure_reason.is_none(),
            failure_reason,
            already_exists: false,
        })
    }

    /// RefundPayment (§4.3). Caller (the saga command handler) is responsible for
    /// converting "no such payment" into a SUCCESS reply — compensation must be
    /// idempotent (§4.4).
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<Payment, PaymentError> {
        let mut payment = self.repository.get_by_id(payment_id).await?;
        payment.refund(Uuid::new_v4(), reason)?;
        self.repository.update(&payment).await?;
        Ok(payment)
    }

    /// RecoverStuckPayments (§4.3). Individual failures are logged and skipped; the
    /// batch continues. Returns the count recovered.
    pub async fn recover_stuck_payments(&self) -> Result<usize, PaymentError> {
        let threshold = Utc::now() - chrono::Duration::from_std(STUCK_THRESHOLD).unwrap();
        let stuck = self
            .repository
            .get_stuck_pending(threshold, STUCK_BATCH_LIMIT)
            .await?;

        let mut recovered = 0usize;
        for mut payment in stuck {
            match payment.fail("processing timeout") {
                Ok(()) => match self.repository.update(&payment).await {
                    Ok(()) => {
                        recovered += 1;
                        info!("recovered stuck payment {}", payment.id);
                    }
                    Err(e) => warn!("failed to persist recovered payment {}: {e}", payment.id),
                },
                Err(e) => warn!("payment {} no longer PENDING, skipping: {e}", payment.id),
            }
        }
        Ok(recovered)
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Payment, PaymentError> {
        self.repository.get_by_id(id).await
    }

    pub async fn get_payment_by_saga_id(&self, saga_id: Uuid) -> Result<Payment, PaymentError> {
        self.repository.get_by_saga_id(saga_id).await
    }

    pub async fn try_get_payment_by_saga_id(
        &self,
        saga_id: Uuid,
    ) -> Result<Option<Payment>, PaymentError> {
        self.repository.try_get_by_saga_id(saga_id).await
    }
}

/// The deterministic, testable decline rule this spec defines in place of a real
/// provider integration (§4.3 step 4, property 3).
fn simulate_processing(amount: i64) -> Option<String> {
    if amount > 0 && amount % DECLINE_MODULUS == 0 {
        Some("insufficient funds".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fake::InMemoryPaymentRepository;
    use std::collections::HashMap;
    use std::time::Instant;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct InMemoryIdempotencyCache {
        entries: AsyncMutex<HashMap<String, (String, Instant, Duration)>>,
    }

    #[async_trait]
    impl IdempotencyCache for InMemoryIdempotencyCache {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
            let mut entries = self.entries.lock().await;
            if let Some((_, set_at, entry_ttl)) = entries.get(key) {
                if set_at.elapsed() < *entry_ttl {
                    return Ok(false);
                }
            }
            entries.insert(key.to_string(), (value.to_string(), Instant::now(), ttl));
            Ok(true)
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            self.entries
                .lock()
                .await
                .insert(key.to_string(), (value.to_string(), Instant::now(), ttl));
            Ok(())
        }
    }

    fn service() -> PaymentService {
        PaymentService::new(
            Arc::new(InMemoryPaymentRepository::new()),
            Arc::new(InMemoryIdempotencyCache::default()),
        )
    }

    fn input(saga_id: Uuid, amount: i64) -> ProcessPaymentInput {
        ProcessPaymentInput {
            saga_id,
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount,
            currency: "RUB".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_amount_completes() {
        let svc = service();
        let out = svc.process_payment(input(Uuid::new_v4(), 10_000)).await.unwrap();
        assert!(out.success);
        assert!(out.failure_reason.is_none());
        assert!(!out.already_exists);
    }

    #[tokio::test]
    async fn multiple_of_666_declines() {
        let svc = service();
        let out = svc.process_payment(input(Uuid::new_v4(), 6_660)).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.failure_reason.as_deref(), Some("insufficient funds"));
    }

    #[tokio::test]
    async fn duplicate_command_is_idempotent() {
        let svc = service();
        let saga_id = Uuid::new_v4();
        let first = svc.process_payment(input(saga_id, 10_000)).await.unwrap();
        let second = svc.process_payment(input(saga_id, 10_000)).await.unwrap();
        assert_eq!(first.payment_id, second.payment_id);
        assert!(second.already_exists);
        assert!(!first.already_exists);
    }

    #[tokio::test]
    async fn refund_of_completed_payment_succeeds() {
        let svc = service();
        let saga_id = Uuid::new_v4();
        let processed = svc.process_payment(input(saga_id, 10_000)).await.unwrap();
        let refunded = svc.refund_payment(processed.payment_id, "customer request").await.unwrap();
        assert!(matches!(refunded.status, PaymentStatus::Refunded));
    }

    #[tokio::test]
    async fn recover_stuck_payments_fails_old_pending_rows() {
        let repo = Arc::new(InMemoryPaymentRepository::new());
        let mut stuck_payment = Payment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            1_000,
            "RUB".to_string(),
            "simulated".to_string(),
        )
        .unwrap();
        stuck_payment.created_at = Utc::now() - chrono::Duration::minutes(6);
        repo.create(&stuck_payment).await.unwrap();

        let svc = PaymentService::new(repo.clone(), Arc::new(InMemoryIdempotencyCache::default()));
        let recovered = svc.recover_stuck_payments().await.unwrap();
        assert_eq!(recovered, 1);

        let reloaded = repo.get_by_id(stuck_payment.id).await.unwrap();
        assert!(matches!(reloaded.status, PaymentStatus::Failed));
        assert_eq!(reloaded.failure_reason.as_deref(), Some("processing timeout"));
    }
}
