//! Entry points used by the order placement flow and the webhook endpoint.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use orderflow_core::{DomainError, PermanentOrderId, PricePolicy, StagingId};
use orderflow_orders::{subtotal_of, MetadataPatch, OrderDraft, PaymentLink, PaymentStatus, StagedOrder};

use crate::external::{GatewayError, GatewayEvent, PaymentGateway, PaymentLinkRequest};
use crate::reconciler::{PaymentReconciler, ReconcileOutcome};
use crate::staging::StagingStore;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("could not create payment link: {0}")]
    Gateway(#[from] GatewayError),
}

/// What the customer-facing side may see about a staged order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagingStatus {
    pub status: PaymentStatus,
    pub payment_link: Option<PaymentLink>,
    pub permanent_order_id: Option<PermanentOrderId>,
}

pub struct OrderPipeline {
    staging: Arc<StagingStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<PaymentReconciler>,
    pricing: PricePolicy,
}

impl OrderPipeline {
    pub fn new(
        staging: Arc<StagingStore>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<PaymentReconciler>,
        pricing: PricePolicy,
    ) -> Self {
        Self {
            staging,
            gateway,
            reconciler,
            pricing,
        }
    }

    /// Stage an order and attach a payment link for its total.
    ///
    /// Prices are recomputed from the line items. If the gateway refuses the
    /// link, the staged order is removed again and the error returned.
    pub async fn stage(&self, mut draft: OrderDraft) -> Result<StagedOrder, PipelineError> {
        if draft.items.is_empty() {
            return Err(DomainError::validation("order has no items").into());
        }
        if draft.customer.name.trim().is_empty() {
            return Err(DomainError::validation("customer name is required").into());
        }
        draft.pricing = self.pricing.quote(subtotal_of(&draft.items)?)?;

        let staged = self.staging.put(draft).await;
        let request = PaymentLinkRequest {
            order_ref: staged.id.to_string(),
            amount: staged.pricing.total,
            customer: staged.customer.clone(),
            expires_at: staged.expires_at,
        };

        let link = match self.gateway.create_payment_link(&request).await {
            Ok(link) => link,
            Err(e) => {
                warn!(staging_id = %staged.id, error = %e, "payment link creation failed; unstaging order");
                self.staging.delete(&staged.id).await;
                return Err(e.into());
            }
        };

        info!(staging_id = %staged.id, gateway_id = %link.gateway_id, total = %staged.pricing.total, "order staged");
        let updated = self
            .staging
            .update(&staged.id, MetadataPatch::payment_link(link.clone()).into())
            .await;
        Ok(updated.unwrap_or_else(|| {
            let mut staged = staged;
            staged.metadata.payment_link = Some(link);
            staged
        }))
    }

    pub async fn get_staging_status(&self, id: &StagingId) -> Option<StagingStatus> {
        let order = self.staging.get(id).await?;
        Some(StagingStatus {
            status: order.metadata.payment_status,
            permanent_order_id: order.metadata.permanent_order_id(),
            payment_link: order.metadata.payment_link,
        })
    }

    /// Apply a gateway event. Never fails: the gateway always gets an acknowledgement.
    pub async fn on_gateway_event(&self, event: &GatewayEvent) {
        let outcome = self.reconciler.handle(event).await;
        match &outcome {
            ReconcileOutcome::NotFound => {}
            other => debug!(gateway_id = %event.gateway_id, outcome = ?other, "gateway event reconciled"),
        }
    }

    pub fn staging(&self) -> &Arc<StagingStore> {
        &self.staging
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::{JournalConfig, StagingConfig};
    use crate::journal::RetryJournal;
    use crate::migration::{InMemoryPermanentStore, Migrator};
    use crate::queue::InMemoryMigrationQueue;
    use crate::testing::{draft, FakeGateway, RecordingNotifier};
    use orderflow_core::Money;

    fn pipeline(dir: &TempDir, gateway: Arc<FakeGateway>) -> OrderPipeline {
        let staging = Arc::new(StagingStore::new(StagingConfig {
            dir: dir.path().join("staging"),
            ..StagingConfig::default()
        }));
        let reconciler = PaymentReconciler::new(
            staging.clone(),
            Arc::new(RecordingNotifier::default()),
            Migrator::new(Arc::new(InMemoryPermanentStore::new()), PricePolicy::default()),
            Arc::new(InMemoryMigrationQueue::new(3)),
            Arc::new(RetryJournal::new(&JournalConfig {
                dir: dir.path().join("journal"),
                ..JournalConfig::default()
            })),
        );
        OrderPipeline::new(staging, gateway, Arc::new(reconciler), PricePolicy::default())
    }

    #[tokio::test]
    async fn stage_attaches_payment_link_for_total() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(FakeGateway::default());
        let p = pipeline(&dir, gateway.clone());

        let mut d = draft();
        // Client-side arithmetic is not trusted.
        d.pricing.total = Money::from_cents(5);
        let staged = p.stage(d).await.unwrap();

        assert_eq!(staged.pricing.total, Money::from_cents(2210));
        let link = staged.metadata.payment_link.clone().unwrap();
        assert_eq!(link.gateway_id, "cs_test_1");
        assert_eq!(gateway.requests()[0].amount, Money::from_cents(2210));
        assert_eq!(gateway.requests()[0].order_ref, staged.id.to_string());

        let status = p.get_staging_status(&staged.id).await.unwrap();
        assert_eq!(status.status, PaymentStatus::Pending);
        assert_eq!(status.payment_link, Some(link));
        assert_eq!(status.permanent_order_id, None);
    }

    #[tokio::test]
    async fn gateway_failure_unstages_order() {
        let dir = TempDir::new().unwrap();
        let gateway = Arc::new(FakeGateway::default());
        gateway.set_down(true);
        let p = pipeline(&dir, gateway);

        let err = p.stage(draft()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Gateway(_)));
        assert_eq!(p.staging().count(), 0);
    }

    #[tokio::test]
    async fn invalid_drafts_are_rejected() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir, Arc::new(FakeGateway::default()));

        let mut empty = draft();
        empty.items.clear();
        assert!(matches!(p.stage(empty).await, Err(PipelineError::Invalid(_))));

        let mut unpriced = draft();
        unpriced.items[0].unit_price = None;
        assert!(matches!(p.stage(unpriced).await, Err(PipelineError::Invalid(_))));
        assert_eq!(p.staging().count(), 0);
    }

    #[tokio::test]
    async fn unknown_id_has_no_status() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir, Arc::new(FakeGateway::default()));
        let id: StagingId = "TEMP-1-0001".parse().unwrap();
        assert!(p.get_staging_status(&id).await.is_none());
    }
}
