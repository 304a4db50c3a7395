//! Payment reconciliation: gateway events → staged order state → side effects.
//!
//! `paid` is sticky. Side effects are gated on metadata flags that are
//! claimed inside one atomic staging-store modification, so a duplicated or
//! concurrent "paid" event notifies at most once and migrates at most once.
//! Nothing in here returns an error to the caller: every failure is logged
//! and, for migration, handed to the durable queue or the retry journal.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use orderflow_core::{PermanentOrderId, QueueItemId, StagingId};
use orderflow_orders::{
    MetadataPatch, NotificationState, PaymentStatus, StagedOrder, TransitionCheck,
};

use crate::config::PipelineConfig;
use crate::external::{GatewayEvent, Notification, Notifier, Template};
use crate::journal::RetryJournal;
use crate::migration::Migrator;
use crate::queue::MigrationQueue;
use crate::staging::StagingStore;

/// Result of a best-effort notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed(String),
    /// Already sent, being sent by another invocation, or no destination.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    AlreadyMigrated(PermanentOrderId),
    Migrated(PermanentOrderId),
    /// A queue item from an earlier event is still responsible for it.
    AlreadyQueued(QueueItemId),
    /// Another invocation holds the migration claim.
    InProgress,
    Queued(QueueItemId),
    Journaled,
    /// Neither the queue nor the journal accepted the order.
    Unrecorded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No staged order matched the event.
    NotFound,
    /// The event would regress an order that is already paid.
    Stale { staging_id: StagingId },
    /// The order already had this status; nothing changed.
    Duplicate { staging_id: StagingId, status: PaymentStatus },
    Failed { staging_id: StagingId },
    Expired { staging_id: StagingId },
    Paid {
        staging_id: StagingId,
        /// False when this event re-delivered an earlier "paid".
        newly_paid: bool,
        kitchen: Delivery,
        receipt: Delivery,
        migration: MigrationStep,
    },
}

/// Flags claimed atomically while marking an order paid.
struct PaidClaims {
    newly_paid: bool,
    kitchen: bool,
    receipt: bool,
    migrate: bool,
}

pub struct PaymentReconciler {
    staging: Arc<StagingStore>,
    notifier: Arc<dyn Notifier>,
    migrator: Migrator,
    queue: Arc<dyn MigrationQueue>,
    journal: Arc<RetryJournal>,
    default_intake_email: Option<String>,
    migration_claim_ttl: Duration,
}

impl PaymentReconciler {
    pub fn new(
        staging: Arc<StagingStore>,
        notifier: Arc<dyn Notifier>,
        migrator: Migrator,
        queue: Arc<dyn MigrationQueue>,
        journal: Arc<RetryJournal>,
    ) -> Self {
        Self {
            migrator: migrator.with_staging(staging.clone()),
            staging,
            notifier,
            queue,
            journal,
            default_intake_email: None,
            migration_claim_ttl: Duration::minutes(10),
        }
    }

    pub fn with_default_intake_email(mut self, email: Option<String>) -> Self {
        self.default_intake_email = email;
        self
    }

    /// Apply the process configuration: kitchen fallback address and claim
    /// lifetime (the queue's stale-claim timeout).
    pub fn with_config(self, config: &PipelineConfig) -> Self {
        self.with_default_intake_email(config.default_intake_email.clone())
            .with_migration_claim_ttl(config.queue.stale_claim_after)
    }

    /// How long a direct migration claim blocks other invocations before it
    /// is considered abandoned.
    pub fn with_migration_claim_ttl(mut self, ttl: std::time::Duration) -> Self {
        if let Ok(ttl) = Duration::from_std(ttl) {
            self.migration_claim_ttl = ttl;
        }
        self
    }

    pub async fn handle(&self, event: &GatewayEvent) -> ReconcileOutcome {
        let Some(staging_id) = self.locate(event).await else {
            warn!(
                gateway_id = %event.gateway_id,
                staging_ref = ?event.staging_ref,
                kind = ?event.kind,
                "gateway event matches no staged order; ignoring"
            );
            return ReconcileOutcome::NotFound;
        };

        match event.kind.target_status() {
            PaymentStatus::Paid => self.mark_paid(staging_id).await,
            other => self.mark_unpaid(staging_id, other, event.failure_reason.clone()).await,
        }
    }

    /// Payment-link id, then the echoed staging id, then the gateway id read as a staging id.
    async fn locate(&self, event: &GatewayEvent) -> Option<StagingId> {
        if let Some(order) = self.staging.find_by_payment_link(&event.gateway_id) {
            return Some(order.id);
        }
        let candidates = event
            .staging_ref
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(event.gateway_id.as_str()));
        for candidate in candidates {
            let Ok(id) = candidate.parse::<StagingId>() else {
                continue;
            };
            if self.staging.get(&id).await.is_some() {
                return Some(id);
            }
        }
        None
    }

    async fn mark_unpaid(
        &self,
        staging_id: StagingId,
        next: PaymentStatus,
        reason: Option<String>,
    ) -> ReconcileOutcome {
        let modified = self
            .staging
            .modify(&staging_id, |order| {
                let check = order.metadata.payment_status.check_transition(next);
                if check == TransitionCheck::Apply {
                    order.metadata.payment_status = next;
                    if next == PaymentStatus::Failed {
                        order.metadata.payment_failure_reason = reason;
                    }
                }
                (check, order.metadata.payment_status)
            })
            .await;

        match modified {
            None => ReconcileOutcome::NotFound,
            Some((_, (TransitionCheck::Stale, current))) => {
                info!(staging_id = %staging_id, %current, attempted = %next, "ignoring stale payment event");
                ReconcileOutcome::Stale { staging_id }
            }
            Some((_, (TransitionCheck::Duplicate, status))) => {
                debug!(staging_id = %staging_id, %status, "duplicate payment event");
                ReconcileOutcome::Duplicate { staging_id, status }
            }
            Some((_, (TransitionCheck::Apply, _))) => {
                info!(staging_id = %staging_id, status = %next, "payment status updated");
                match next {
                    PaymentStatus::Expired => ReconcileOutcome::Expired { staging_id },
                    _ => ReconcileOutcome::Failed { staging_id },
                }
            }
        }
    }

    async fn mark_paid(&self, staging_id: StagingId) -> ReconcileOutcome {
        let now = Utc::now();
        let has_fallback_intake = self.default_intake_email.is_some();
        let claim_ttl = self.migration_claim_ttl;
        let modified = self
            .staging
            .modify(&staging_id, |order| {
                let meta = &mut order.metadata;
                let newly_paid = meta.payment_status.check_transition(PaymentStatus::Paid)
                    == TransitionCheck::Apply;
                if newly_paid {
                    meta.payment_status = PaymentStatus::Paid;
                    meta.paid_at = Some(now);
                }

                let migrate = meta.migration_claimable(now, claim_ttl);
                if migrate {
                    meta.migration_claimed_at = Some(now);
                }

                let has_intake = order.restaurant.intake_email.is_some() || has_fallback_intake;
                let kitchen = has_intake && order.metadata.kitchen_notification.is_claimable();
                if kitchen {
                    order.metadata.kitchen_notification = NotificationState::Sending { since: now };
                }
                let receipt = order.customer.email.is_some()
                    && order.metadata.receipt_notification.is_claimable();
                if receipt {
                    order.metadata.receipt_notification = NotificationState::Sending { since: now };
                }
                PaidClaims {
                    newly_paid,
                    kitchen,
                    receipt,
                    migrate,
                }
            })
            .await;

        let Some((order, claims)) = modified else {
            return ReconcileOutcome::NotFound;
        };
        if claims.newly_paid {
            info!(staging_id = %staging_id, total = %order.pricing.total, "order paid");
        } else {
            debug!(staging_id = %staging_id, "order was already paid");
        }

        if claims.newly_paid && self.intake_address(&order).is_none() {
            warn!(
                staging_id = %staging_id,
                restaurant = %order.restaurant.name,
                "no kitchen intake address configured; kitchen not notified"
            );
        }
        let kitchen = if claims.kitchen {
            self.notify_kitchen(&order).await
        } else {
            Delivery::Skipped
        };
        let receipt = if claims.receipt {
            self.send_receipt(&order).await
        } else {
            Delivery::Skipped
        };
        let migration = if claims.migrate {
            self.ensure_migrated(&order).await
        } else if let Some(id) = order.metadata.permanent_order_id() {
            MigrationStep::AlreadyMigrated(id)
        } else if let Some(id) = order.metadata.queue_item_id {
            MigrationStep::AlreadyQueued(id)
        } else {
            MigrationStep::InProgress
        };

        ReconcileOutcome::Paid {
            staging_id,
            newly_paid: claims.newly_paid,
            kitchen,
            receipt,
            migration,
        }
    }

    fn intake_address(&self, order: &StagedOrder) -> Option<String> {
        order
            .restaurant
            .intake_email
            .clone()
            .or_else(|| self.default_intake_email.clone())
    }

    async fn notify_kitchen(&self, order: &StagedOrder) -> Delivery {
        let Some(destination) = self.intake_address(order) else {
            return Delivery::Skipped;
        };

        let notification = Notification {
            destination,
            template: Template::KitchenOrder,
            data: json!({
                "staging_id": order.id,
                "restaurant": order.restaurant.name,
                "customer": order.customer,
                "items": order.items,
                "pricing": order.pricing,
                "paid_at": order.metadata.paid_at,
            }),
        };
        self.deliver(order, notification).await
    }

    async fn send_receipt(&self, order: &StagedOrder) -> Delivery {
        let Some(destination) = order.customer.email.clone() else {
            return Delivery::Skipped;
        };
        let notification = Notification {
            destination,
            template: Template::PaymentReceipt,
            data: json!({
                "staging_id": order.id,
                "customer_name": order.customer.name,
                "restaurant": order.restaurant.name,
                "items": order.items,
                "pricing": order.pricing,
                "paid_at": order.metadata.paid_at,
            }),
        };
        self.deliver(order, notification).await
    }

    async fn deliver(&self, order: &StagedOrder, notification: Notification) -> Delivery {
        let template = notification.template;
        match self.notifier.send(&notification).await {
            Ok(receipt) => {
                info!(staging_id = %order.id, ?template, message_id = ?receipt.message_id, "notification sent");
                self.record_notification(order, template, Ok(receipt.message_id))
                    .await;
                Delivery::Sent
            }
            Err(e) => {
                warn!(staging_id = %order.id, ?template, error = %e, "notification failed");
                let error = e.to_string();
                self.record_notification(order, template, Err(error.clone()))
                    .await;
                Delivery::Failed(error)
            }
        }
    }

    async fn record_notification(
        &self,
        order: &StagedOrder,
        template: Template,
        result: Result<Option<String>, String>,
    ) {
        let at = Utc::now();
        let state = match result {
            Ok(message_id) => NotificationState::Sent { message_id, at },
            Err(error) => NotificationState::Failed { error, at },
        };
        let patch = match template {
            Template::KitchenOrder => MetadataPatch {
                kitchen_notification: Some(state),
                ..Default::default()
            },
            Template::PaymentReceipt => MetadataPatch {
                receipt_notification: Some(state),
                ..Default::default()
            },
        };
        if self.staging.update(&order.id, patch.into()).await.is_none() {
            warn!(staging_id = %order.id, "staged order vanished before notification state was recorded");
        }
    }

    /// Runs only while holding the migration claim. The claim stays in place
    /// once the queue or the journal owns the order.
    async fn ensure_migrated(&self, order: &StagedOrder) -> MigrationStep {
        let err = match self.migrator.migrate(order).await {
            Ok(id) => return MigrationStep::Migrated(id),
            Err(err) => err,
        };
        warn!(
            staging_id = %order.id,
            retryable = err.is_retryable(),
            error = %err,
            "direct migration failed; deferring"
        );

        let caller = json!({ "source": "payment_reconciler" });
        match self.queue.enqueue(order, Some(caller)).await {
            Ok(queue_item_id) => {
                info!(staging_id = %order.id, %queue_item_id, "order queued for migration");
                self.staging
                    .update(&order.id, MetadataPatch::queued(queue_item_id).into())
                    .await;
                MigrationStep::Queued(queue_item_id)
            }
            Err(queue_err) => {
                warn!(staging_id = %order.id, error = %queue_err, "queue unavailable; journaling order");
                let reason = format!("{err}; queue unavailable: {queue_err}");
                match self.journal.add_failed_order(order, &reason).await {
                    Ok(_) => MigrationStep::Journaled,
                    Err(journal_err) => {
                        error!(
                            staging_id = %order.id,
                            error = %journal_err,
                            "order could not be queued or journaled; it stays staged only"
                        );
                        self.release_migration_claim(&order.id).await;
                        MigrationStep::Unrecorded(journal_err.to_string())
                    }
                }
            }
        }
    }

    /// Let a redelivered event try again when nothing took ownership of the migration.
    async fn release_migration_claim(&self, id: &StagingId) {
        let released = self
            .staging
            .modify(id, |order| order.metadata.migration_claimed_at = None)
            .await;
        if released.is_none() {
            warn!(staging_id = %id, "staged order vanished before migration claim was released");
        }
    }
}
