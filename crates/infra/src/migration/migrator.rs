//! Staged order → permanent store.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use orderflow_core::{DomainError, PermanentOrderId, PricePolicy};
use orderflow_orders::{subtotal_of, MetadataPatch, MigrationRecord, StagedOrder};

use super::store::{NewCustomer, NewOrderLine, NewPermanentOrder, PermanentStore, PermanentStoreError};
use crate::staging::StagingStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    /// The staged data can never be written as-is (missing price, malformed snapshot).
    #[error("order data rejected: {0}")]
    Integrity(String),
    /// The permanent store could not be reached or the transaction failed.
    #[error("permanent store unavailable: {0}")]
    Unavailable(String),
}

impl MigrationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrationError::Unavailable(_))
    }
}

impl From<PermanentStoreError> for MigrationError {
    fn from(err: PermanentStoreError) -> Self {
        match err {
            PermanentStoreError::Unavailable(msg) => MigrationError::Unavailable(msg),
            PermanentStoreError::Rejected(msg) => MigrationError::Integrity(msg),
        }
    }
}

/// Writes staged orders into the permanent store.
///
/// Shared by the reconciler (direct path), the queue worker and the retry
/// sweeper. It never retries by itself.
#[derive(Clone)]
pub struct Migrator {
    store: Arc<dyn PermanentStore>,
    prices: PricePolicy,
    staging: Option<Arc<StagingStore>>,
}

impl Migrator {
    pub fn new(store: Arc<dyn PermanentStore>, prices: PricePolicy) -> Self {
        Self {
            store,
            prices,
            staging: None,
        }
    }

    /// Record successful migrations back onto the staged order, if it is still staged.
    pub fn with_staging(mut self, staging: Arc<StagingStore>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Validate a staged order and build the permanent record with prices
    /// recomputed from the line items.
    pub fn prepare(&self, order: &StagedOrder) -> Result<NewPermanentOrder, MigrationError> {
        if order.items.is_empty() {
            return Err(MigrationError::Integrity("order has no line items".into()));
        }
        if order.restaurant.name.trim().is_empty() {
            return Err(MigrationError::Integrity("order has no restaurant name".into()));
        }

        let integrity = |e: DomainError| MigrationError::Integrity(e.to_string());
        let pricing = self
            .prices
            .quote(subtotal_of(&order.items).map_err(integrity)?)
            .map_err(integrity)?;
        if pricing != order.pricing {
            warn!(
                staging_id = %order.id,
                staged_total = %order.pricing.total,
                recomputed_total = %pricing.total,
                "staged price breakdown differs from recomputed one; using recomputed"
            );
        }

        let lines = order
            .items
            .iter()
            .map(|item| {
                let unit_price = item.unit_price.ok_or_else(|| {
                    MigrationError::Integrity(format!("line item {:?} has no price", item.name))
                })?;
                if i32::try_from(item.quantity).is_err() {
                    return Err(MigrationError::Integrity(format!(
                        "line item {:?} quantity {} is out of range",
                        item.name, item.quantity
                    )));
                }
                Ok(NewOrderLine {
                    item_name: item.name.clone(),
                    unit_price,
                    quantity: item.quantity,
                    special_instructions: item.special_instructions.clone(),
                })
            })
            .collect::<Result<Vec<_>, MigrationError>>()?;

        Ok(NewPermanentOrder {
            staging_id: order.id.clone(),
            customer: NewCustomer {
                name: order.customer.name.clone(),
                email: order.customer.email.clone(),
                phone: order.customer.phone.clone(),
            },
            restaurant_name: order.restaurant.name.clone(),
            lines,
            pricing,
            paid_at: order.metadata.paid_at,
            placed_at: order.created_at,
        })
    }

    pub async fn migrate(&self, order: &StagedOrder) -> Result<PermanentOrderId, MigrationError> {
        let record = self.prepare(order)?;
        let id = self.store.insert_order(&record).await?;
        info!(staging_id = %order.id, permanent_order_id = %id, "order migrated to permanent store");

        if let Some(staging) = &self.staging {
            let patch = MetadataPatch::migrated(MigrationRecord {
                permanent_order_id: id,
                migrated_at: Utc::now(),
            });
            if staging.update(&order.id, patch.into()).await.is_none() {
                // Already swept or deleted; the permanent record is what matters.
                info!(staging_id = %order.id, "staged order gone before migration was recorded");
            }
        }
        Ok(id)
    }
}
