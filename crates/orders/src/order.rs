use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, Money, PriceBreakdown, PricePolicy, StagingId};

use crate::metadata::{MetadataPatch, OrderMetadata};

/// Who placed the order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Restaurant the order is for, as known at placement time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestaurantRef {
    pub id: Option<String>,
    pub name: String,
    /// Order-intake address configured on the restaurant's menu, if any.
    pub intake_email: Option<String>,
}

/// Order line: item name, unit price, quantity, special instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    /// `None` when the catalog had no price for the item. Such orders can be
    /// staged and paid, but never migrated.
    pub unit_price: Option<Money>,
    pub quantity: u32,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

impl LineItem {
    pub fn new(name: impl Into<String>, unit_price: Money, quantity: u32) -> Self {
        Self {
            name: name.into(),
            unit_price: Some(unit_price),
            quantity,
            special_instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.special_instructions = Some(instructions.into());
        self
    }

    /// Line total; fails on a missing or negative price, or a zero quantity.
    pub fn line_total(&self) -> Result<Money, DomainError> {
        let price = self.unit_price.ok_or_else(|| {
            DomainError::validation(format!("line item {:?} has no price", self.name))
        })?;
        if price.is_negative() {
            return Err(DomainError::validation(format!(
                "line item {:?} has negative price {price}",
                self.name
            )));
        }
        if self.quantity == 0 {
            return Err(DomainError::validation(format!(
                "line item {:?} has zero quantity",
                self.name
            )));
        }
        price.checked_mul(self.quantity).ok_or_else(|| {
            DomainError::validation(format!("line item {:?} total overflows", self.name))
        })
    }
}

/// Subtotal of a set of lines, failing on the first invalid line.
pub fn subtotal_of(items: &[LineItem]) -> Result<Money, DomainError> {
    items.iter().try_fold(Money::ZERO, |acc, item| {
        acc.checked_add(item.line_total()?)
            .ok_or_else(|| DomainError::validation("order subtotal overflows"))
    })
}

/// An order as submitted by the placement flow, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub customer: CustomerInfo,
    pub restaurant: RestaurantRef,
    pub items: Vec<LineItem>,
    pub pricing: PriceBreakdown,
}

impl OrderDraft {
    /// Build a draft priced by the canonical price function.
    pub fn priced(
        customer: CustomerInfo,
        restaurant: RestaurantRef,
        items: Vec<LineItem>,
        policy: &PricePolicy,
    ) -> Result<Self, DomainError> {
        if items.is_empty() {
            return Err(DomainError::validation("order has no items"));
        }
        let pricing = policy.quote(subtotal_of(&items)?)?;
        Ok(Self {
            customer,
            restaurant,
            items,
            pricing,
        })
    }
}

/// An order held transiently while the customer pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedOrder {
    pub id: StagingId,
    pub customer: CustomerInfo,
    pub restaurant: RestaurantRef,
    pub items: Vec<LineItem>,
    pub pricing: PriceBreakdown,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: OrderMetadata,
}

impl StagedOrder {
    pub fn from_draft(id: StagingId, draft: OrderDraft, created_at: DateTime<Utc>, ttl: Duration) -> Self {
        let OrderDraft {
            customer,
            restaurant,
            items,
            pricing,
        } = draft;
        Self {
            id,
            customer,
            restaurant,
            items,
            pricing,
            created_at,
            expires_at: created_at + ttl,
            metadata: OrderMetadata::default(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn apply_patch(&mut self, patch: StagedOrderPatch) {
        let StagedOrderPatch {
            customer_name,
            customer_email,
            customer_phone,
            metadata,
        } = patch;
        if let Some(v) = customer_name {
            self.customer.name = v;
        }
        if let Some(v) = customer_email {
            self.customer.email = Some(v);
        }
        if let Some(v) = customer_phone {
            self.customer.phone = Some(v);
        }
        self.metadata.merge(metadata);
    }
}

/// Partial update of a staged order: a few top-level fields plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedOrderPatch {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub metadata: MetadataPatch,
}

impl From<MetadataPatch> for StagedOrderPatch {
    fn from(metadata: MetadataPatch) -> Self {
        Self {
            metadata,
            ..Default::default()
        }
    }
}
