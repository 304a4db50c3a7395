//! Permanent store seam and the in-memory implementation.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use orderflow_core::{Money, PermanentOrderId, PriceBreakdown, StagingId};

/// Customer as written to the permanent store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCustomer {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Order line as written to the permanent store (price already validated).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderLine {
    pub item_name: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub special_instructions: Option<String>,
}

/// Everything the permanent store needs to record one paid order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPermanentOrder {
    pub staging_id: StagingId,
    pub customer: NewCustomer,
    pub restaurant_name: String,
    pub lines: Vec<NewOrderLine>,
    pub pricing: PriceBreakdown,
    pub paid_at: Option<DateTime<Utc>>,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermanentStoreError {
    /// Store unreachable or the transaction could not complete; retrying may help.
    #[error("permanent store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected the data itself; retrying cannot help.
    #[error("permanent store rejected order: {0}")]
    Rejected(String),
}

/// Transactional writer for the permanent order schema.
///
/// `insert_order` must resolve-or-create the customer (by email, then phone,
/// then name), the restaurant (by name) and each menu item (by name within the
/// restaurant), then insert the order and its lines, all inside one
/// transaction. Orders are keyed by staging id: inserting an order whose
/// staging id is already present returns the existing id and writes nothing.
#[async_trait]
pub trait PermanentStore: Send + Sync {
    async fn insert_order(&self, order: &NewPermanentOrder) -> Result<PermanentOrderId, PermanentStoreError>;

    async fn find_by_staging_id(
        &self,
        staging_id: &StagingId,
    ) -> Result<Option<PermanentOrderId>, PermanentStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCustomer {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMenuItem {
    pub id: i64,
    pub restaurant_id: i64,
    pub name: String,
    pub price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOrder {
    pub id: PermanentOrderId,
    pub staging_id: StagingId,
    pub customer_id: i64,
    pub restaurant_id: i64,
    pub pricing: PriceBreakdown,
    pub lines: Vec<(i64, NewOrderLine)>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    customers: Vec<StoredCustomer>,
    restaurants: Vec<(i64, String)>,
    menu_items: Vec<StoredMenuItem>,
    orders: Vec<StoredOrder>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn resolve_customer(&mut self, customer: &NewCustomer) -> i64 {
        let by_email = customer.email.as_ref().and_then(|email| {
            self.customers
                .iter()
                .find(|c| c.email.as_ref() == Some(email))
        });
        let by_phone = || {
            customer.phone.as_ref().and_then(|phone| {
                self.customers
                    .iter()
                    .find(|c| c.phone.as_ref() == Some(phone))
            })
        };
        let by_name = || self.customers.iter().find(|c| c.name == customer.name);

        if let Some(found) = by_email.or_else(by_phone).or_else(by_name) {
            return found.id;
        }

        let id = self.next_id();
        self.customers.push(StoredCustomer {
            id,
            name: customer.name.clone(),
            email: customer.email.clone(),
            phone: customer.phone.clone(),
        });
        id
    }

    fn resolve_restaurant(&mut self, name: &str) -> i64 {
        if let Some((id, _)) = self.restaurants.iter().find(|(_, n)| n == name) {
            return *id;
        }
        let id = self.next_id();
        self.restaurants.push((id, name.to_string()));
        id
    }

    fn resolve_menu_item(&mut self, restaurant_id: i64, line: &NewOrderLine) -> i64 {
        if let Some(item) = self
            .menu_items
            .iter()
            .find(|m| m.restaurant_id == restaurant_id && m.name == line.item_name)
        {
            return item.id;
        }
        let id = self.next_id();
        self.menu_items.push(StoredMenuItem {
            id,
            restaurant_id,
            name: line.item_name.clone(),
            price: line.unit_price,
        });
        id
    }
}

/// In-memory permanent store for tests/dev.
///
/// Each insert works on a copy of the tables and swaps it in only when the
/// whole order has been written, mirroring transactional all-or-nothing.
#[derive(Debug, Default)]
pub struct InMemoryPermanentStore {
    tables: Mutex<Tables>,
    fail_next: AtomicUsize,
}

impl InMemoryPermanentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: the next `n` inserts fail with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn order_count(&self) -> usize {
        self.tables.lock().orders.len()
    }

    pub fn customer_count(&self) -> usize {
        self.tables.lock().customers.len()
    }

    pub fn menu_item_count(&self) -> usize {
        self.tables.lock().menu_items.len()
    }

    pub fn order(&self, id: PermanentOrderId) -> Option<StoredOrder> {
        self.tables.lock().orders.iter().find(|o| o.id == id).cloned()
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PermanentStore for InMemoryPermanentStore {
    async fn insert_order(&self, order: &NewPermanentOrder) -> Result<PermanentOrderId, PermanentStoreError> {
        if self.take_injected_failure() {
            return Err(PermanentStoreError::Unavailable(
                "simulated connection failure".to_string(),
            ));
        }

        let mut tables = self.tables.lock();
        if let Some(existing) = tables.orders.iter().find(|o| o.staging_id == order.staging_id) {
            return Ok(existing.id);
        }

        let mut tx = tables.clone();
        let customer_id = tx.resolve_customer(&order.customer);
        let restaurant_id = tx.resolve_restaurant(&order.restaurant_name);
        let lines = order
            .lines
            .iter()
            .map(|line| (tx.resolve_menu_item(restaurant_id, line), line.clone()))
            .collect();
        let id = PermanentOrderId(tx.next_id());
        tx.orders.push(StoredOrder {
            id,
            staging_id: order.staging_id.clone(),
            customer_id,
            restaurant_id,
            pricing: order.pricing,
            lines,
        });

        *tables = tx;
        Ok(id)
    }

    async fn find_by_staging_id(
        &self,
        staging_id: &StagingId,
    ) -> Result<Option<PermanentOrderId>, PermanentStoreError> {
        Ok(self
            .tables
            .lock()
            .orders
            .iter()
            .find(|o| &o.staging_id == staging_id)
            .map(|o| o.id))
    }
}
