//! Transient order storage: memory-resident, mirrored to disk, expiring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use orderflow_core::StagingId;
use orderflow_orders::{OrderDraft, StagedOrder, StagedOrderPatch};

use super::disk::{DiskMirror, StagingError};
use crate::config::StagingConfig;
use crate::workers::{run_every, WorkerHandle};

/// Staged orders keyed by id.
///
/// The in-memory map is authoritative. Every mutation is written through to
/// the disk mirror, but disk failures are only logged: an order that could
/// not be persisted stays usable for the lifetime of the process.
///
/// Disk writes are serialized through `write_gate`, and each write re-reads
/// the latest in-memory state under the gate, so the mirror converges to
/// memory even when callers race.
#[derive(Debug)]
pub struct StagingStore {
    orders: RwLock<HashMap<StagingId, StagedOrder>>,
    disk: DiskMirror,
    write_gate: tokio::sync::Mutex<()>,
    config: StagingConfig,
    last_millis: AtomicI64,
}

impl StagingStore {
    pub fn new(config: StagingConfig) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            disk: DiskMirror::new(config.dir.clone()),
            write_gate: tokio::sync::Mutex::new(()),
            config,
            last_millis: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.ttl).unwrap_or_else(|_| chrono::Duration::hours(48))
    }

    /// `TEMP-{ms}-{nnnn}`; the millisecond part never repeats within a process.
    fn next_id(&self, now: DateTime<Utc>) -> StagingId {
        let now_ms = now.timestamp_millis();
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now_ms.max(last + 1)))
            .unwrap_or(now_ms);
        let millis = now_ms.max(previous + 1);
        let suffix = rand::thread_rng().gen_range(0..10_000u16);
        StagingId::from_parts(millis, suffix)
    }

    pub async fn put(&self, draft: OrderDraft) -> StagedOrder {
        self.put_at(draft, Utc::now()).await
    }

    pub async fn put_at(&self, draft: OrderDraft, now: DateTime<Utc>) -> StagedOrder {
        let order = StagedOrder::from_draft(self.next_id(now), draft, now, self.ttl());
        self.orders.write().insert(order.id.clone(), order.clone());
        debug!(staging_id = %order.id, expires_at = %order.expires_at, "order staged");
        self.persist(&order.id).await;
        order
    }

    pub async fn get(&self, id: &StagingId) -> Option<StagedOrder> {
        self.get_at(id, Utc::now()).await
    }

    /// Memory first, then disk. Expired records are purged and reported as absent.
    pub async fn get_at(&self, id: &StagingId, now: DateTime<Utc>) -> Option<StagedOrder> {
        let cached = self.orders.read().get(id).cloned();
        let order = match cached {
            Some(order) => order,
            None => match self.disk.read_order(id).await {
                Ok(Some(order)) if !order.is_expired_at(now) => {
                    debug!(staging_id = %id, "staged order recovered from disk");
                    return Some(
                        self.orders
                            .write()
                            .entry(id.clone())
                            .or_insert(order)
                            .clone(),
                    );
                }
                Ok(Some(order)) => order,
                Ok(None) => return None,
                Err(e) => {
                    warn!(staging_id = %id, error = %e, "failed to read staged order from disk");
                    return None;
                }
            },
        };

        if order.is_expired_at(now) {
            self.remove(id).await;
            return None;
        }
        Some(order)
    }

    /// Merge a partial update into a staged order.
    pub async fn update(&self, id: &StagingId, patch: StagedOrderPatch) -> Option<StagedOrder> {
        self.modify(id, |order| order.apply_patch(patch))
            .await
            .map(|(order, ())| order)
    }

    /// Atomic read-modify-write of one staged order.
    ///
    /// `f` runs under the store's write lock, so it must not block; the
    /// returned value lets callers decide on side effects from the exact
    /// state they observed.
    pub async fn modify<T, F>(&self, id: &StagingId, f: F) -> Option<(StagedOrder, T)>
    where
        F: FnOnce(&mut StagedOrder) -> T,
    {
        // Pull the record into memory (disk recovery and expiry handling).
        self.get(id).await?;

        let result = {
            let mut orders = self.orders.write();
            let order = orders.get_mut(id)?;
            let out = f(order);
            (order.clone(), out)
        };
        self.persist(id).await;
        Some(result)
    }

    pub async fn delete(&self, id: &StagingId) -> bool {
        self.remove(id).await
    }

    /// Unexpired orders, oldest first.
    pub fn list(&self) -> Vec<StagedOrder> {
        self.list_at(Utc::now())
    }

    pub fn list_at(&self, now: DateTime<Utc>) -> Vec<StagedOrder> {
        let mut orders: Vec<_> = self
            .orders
            .read()
            .values()
            .filter(|o| !o.is_expired_at(now))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        orders
    }

    pub fn count(&self) -> usize {
        let now = Utc::now();
        self.orders
            .read()
            .values()
            .filter(|o| !o.is_expired_at(now))
            .count()
    }

    pub fn find_by_payment_link(&self, gateway_id: &str) -> Option<StagedOrder> {
        self.orders
            .read()
            .values()
            .find(|o| {
                o.metadata
                    .payment_link
                    .as_ref()
                    .is_some_and(|l| l.gateway_id == gateway_id)
            })
            .cloned()
    }

    /// Purge every order whose expiry has passed. Returns how many were removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<StagingId> = {
            let mut orders = self.orders.write();
            let ids: Vec<_> = orders
                .values()
                .filter(|o| o.is_expired_at(now))
                .map(|o| o.id.clone())
                .collect();
            for id in &ids {
                orders.remove(id);
            }
            ids
        };
        if expired.is_empty() {
            return 0;
        }

        let _gate = self.write_gate.lock().await;
        for id in &expired {
            if let Err(e) = self.disk.remove_order(id).await {
                warn!(staging_id = %id, error = %e, "failed to remove expired staged order file");
            }
        }
        self.write_index_locked().await;
        info!(removed = expired.len(), "expired staged orders swept");
        expired.len()
    }

    /// Rewrite every in-memory order and the index. Returns how many orders were written.
    pub async fn flush_all(&self) -> usize {
        let _gate = self.write_gate.lock().await;
        let snapshot: Vec<StagedOrder> = self.orders.read().values().cloned().collect();

        let mut written = 0;
        for order in &snapshot {
            match self.disk.write_order(order).await {
                Ok(()) => written += 1,
                Err(e) => warn!(staging_id = %order.id, error = %e, "failed to flush staged order"),
            }
        }
        self.write_index_locked().await;
        debug!(written, "staging store flushed");
        written
    }

    /// Load every order listed in the on-disk index (process restart recovery).
    pub async fn load_index(&self) -> Result<usize, StagingError> {
        let now = Utc::now();
        let ids = self.disk.read_index().await?;
        let mut loaded = 0;
        let mut purged = Vec::new();

        for raw in ids {
            let Ok(id) = raw.parse::<StagingId>() else {
                warn!(entry = %raw, "ignoring malformed staging index entry");
                continue;
            };
            match self.disk.read_order(&id).await {
                Ok(Some(order)) if order.is_expired_at(now) => purged.push(id),
                Ok(Some(order)) => {
                    self.orders.write().entry(id).or_insert(order);
                    loaded += 1;
                }
                Ok(None) => debug!(staging_id = %id, "indexed staged order has no file"),
                Err(e) => warn!(staging_id = %id, error = %e, "failed to load staged order"),
            }
        }

        let _gate = self.write_gate.lock().await;
        for id in &purged {
            if let Err(e) = self.disk.remove_order(id).await {
                warn!(staging_id = %id, error = %e, "failed to remove expired staged order file");
            }
        }
        self.write_index_locked().await;
        info!(loaded, purged = purged.len(), dir = %self.disk.dir().display(), "staging store loaded");
        Ok(loaded)
    }

    /// Start the expiry sweep and periodic flush loops.
    ///
    /// The flush loop performs one last flush when it is cancelled.
    pub fn start(self: &Arc<Self>) -> StagingTasks {
        let store = self.clone();
        let interval = self.config.expiry_sweep_interval;
        let expiry = WorkerHandle::spawn("staging-expiry", move |cancel| {
            run_every(cancel, interval, move || {
                let store = store.clone();
                async move {
                    store.sweep_expired(Utc::now()).await;
                }
            })
        });

        let store = self.clone();
        let interval = self.config.flush_interval;
        let flush = WorkerHandle::spawn("staging-flush", move |cancel| async move {
            let ticker = store.clone();
            run_every(cancel, interval, move || {
                let store = ticker.clone();
                async move {
                    store.flush_all().await;
                }
            })
            .await;
            store.flush_all().await;
        });

        StagingTasks { expiry, flush }
    }

    async fn remove(&self, id: &StagingId) -> bool {
        let in_memory = self.orders.write().remove(id).is_some();

        let _gate = self.write_gate.lock().await;
        let on_disk = match self.disk.remove_order(id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(staging_id = %id, error = %e, "failed to remove staged order file");
                false
            }
        };
        self.write_index_locked().await;
        in_memory || on_disk
    }

    /// Mirror the current in-memory state of `id` to disk.
    async fn persist(&self, id: &StagingId) {
        let _gate = self.write_gate.lock().await;
        let current = self.orders.read().get(id).cloned();
        let result = match &current {
            Some(order) => self.disk.write_order(order).await,
            None => self.disk.remove_order(id).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(staging_id = %id, error = %e, "failed to persist staged order");
        }
        self.write_index_locked().await;
    }

    /// Caller must hold `write_gate`.
    async fn write_index_locked(&self) {
        let mut ids: Vec<StagingId> = self.orders.read().keys().cloned().collect();
        ids.sort();
        if let Err(e) = self.disk.write_index(&ids).await {
            warn!(error = %e, "failed to write staging index");
        }
    }
}

/// Background loops owned by a started [`StagingStore`].
#[derive(Debug)]
pub struct StagingTasks {
    expiry: WorkerHandle,
    flush: WorkerHandle,
}

impl StagingTasks {
    /// Stop both loops; the flush loop writes everything to disk on its way out.
    pub async fn shutdown(self) {
        self.expiry.shutdown().await;
        self.flush.shutdown().await;
    }
}
