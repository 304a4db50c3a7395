//! Integration tests for the full order pipeline.
//!
//! Tests: stage → payment link → gateway event → reconcile → migrate,
//! with the durable queue and retry journal picking up failed migrations.
//!
//! Verifies:
//! - A paid order reaches the permanent store with recomputed prices
//! - Duplicate events are absorbed without repeated side effects
//! - Outages are retried with backoff until success or dead-letter
//! - Expired and restarted staging state behaves as documented

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    use orderflow_core::{Money, PricePolicy};
    use orderflow_orders::PaymentStatus;

    use crate::config::{JournalConfig, PipelineConfig, QueueConfig, StagingConfig};
    use crate::external::{GatewayEvent, GatewayEventKind, Template};
    use crate::journal::{RetryJournal, RetrySweeper};
    use crate::migration::{InMemoryPermanentStore, Migrator};
    use crate::pipeline::OrderPipeline;
    use crate::queue::{
        InMemoryMigrationQueue, ItemOutcome, MigrationQueue, QueueStatus, QueueWorker, RetryPolicy,
    };
    use crate::reconciler::PaymentReconciler;
    use crate::staging::StagingStore;
    use crate::testing::{draft, FakeGateway, RecordingNotifier, UnavailableQueue};

    struct Harness {
        dir: TempDir,
        staging: Arc<StagingStore>,
        store: Arc<InMemoryPermanentStore>,
        queue: Arc<InMemoryMigrationQueue>,
        journal: Arc<RetryJournal>,
        notifier: Arc<RecordingNotifier>,
        pipeline: OrderPipeline,
        worker: QueueWorker,
        sweeper: RetrySweeper,
    }

    fn staging_config(dir: &TempDir) -> StagingConfig {
        StagingConfig {
            dir: dir.path().join("staging"),
            ..StagingConfig::default()
        }
    }

    fn harness_in(dir: TempDir, queue_reachable: bool) -> Harness {
        let staging = Arc::new(StagingStore::new(staging_config(&dir)));
        let journal = Arc::new(RetryJournal::new(&JournalConfig {
            dir: dir.path().join("journal"),
            sweep_interval: Duration::from_secs(60),
            retry: RetryPolicy::exponential(5, Duration::from_secs(30), Duration::from_secs(3600)),
        }));
        let store = Arc::new(InMemoryPermanentStore::new());
        let queue = Arc::new(InMemoryMigrationQueue::new(3));
        let notifier = Arc::new(RecordingNotifier::default());
        let migrator = Migrator::new(store.clone(), PricePolicy::default()).with_staging(staging.clone());

        let reconciler_queue: Arc<dyn MigrationQueue> = if queue_reachable {
            queue.clone()
        } else {
            Arc::new(UnavailableQueue)
        };
        let config = PipelineConfig::from_lookup(|var| {
            (var == "ORDERFLOW_DEFAULT_INTAKE_EMAIL").then(|| "orders@orderflow.example".to_string())
        })
        .unwrap();
        let reconciler = PaymentReconciler::new(
            staging.clone(),
            notifier.clone(),
            migrator.clone(),
            reconciler_queue,
            journal.clone(),
        )
        .with_config(&config);
        let pipeline = OrderPipeline::new(
            staging.clone(),
            Arc::new(FakeGateway::default()),
            Arc::new(reconciler),
            PricePolicy::default(),
        );
        let worker = QueueWorker::new(queue.clone(), migrator.clone(), QueueConfig::default());
        let sweeper = RetrySweeper::new(journal.clone(), migrator);

        Harness {
            dir,
            staging,
            store,
            queue,
            journal,
            notifier,
            pipeline,
            worker,
            sweeper,
        }
    }

    fn harness() -> Harness {
        harness_in(TempDir::new().unwrap(), true)
    }

    fn paid_event(staging_id: &str) -> GatewayEvent {
        GatewayEvent::new(GatewayEventKind::PaymentSucceeded, "pi_3Nx").with_staging_ref(staging_id)
    }

    #[tokio::test]
    async fn staged_order_becomes_paid_and_permanent() {
        let h = harness();
        let staged = h.pipeline.stage(draft()).await.unwrap();
        assert_eq!(staged.pricing.subtotal, Money::from_cents(2046));
        assert_eq!(staged.pricing.tax, Money::from_cents(164));
        assert_eq!(staged.pricing.total, Money::from_cents(2210));
        assert!(staged.metadata.payment_link.is_some());

        h.pipeline.on_gateway_event(&paid_event(staged.id.as_str())).await;

        let order = h.staging.get(&staged.id).await.unwrap();
        assert_eq!(order.metadata.payment_status, PaymentStatus::Paid);
        assert!(order.metadata.paid_at.is_some());
        let permanent_id = order.metadata.permanent_order_id().unwrap();
        let stored = h.store.order(permanent_id).unwrap();
        assert_eq!(stored.pricing.total, Money::from_cents(2210));

        let status = h.pipeline.get_staging_status(&staged.id).await.unwrap();
        assert_eq!(status.status, PaymentStatus::Paid);
        assert_eq!(status.permanent_order_id, Some(permanent_id));
    }

    #[tokio::test]
    async fn checkout_completed_is_matched_by_payment_link() {
        let h = harness();
        let staged = h.pipeline.stage(draft()).await.unwrap();
        let link = staged.metadata.payment_link.clone().unwrap();

        h.pipeline
            .on_gateway_event(&GatewayEvent::new(GatewayEventKind::CheckoutCompleted, link.gateway_id))
            .await;

        let status = h.pipeline.get_staging_status(&staged.id).await.unwrap();
        assert_eq!(status.status, PaymentStatus::Paid);
        assert!(status.permanent_order_id.is_some());
    }

    #[tokio::test]
    async fn same_paid_event_twice_has_single_effects() {
        let h = harness();
        let staged = h.pipeline.stage(draft()).await.unwrap();
        let event = paid_event(staged.id.as_str());

        h.pipeline.on_gateway_event(&event).await;
        h.pipeline.on_gateway_event(&event).await;

        let order = h.staging.get(&staged.id).await.unwrap();
        assert_eq!(order.metadata.payment_status, PaymentStatus::Paid);
        assert_eq!(h.notifier.count(Template::KitchenOrder), 1);
        assert_eq!(h.notifier.count(Template::PaymentReceipt), 1);
        assert_eq!(h.store.order_count(), 1);
    }

    #[tokio::test]
    async fn kitchen_without_intake_address_uses_configured_default() {
        let h = harness();
        let mut d = draft();
        d.restaurant.intake_email = None;
        let staged = h.pipeline.stage(d).await.unwrap();

        h.pipeline.on_gateway_event(&paid_event(staged.id.as_str())).await;

        assert_eq!(
            h.notifier.destinations(Template::KitchenOrder),
            vec!["orders@orderflow.example".to_string()]
        );
    }

    #[tokio::test]
    async fn outage_is_retried_until_third_attempt_succeeds() {
        let h = harness();
        let staged = h.staging.put(draft()).await;
        let id = h.queue.enqueue(&staged, None).await.unwrap();
        h.store.fail_next(2);

        let mut now = Utc::now();
        let mut previous = now;
        for _ in 0..2 {
            let outcome = h.worker.process_next(now).await.unwrap().unwrap();
            let ItemOutcome::Retrying { next_attempt_at, .. } = outcome else {
                panic!("expected retry, got {outcome:?}");
            };
            assert!(next_attempt_at > previous);
            previous = next_attempt_at;
            now = next_attempt_at;
        }
        let outcome = h.worker.process_next(now).await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Completed { .. }));

        let item = h.queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.attempts, 3);
        assert_eq!(h.store.order_count(), 1);
        // The worker recorded the migration on the staged order.
        assert!(h.staging.get(&staged.id).await.unwrap().metadata.moved_to_permanent());
    }

    #[tokio::test]
    async fn paid_order_with_store_down_is_finished_by_the_worker() {
        let h = harness();
        let staged = h.pipeline.stage(draft()).await.unwrap();
        h.store.fail_next(1);

        h.pipeline.on_gateway_event(&paid_event(staged.id.as_str())).await;
        let order = h.staging.get(&staged.id).await.unwrap();
        assert_eq!(order.metadata.payment_status, PaymentStatus::Paid);
        assert!(!order.metadata.moved_to_permanent());
        // Kitchen still got the order.
        assert_eq!(h.notifier.count(Template::KitchenOrder), 1);

        let outcomes = h.worker.drain(Utc::now()).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let order = h.staging.get(&staged.id).await.unwrap();
        assert!(order.metadata.moved_to_permanent());
        assert_eq!(h.store.order_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_item_is_dead_lettered_then_requeued_by_operator() {
        let h = harness();
        let staged = h.staging.put(draft()).await;
        let id = h.queue.enqueue(&staged, None).await.unwrap();
        h.store.fail_next(3);

        let mut now = Utc::now();
        for _ in 0..3 {
            if let Some(ItemOutcome::Retrying { next_attempt_at, .. }) = h.worker.process_next(now).await.unwrap() {
                now = next_attempt_at;
            }
        }
        let item = h.queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::DeadLetter);
        assert_eq!(item.attempts, item.max_attempts);
        assert!(h.worker.process_next(now + ChronoDuration::days(7)).await.unwrap().is_none());
        assert_eq!(h.queue.stats().await.unwrap().dead_letter, 1);

        assert!(h.queue.requeue_dead_letter(id, now).await.unwrap());
        let outcome = h.worker.process_next(now).await.unwrap().unwrap();
        assert!(matches!(outcome, ItemOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn queue_outage_is_recovered_through_the_journal() {
        let h = harness_in(TempDir::new().unwrap(), false);
        let staged = h.pipeline.stage(draft()).await.unwrap();
        h.store.fail_next(1);

        h.pipeline.on_gateway_event(&paid_event(staged.id.as_str())).await;
        let entries = h.journal.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);

        let report = h.sweeper.sweep(entries[0].next_retry_at).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert!(h.journal.list_entries().await.unwrap().is_empty());
        assert!(h.staging.get(&staged.id).await.unwrap().metadata.moved_to_permanent());
    }

    #[tokio::test]
    async fn expired_orders_disappear_after_sweep() {
        let h = harness();
        let now = Utc::now();
        let old = h.staging.put_at(draft(), now - ChronoDuration::hours(49)).await;
        let fresh = h.staging.put_at(draft(), now).await;

        assert_eq!(h.staging.sweep_expired(now).await, 1);
        assert!(h.staging.get(&old.id).await.is_none());
        let listed: Vec<_> = h.staging.list().into_iter().map(|o| o.id).collect();
        assert_eq!(listed, vec![fresh.id]);

        // A late event for the expired order is ignored.
        h.pipeline.on_gateway_event(&paid_event(old.id.as_str())).await;
        assert_eq!(h.store.order_count(), 0);
    }

    #[tokio::test]
    async fn restart_recovers_staged_orders_for_payment_events() {
        let h = harness();
        let staged = h.pipeline.stage(draft()).await.unwrap();
        let link = staged.metadata.payment_link.clone().unwrap();
        let Harness { dir, .. } = h;

        let restarted = harness_in(dir, true);
        assert_eq!(restarted.staging.load_index().await.unwrap(), 1);
        restarted
            .pipeline
            .on_gateway_event(&GatewayEvent::new(GatewayEventKind::PaymentSucceeded, link.gateway_id))
            .await;

        let status = restarted.pipeline.get_staging_status(&staged.id).await.unwrap();
        assert_eq!(status.status, PaymentStatus::Paid);
        assert!(status.permanent_order_id.is_some());
        assert!(restarted.dir.path().join("staging").join("index.json").exists());
    }
}
