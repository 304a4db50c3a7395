//! Shared fixtures and fakes for unit and integration tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use orderflow_core::{Money, PricePolicy, QueueItemId};
use orderflow_orders::{
    CustomerInfo, LineItem, OrderDraft, PaymentLink, RestaurantRef, StagedOrder,
};

use crate::external::{
    DeliveryReceipt, GatewayError, Notification, Notifier, NotifyError, PaymentGateway,
    PaymentLinkRequest, Template,
};
use crate::queue::{
    CallerIdentity, FailureDisposition, MigrationQueue, QueueError, QueueItem, QueueStats,
};

/// Two ramen at 10.23: subtotal 20.46, tax 1.64, total 22.10.
pub(crate) fn draft() -> OrderDraft {
    OrderDraft::priced(
        CustomerInfo {
            name: "Ada Lovelace".into(),
            email: Some("ada@example.com".into()),
            phone: Some("555-0100".into()),
        },
        RestaurantRef {
            id: Some("noodle-bar".into()),
            name: "Noodle Bar".into(),
            intake_email: Some("kitchen@noodlebar.example".into()),
        },
        vec![LineItem::new("Ramen", Money::from_cents(1023), 2).with_instructions("extra egg")],
        &PricePolicy::default(),
    )
    .unwrap()
}

pub(crate) fn staged_order(id: &str) -> StagedOrder {
    StagedOrder::from_draft(id.parse().unwrap(), draft(), Utc::now(), Duration::hours(48))
}

/// Notifier that records every successful delivery and can be told to fail per template.
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<HashSet<Template>>,
}

impl RecordingNotifier {
    pub(crate) fn fail(&self, template: Template) {
        self.failing.lock().insert(template);
    }

    pub(crate) fn recover(&self, template: Template) {
        self.failing.lock().remove(&template);
    }

    pub(crate) fn count(&self, template: Template) -> usize {
        self.sent.lock().iter().filter(|n| n.template == template).count()
    }

    pub(crate) fn total(&self) -> usize {
        self.sent.lock().len()
    }

    pub(crate) fn destinations(&self, template: Template) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.template == template)
            .map(|n| n.destination.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, NotifyError> {
        if self.failing.lock().contains(&notification.template) {
            return Err(NotifyError::Delivery("smtp connection refused".into()));
        }
        let mut sent = self.sent.lock();
        sent.push(notification.clone());
        Ok(DeliveryReceipt {
            message_id: Some(format!("msg-{}", sent.len())),
        })
    }
}

/// Gateway issuing sequential `cs_test_N` links.
#[derive(Debug, Default)]
pub(crate) struct FakeGateway {
    issued: AtomicUsize,
    down: AtomicBool,
    requests: Mutex<Vec<PaymentLinkRequest>>,
}

impl FakeGateway {
    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<PaymentLinkRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink, GatewayError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("gateway timed out".into()));
        }
        self.requests.lock().push(request.clone());
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PaymentLink {
            gateway_id: format!("cs_test_{n}"),
            url: format!("https://pay.example/checkout/cs_test_{n}"),
            expires_at: request.expires_at,
        })
    }
}

/// Queue whose backing store is unreachable.
#[derive(Debug, Default)]
pub(crate) struct UnavailableQueue;

fn down<T>() -> Result<T, QueueError> {
    Err(QueueError::Storage("connection refused".into()))
}

#[async_trait]
impl MigrationQueue for UnavailableQueue {
    async fn enqueue(&self, _: &StagedOrder, _: Option<CallerIdentity>) -> Result<QueueItemId, QueueError> {
        down()
    }

    async fn get(&self, _: QueueItemId) -> Result<Option<QueueItem>, QueueError> {
        down()
    }

    async fn claim(&self, _: DateTime<Utc>) -> Result<Option<QueueItem>, QueueError> {
        down()
    }

    async fn complete(&self, _: QueueItemId, _: DateTime<Utc>) -> Result<bool, QueueError> {
        down()
    }

    async fn fail(
        &self,
        _: QueueItemId,
        _: &str,
        _: FailureDisposition,
        _: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        down()
    }

    async fn release_stale(&self, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<usize, QueueError> {
        down()
    }

    async fn requeue_dead_letter(&self, _: QueueItemId, _: DateTime<Utc>) -> Result<bool, QueueError> {
        down()
    }

    async fn list_dead_letters(&self, _: usize) -> Result<Vec<QueueItem>, QueueError> {
        down()
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        down()
    }
}
