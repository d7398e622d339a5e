//! Saga tests on a temporary SQLite ledger with an in-memory event sink

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use event_bus::{
    routing, DeliveryHandler, Disposition, DomainEvent, Error as BusError, EventPayload,
    EventSink, InboundMessage,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use transfer_worker::{
    AuditFinding, OutcomeAuditHandler, Reaper, TransferInitiatedHandler, TransferRequest,
    TransferService,
};
use uuid::Uuid;
use wallet_ledger::{Config, Ledger, NewTransaction, NewUser, TransactionStatus, User, Wallet};

const REQUEUE_DELAY: Duration = Duration::from_millis(250);

/// Records published events; fails the next `fail_next` publishes
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<DomainEvent>>,
    fail_next: AtomicUsize,
}

impl RecordingSink {
    fn published(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    fn with_key(&self, routing_key: &str) -> Vec<DomainEvent> {
        self.published()
            .into_iter()
            .filter(|e| e.routing_key() == routing_key)
            .collect()
    }

    fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        event: &DomainEvent,
    ) -> event_bus::Result<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Publish("broker unavailable".to_string()));
        }

        assert_eq!(routing_key, event.routing_key());
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Harness {
    ledger: Ledger,
    sink: Arc<RecordingSink>,
    cancel: CancellationToken,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.db");
        let ledger = Ledger::open(Config::with_database_url(format!("sqlite://{}", path.display())))
            .await
            .unwrap();

        Self {
            ledger,
            sink: Arc::new(RecordingSink::default()),
            cancel: CancellationToken::new(),
            _dir: dir,
        }
    }

    fn service(&self) -> TransferService<RecordingSink> {
        TransferService::new(self.ledger.clone(), Arc::clone(&self.sink))
    }

    fn handler(&self) -> TransferInitiatedHandler<RecordingSink> {
        TransferInitiatedHandler::new(
            self.ledger.clone(),
            Arc::clone(&self.sink),
            self.cancel.clone(),
            REQUEUE_DELAY,
        )
    }

    async fn register(&self, name: &str) -> (User, Wallet) {
        self.service()
            .register_user(
                &self.cancel,
                NewUser {
                    name: name.to_string(),
                    email: format!("{}@example.com", name.to_lowercase()),
                    password_hash: "hash".to_string(),
                },
            )
            .await
            .unwrap()
    }

    async fn fund(&self, user: &User, amount: Decimal) {
        self.service().topup(user.id, amount, None).await.unwrap();
    }

    async fn balance(&self, wallet: &Wallet) -> Decimal {
        self.ledger.wallet(wallet.id).await.unwrap().balance
    }
}

fn delivery(event: &DomainEvent, delivery_count: u64) -> InboundMessage {
    InboundMessage {
        routing_key: event.routing_key().to_string(),
        message_id: Some(Uuid::new_v4().to_string()),
        payload: Bytes::from(event.to_vec().unwrap()),
        delivery_count,
    }
}

#[tokio::test]
async fn test_registration_announces_user() {
    let h = Harness::new().await;
    let (alice, wallet) = h.register("Alice").await;

    assert_eq!(wallet.balance, Decimal::ZERO);
    let created = h.sink.with_key(routing::USER_CREATED);
    assert_eq!(created.len(), 1);
    assert_eq!(
        created[0].payload,
        EventPayload::UserCreated {
            user_id: alice.id,
            email: "alice@example.com".to_string(),
            name: "Alice".to_string(),
        }
    );
}

#[tokio::test]
async fn test_registration_survives_failed_announcement() {
    let h = Harness::new().await;
    h.sink.fail_next(1);

    let (alice, _) = h.register("Alice").await;
    assert!(h.sink.published().is_empty());
    assert_eq!(h.ledger.user(alice.id).await.unwrap().id, alice.id);
}

#[tokio::test]
async fn test_transfer_saga_completes() {
    let h = Harness::new().await;
    let (alice, w1) = h.register("Alice").await;
    let (bob, w2) = h.register("Bob").await;
    h.fund(&alice, dec!(100)).await;

    let submission = h
        .service()
        .initiate_transfer(&h.cancel, TransferRequest::new(alice.id, bob.id, dec!(40)))
        .await
        .unwrap();
    let initiated = h.sink.with_key(routing::TRANSFER_INITIATED);
    assert_eq!(initiated.len(), 1);
    assert_eq!(
        initiated[0].payload.transaction_id(),
        Some(submission.transaction().id)
    );

    let disposition = h.handler().handle(delivery(&initiated[0], 1)).await;
    assert_eq!(disposition, Disposition::Ack);

    assert_eq!(h.balance(&w1).await, dec!(60));
    assert_eq!(h.balance(&w2).await, dec!(40));

    let completed = h.sink.with_key(routing::TRANSFER_COMPLETED);
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].payload,
        EventPayload::TransferCompleted {
            transaction_id: submission.transaction().id,
            from_user_id: alice.id,
            to_user_id: bob.id,
            amount: dec!(40),
        }
    );

    let tx = h.ledger.transaction(submission.transaction().id).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert!(tx.event_published_at.is_some());
}

#[tokio::test]
async fn test_redelivered_initiation_is_acked_noop() {
    let h = Harness::new().await;
    let (alice, w1) = h.register("Alice").await;
    let (bob, w2) = h.register("Bob").await;
    h.fund(&alice, dec!(100)).await;

    h.service()
        .initiate_transfer(&h.cancel, TransferRequest::new(alice.id, bob.id, dec!(25)))
        .await
        .unwrap();
    let initiated = h.sink.with_key(routing::TRANSFER_INITIATED).remove(0);

    let handler = h.handler();
    assert_eq!(handler.handle(delivery(&initiated, 1)).await, Disposition::Ack);
    assert_eq!(handler.handle(delivery(&initiated, 2)).await, Disposition::Ack);

    assert_eq!(h.balance(&w1).await, dec!(75));
    assert_eq!(h.balance(&w2).await, dec!(25));
    assert_eq!(h.sink.with_key(routing::TRANSFER_COMPLETED).len(), 1);
    assert_eq!(h.ledger.transactions_for_user(bob.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_insufficient_funds_publishes_failure() {
    let h = Harness::new().await;
    let (alice, w1) = h.register("Alice").await;
    let (bob, _) = h.register("Bob").await;
    h.fund(&alice, dec!(20)).await;

    h.service()
        .initiate_transfer(&h.cancel, TransferRequest::new(alice.id, bob.id, dec!(40)))
        .await
        .unwrap();
    let initiated = h.sink.with_key(routing::TRANSFER_INITIATED).remove(0);

    assert_eq!(h.handler().handle(delivery(&initiated, 1)).await, Disposition::Ack);
    assert_eq!(h.balance(&w1).await, dec!(20));

    let failed = h.sink.with_key(routing::TRANSFER_FAILED);
    assert_eq!(failed.len(), 1);
    match &failed[0].payload {
        EventPayload::TransferFailed { reason, .. } => {
            assert!(reason.contains("insufficient funds"))
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_outcome_publish_requeues_then_recovers() {
    let h = Harness::new().await;
    let (alice, w1) = h.register("Alice").await;
    let (bob, _) = h.register("Bob").await;
    h.fund(&alice, dec!(50)).await;

    let tx = h
        .service()
        .initiate_transfer(&h.cancel, TransferRequest::new(alice.id, bob.id, dec!(10)))
        .await
        .unwrap()
        .into_transaction();
    let initiated = h.sink.with_key(routing::TRANSFER_INITIATED).remove(0);

    h.sink.fail_next(1);
    let handler = h.handler();
    assert_eq!(
        handler.handle(delivery(&initiated, 1)).await,
        Disposition::requeue_after(REQUEUE_DELAY)
    );

    // Effect committed, outcome not yet marked
    let stored = h.ledger.transaction(tx.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert!(stored.event_published_at.is_none());
    assert_eq!(h.balance(&w1).await, dec!(40));

    assert_eq!(handler.handle(delivery(&initiated, 2)).await, Disposition::Ack);
    assert_eq!(h.balance(&w1).await, dec!(40));
    assert_eq!(h.sink.with_key(routing::TRANSFER_COMPLETED).len(), 1);
    assert!(h
        .ledger
        .transaction(tx.id)
        .await
        .unwrap()
        .event_published_at
        .is_some());
}

#[tokio::test]
async fn test_undeliverable_messages_are_dead_lettered() {
    let h = Harness::new().await;
    let (alice, _) = h.register("Alice").await;
    let handler = h.handler();

    let garbage = InboundMessage {
        routing_key: routing::TRANSFER_INITIATED.to_string(),
        message_id: None,
        payload: Bytes::from_static(b"{not json"),
        delivery_count: 1,
    };
    assert!(matches!(
        handler.handle(garbage).await,
        Disposition::DeadLetter { .. }
    ));

    let wrong_type = DomainEvent::user_created(alice.id, "alice@example.com", "Alice");
    assert!(matches!(
        handler.handle(delivery(&wrong_type, 1)).await,
        Disposition::DeadLetter { .. }
    ));

    let unknown = DomainEvent::transfer_initiated(Uuid::new_v4(), alice.id, Uuid::new_v4(), dec!(1));
    match handler.handle(delivery(&unknown, 1)).await {
        Disposition::DeadLetter { reason } => assert!(reason.contains("unknown transaction")),
        other => panic!("expected dead letter, got {other:?}"),
    }

    let topup = h.service().topup(alice.id, dec!(5), None).await.unwrap();
    let not_transfer = DomainEvent::transfer_initiated(topup.id, alice.id, Uuid::new_v4(), dec!(5));
    assert!(matches!(
        handler.handle(delivery(&not_transfer, 1)).await,
        Disposition::DeadLetter { .. }
    ));
}

#[tokio::test]
async fn test_duplicate_initiation_republishes_only_while_pending() {
    let h = Harness::new().await;
    let (alice, _) = h.register("Alice").await;
    let (bob, _) = h.register("Bob").await;
    h.fund(&alice, dec!(100)).await;

    let request = TransferRequest::new(alice.id, bob.id, dec!(30)).with_idempotency_key("order-7");
    let service = h.service();

    let first = service.initiate_transfer(&h.cancel, request.clone()).await.unwrap();
    let second = service.initiate_transfer(&h.cancel, request.clone()).await.unwrap();
    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());
    assert_eq!(first.transaction().id, second.transaction().id);
    assert_eq!(h.sink.with_key(routing::TRANSFER_INITIATED).len(), 2);

    let initiated = h.sink.with_key(routing::TRANSFER_INITIATED).remove(0);
    assert_eq!(h.handler().handle(delivery(&initiated, 1)).await, Disposition::Ack);

    let third = service.initiate_transfer(&h.cancel, request).await.unwrap();
    assert!(third.is_duplicate());
    assert_eq!(third.transaction().status, TransactionStatus::Completed);
    assert_eq!(h.sink.with_key(routing::TRANSFER_INITIATED).len(), 2);
}

#[tokio::test]
async fn test_cancelled_initiation_reports_failure_but_keeps_row() {
    let h = Harness::new().await;
    let (alice, _) = h.register("Alice").await;
    let (bob, _) = h.register("Bob").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = TransferRequest::new(alice.id, bob.id, dec!(5)).with_idempotency_key("retry-me");

    let err = h
        .service()
        .initiate_transfer(&cancel, request.clone())
        .await
        .unwrap_err();
    assert!(err.is_transient());

    // The caller retries with the same key and the announcement goes out
    let retried = h.service().initiate_transfer(&h.cancel, request).await.unwrap();
    assert!(retried.is_duplicate());
    assert_eq!(h.sink.with_key(routing::TRANSFER_INITIATED).len(), 1);
}

#[tokio::test]
async fn test_payment_and_topup_apply_in_place() {
    let h = Harness::new().await;
    let (alice, w1) = h.register("Alice").await;

    let topup = h.service().topup(alice.id, dec!(30), Some("t-1".into())).await.unwrap();
    assert_eq!(topup.status, TransactionStatus::Completed);

    let again = h.service().topup(alice.id, dec!(30), Some("t-1".into())).await.unwrap();
    assert_eq!(again.id, topup.id);
    assert_eq!(h.balance(&w1).await, dec!(30));

    let paid = h.service().pay(alice.id, "coffee-shop", dec!(4.5), None).await.unwrap();
    assert_eq!(paid.status, TransactionStatus::Completed);
    assert_eq!(h.balance(&w1).await, dec!(25.5));

    let declined = h.service().pay(alice.id, "car-dealer", dec!(9000), None).await.unwrap();
    assert_eq!(declined.status, TransactionStatus::Failed);
    assert_eq!(h.balance(&w1).await, dec!(25.5));
}

#[tokio::test]
async fn test_reaper_expires_and_publishes_failure() {
    let h = Harness::new().await;
    let (alice, w1) = h.register("Alice").await;
    let (bob, _) = h.register("Bob").await;
    h.fund(&alice, dec!(100)).await;

    let overdue = h
        .ledger
        .submit(
            NewTransaction::transfer(alice.id, bob.id, dec!(10))
                .with_expiry(Utc::now() - ChronoDuration::minutes(1)),
        )
        .await
        .unwrap()
        .into_transaction();

    let reaper = Reaper::new(h.ledger.clone(), Arc::clone(&h.sink), Duration::from_secs(60));
    let report = reaper.reap_once(&h.cancel, Utc::now()).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.published, 1);

    let failed = h.sink.with_key(routing::TRANSFER_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload.transaction_id(), Some(overdue.id));
    assert_eq!(
        h.ledger.transaction(overdue.id).await.unwrap().status,
        TransactionStatus::Expired
    );
    assert_eq!(h.balance(&w1).await, dec!(100));

    // Late delivery of the initiation finds nothing to do
    let late = DomainEvent::transfer_initiated(overdue.id, alice.id, bob.id, dec!(10));
    assert_eq!(h.handler().handle(delivery(&late, 1)).await, Disposition::Ack);
    assert_eq!(h.balance(&w1).await, dec!(100));
    assert_eq!(h.sink.with_key(routing::TRANSFER_FAILED).len(), 1);

    let idle = reaper.reap_once(&h.cancel, Utc::now()).await.unwrap();
    assert_eq!(idle.expired, 0);
    assert_eq!(idle.published, 0);
}

#[tokio::test]
async fn test_reaper_sweeps_unpublished_outcomes() {
    let h = Harness::new().await;
    let (alice, _) = h.register("Alice").await;
    let (bob, _) = h.register("Bob").await;
    h.fund(&alice, dec!(100)).await;

    let tx = h
        .service()
        .initiate_transfer(&h.cancel, TransferRequest::new(alice.id, bob.id, dec!(10)))
        .await
        .unwrap()
        .into_transaction();
    let initiated = h.sink.with_key(routing::TRANSFER_INITIATED).remove(0);

    h.sink.fail_next(1);
    assert!(matches!(
        h.handler().handle(delivery(&initiated, 1)).await,
        Disposition::Requeue { .. }
    ));

    let reaper = Reaper::new(h.ledger.clone(), Arc::clone(&h.sink), Duration::from_secs(60));

    // Too recent for the sweep
    let early = reaper.reap_once(&h.cancel, Utc::now()).await.unwrap();
    assert_eq!(early.published, 0);

    let later = Utc::now() + ChronoDuration::minutes(5);
    let swept = reaper.reap_once(&h.cancel, later).await.unwrap();
    assert_eq!(swept.published, 1);
    assert_eq!(h.sink.with_key(routing::TRANSFER_COMPLETED).len(), 1);
    assert!(h
        .ledger
        .transaction(tx.id)
        .await
        .unwrap()
        .event_published_at
        .is_some());
}

#[tokio::test]
async fn test_audit_cross_checks_outcomes() {
    let h = Harness::new().await;
    let (alice, _) = h.register("Alice").await;
    let (bob, _) = h.register("Bob").await;
    h.fund(&alice, dec!(100)).await;

    let tx = h
        .service()
        .initiate_transfer(&h.cancel, TransferRequest::new(alice.id, bob.id, dec!(10)))
        .await
        .unwrap()
        .into_transaction();
    let audit = OutcomeAuditHandler::new(h.ledger.clone(), REQUEUE_DELAY);

    // Completion claimed before the guard ran
    let premature = DomainEvent::transfer_completed(tx.id, alice.id, bob.id, dec!(10));
    assert_eq!(
        audit.audit(&premature).await.unwrap(),
        AuditFinding::Mismatch {
            expected: "completed",
            actual: TransactionStatus::Pending,
        }
    );

    let initiated = h.sink.with_key(routing::TRANSFER_INITIATED).remove(0);
    h.handler().handle(delivery(&initiated, 1)).await;

    let completed = h.sink.with_key(routing::TRANSFER_COMPLETED).remove(0);
    assert_eq!(audit.audit(&completed).await.unwrap(), AuditFinding::Consistent);
    assert_eq!(audit.handle(delivery(&completed, 1)).await, Disposition::Ack);

    let stray = DomainEvent::transfer_failed(Uuid::new_v4(), alice.id, bob.id, dec!(1), "?");
    assert_eq!(audit.audit(&stray).await.unwrap(), AuditFinding::Unknown);
    assert_eq!(audit.handle(delivery(&stray, 1)).await, Disposition::Ack);

    let garbage = InboundMessage {
        routing_key: routing::TRANSFER_FAILED.to_string(),
        message_id: None,
        payload: Bytes::from_static(b"[]"),
        delivery_count: 1,
    };
    assert!(matches!(
        audit.handle(garbage).await,
        Disposition::DeadLetter { .. }
    ));
}
