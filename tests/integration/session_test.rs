// tests/integration/session_test.rs

//! Integration tests for session lifecycle, resource creation, and close semantics

use super::test_helpers::{TestContext, dispatch_for, wait_until};
use async_trait::async_trait;
use mqsession::core::commands::{Command, CommandBody, ObjectId, TransactionType, Xid};
use mqsession::core::destination::MessageDestination;
use mqsession::core::errors::{ClientError, ErrorKind, Result};
use mqsession::core::transport::Reply;
use mqsession::session::{
    AckMode, DistributedOutcome, SessionState, Synchronization, TransactionState,
};
use mqsession::Destination;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A destination type this client did not create.
#[derive(Debug)]
struct ForeignQueue;

impl MessageDestination for ForeignQueue {}

fn xid(id: u8) -> Xid {
    Xid {
        format_id: 1,
        global_transaction_id: vec![id],
        branch_qualifier: vec![0],
    }
}

/// A synchronization whose `before_end` always fails.
#[derive(Default)]
struct RefusingSync {
    rolled_back: AtomicUsize,
}

#[async_trait]
impl Synchronization for RefusingSync {
    async fn before_end(&self) -> Result<()> {
        Err(ClientError::IllegalState("refusing to end".to_string()))
    }

    async fn after_commit(&self) -> Result<()> {
        Ok(())
    }

    async fn after_rollback(&self) -> Result<()> {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn transaction_kinds(ctx: &TestContext) -> Vec<TransactionType> {
    ctx.sent_bodies("TransactionInfo")
        .into_iter()
        .filter_map(|b| match b {
            CommandBody::TransactionInfo(info) => Some(info.kind),
            _ => None,
        })
        .collect()
}

fn session_removes(ctx: &TestContext) -> usize {
    ctx.sent_bodies("RemoveInfo")
        .iter()
        .filter(|b| matches!(b, CommandBody::RemoveInfo(r) if matches!(r.object_id, ObjectId::Session(_))))
        .count()
}

// ===== Identity =====

#[tokio::test]
async fn test_identity_format() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    let queue = Destination::queue("orders");

    let first = session.create_consumer(&queue, None, false).await.unwrap();
    let second = session.create_consumer(&queue, None, false).await.unwrap();
    let producer = session.create_producer(Some(&queue)).await.unwrap();

    assert_eq!(session.id().to_string(), "ID:host-9999-0:0");
    assert_eq!(first.id().to_string(), "ID:host-9999-0:0:0");
    assert_eq!(second.id().to_string(), "ID:host-9999-0:0:1");
    assert_eq!(producer.id().to_string(), "ID:host-9999-0:0:0");

    let next = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    assert_eq!(next.id().to_string(), "ID:host-9999-0:1");
}

#[tokio::test]
async fn test_session_creation_is_oneway() {
    let ctx = TestContext::new();
    ctx.connection.create_session(AckMode::Auto).await.unwrap();

    let infos = ctx.transport.sent_named("SessionInfo");
    assert_eq!(infos.len(), 1);
    assert!(!infos[0].response_required);
}

// ===== Start ordering =====

#[tokio::test]
async fn test_consumers_start_with_the_connection() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    let queue = Destination::queue("orders");
    let early = session.create_consumer(&queue, None, false).await.unwrap();

    assert!(!session.is_started());
    assert!(!early.is_started());

    ctx.connection.start().await.unwrap();
    assert!(session.is_started());
    assert!(early.is_started());

    let late = session.create_consumer(&queue, None, false).await.unwrap();
    assert!(late.is_started());
}

// ===== Consumer creation =====

#[tokio::test]
async fn test_foreign_destination_rejected_before_broker() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    ctx.transport.clear_sent();

    let err = session
        .create_consumer(&ForeignQueue, None, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    assert!(ctx.transport.sent().is_empty());

    let err = session.create_producer(Some(&ForeignQueue)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);
}

#[tokio::test]
async fn test_failed_consumer_registration_is_rolled_back() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    ctx.transport.set_responder(|cmd| match &cmd.body {
        CommandBody::ConsumerInfo(_) => Reply::Error("selector is invalid".to_string()),
        _ => Reply::Ok,
    });

    let queue = Destination::queue("orders");
    let err = session
        .create_consumer(&queue, Some("price >"), false)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BrokerError);
    assert!(session.consumers().is_empty());
    assert_eq!(ctx.connection.dispatcher_count(), 0);
}

#[tokio::test]
async fn test_consumer_registered_for_routing() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    let queue = Destination::queue("orders");

    let consumer = session.create_consumer(&queue, None, false).await.unwrap();

    assert!(ctx.connection.has_dispatcher(consumer.id()));
    assert_eq!(session.consumers().len(), 1);
    let infos = ctx.transport.sent_named("ConsumerInfo");
    assert_eq!(infos.len(), 1);
    assert!(infos[0].response_required);
}

#[tokio::test]
async fn test_dispatch_during_registration_is_kept() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    ctx.connection.start().await.unwrap();
    let transport = Arc::downgrade(&ctx.transport);
    ctx.transport.set_responder(move |cmd| {
        // The broker starts dispatching before it acknowledges the consumer.
        if let CommandBody::ConsumerInfo(info) = &cmd.body {
            if let Some(transport) = transport.upgrade() {
                let early = dispatch_for(&info.consumer_id, &info.destination, 1, "early");
                transport.inject(Command::new(early));
            }
        }
        Reply::Ok
    });

    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();

    let message = consumer
        .receive(Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.body_str().unwrap(), "early");
}

#[tokio::test]
async fn test_prefetch_follows_destination_kind() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    let prefetch = ctx.connection.config().prefetch.clone();

    let queue = session.create_queue("orders").unwrap();
    let topic = session.create_topic("prices").unwrap();
    let on_queue = session.create_consumer(&queue, None, false).await.unwrap();
    let on_topic = session.create_consumer(&topic, None, false).await.unwrap();
    let durable = session
        .create_durable_consumer(&topic, "audit", None, false)
        .await
        .unwrap();

    assert_eq!(on_queue.prefetch_size(), prefetch.queue);
    assert_eq!(on_topic.prefetch_size(), prefetch.topic);
    assert_eq!(durable.prefetch_size(), prefetch.durable_topic);
    assert!(durable.is_durable());
}

#[tokio::test]
async fn test_durable_consumer_requires_topic_and_name() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    let queue = Destination::queue("orders");
    let topic = Destination::topic("prices");

    let err = session
        .create_durable_consumer(&queue, "audit", None, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);

    let err = session
        .create_durable_consumer(&topic, "  ", None, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[tokio::test]
async fn test_empty_destination_names_rejected() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();

    assert_eq!(
        session.create_queue("").unwrap_err().kind(),
        ErrorKind::InvalidDestination
    );
    assert_eq!(
        session.create_topic(" ").unwrap_err().kind(),
        ErrorKind::InvalidDestination
    );
}

#[tokio::test]
async fn test_unsubscribe_sends_remove_subscription() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();

    session.unsubscribe("audit").await.unwrap();

    let removes = ctx.sent_bodies("RemoveSubscriptionInfo");
    assert_eq!(removes.len(), 1);
    match &removes[0] {
        CommandBody::RemoveSubscriptionInfo(info) => {
            assert_eq!(info.subscription_name, "audit");
            assert_eq!(info.client_id, ctx.connection.client_id());
        }
        other => panic!("Expected RemoveSubscriptionInfo, got {:?}", other),
    }
}

// ===== Transactions =====

#[tokio::test]
async fn test_commit_requires_transacted_session() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();

    assert_eq!(
        session.commit().await.unwrap_err().kind(),
        ErrorKind::IllegalState
    );
    assert_eq!(
        session.rollback().await.unwrap_err().kind(),
        ErrorKind::IllegalState
    );
}

#[tokio::test]
async fn test_recover_rejected_on_transacted_session() {
    let ctx = TestContext::new();
    let session = ctx
        .connection
        .create_session(AckMode::Transacted)
        .await
        .unwrap();

    assert_eq!(
        session.recover().await.unwrap_err().kind(),
        ErrorKind::IllegalState
    );
}

#[tokio::test]
async fn test_close_rolls_back_open_local_transaction() {
    let ctx = TestContext::new();
    let session = ctx
        .connection
        .create_session(AckMode::Transacted)
        .await
        .unwrap();
    session.transaction().begin().await.unwrap();
    assert!(session.transaction().is_in_local_transaction());

    session.close().await.unwrap();

    assert_eq!(
        transaction_kinds(&ctx),
        vec![TransactionType::Begin, TransactionType::Rollback]
    );
}

#[tokio::test]
async fn test_refused_commit_rolls_back() {
    let ctx = TestContext::new();
    let session = ctx
        .connection
        .create_session(AckMode::Transacted)
        .await
        .unwrap();
    let sync = Arc::new(RefusingSync::default());
    session.transaction().begin().await.unwrap();
    session.transaction().add_synchronization(sync.clone());

    let err = session.commit().await.unwrap_err();

    assert_eq!(err, ClientError::IllegalState("refusing to end".to_string()));
    assert_eq!(
        transaction_kinds(&ctx),
        vec![TransactionType::Begin, TransactionType::Rollback]
    );
    assert_eq!(sync.rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(session.transaction().state(), TransactionState::None);
}

#[tokio::test]
async fn test_rollback_reports_failed_before_end() {
    let ctx = TestContext::new();
    let session = ctx
        .connection
        .create_session(AckMode::Transacted)
        .await
        .unwrap();
    let sync = Arc::new(RefusingSync::default());
    session.transaction().begin().await.unwrap();
    session.transaction().add_synchronization(sync.clone());

    let err = session.rollback().await.unwrap_err();

    // The rollback itself still completes.
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    assert_eq!(
        transaction_kinds(&ctx),
        vec![TransactionType::Begin, TransactionType::Rollback]
    );
    assert_eq!(sync.rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(session.transaction().synchronization_count(), 0);
}

// ===== Close =====

#[tokio::test]
async fn test_close_is_idempotent() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    let producer = session.create_producer(None).await.unwrap();

    let suppressed = session.close().await.unwrap();
    assert!(suppressed.is_empty());
    assert!(session.is_closed());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(consumer.is_closed());
    assert!(producer.is_closed());
    assert_eq!(ctx.connection.dispatcher_count(), 0);
    assert!(ctx.connection.sessions().is_empty());
    assert_eq!(session_removes(&ctx), 1);

    ctx.transport.clear_sent();
    let suppressed = session.close().await.unwrap();
    assert!(suppressed.is_empty());
    assert!(ctx.transport.sent().is_empty());
}

#[tokio::test]
async fn test_resources_rejected_after_close() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    session.close().await.unwrap();
    let queue = Destination::queue("orders");

    let err = session.create_consumer(&queue, None, false).await.unwrap_err();
    assert_eq!(err, ClientError::closed("session"));
    let err = session.create_producer(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[tokio::test]
async fn test_close_reports_highest_delivered_sequence() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    ctx.connection.start().await.unwrap();
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();

    ctx.dispatch(consumer.id(), &queue, 41, "first");
    ctx.dispatch(consumer.id(), &queue, 42, "second");
    for _ in 0..2 {
        consumer
            .receive(Some(std::time::Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
    }
    session.close().await.unwrap();

    assert_eq!(session.last_delivered_sequence_id(), 42);
    let removes: Vec<i64> = ctx
        .sent_bodies("RemoveInfo")
        .into_iter()
        .filter_map(|b| match b {
            CommandBody::RemoveInfo(r) if matches!(r.object_id, ObjectId::Session(_)) => {
                Some(r.last_delivered_sequence_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(removes, vec![42]);
}

// ===== Deferred close =====

#[tokio::test]
async fn test_close_deferred_until_distributed_commit() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    session.transaction().begin_distributed(xid(1)).await.unwrap();
    assert_eq!(
        session.transaction().state(),
        TransactionState::InDistributedTransaction
    );

    session.close().await.unwrap();
    session.close().await.unwrap();

    assert!(!session.is_closed());
    assert_eq!(session.state(), SessionState::Closing);
    assert!(!consumer.is_closed());
    assert!(session.transaction().is_close_pending());
    assert_eq!(session.transaction().synchronization_count(), 1);
    assert_eq!(session_removes(&ctx), 0);

    session
        .transaction()
        .end_distributed(DistributedOutcome::Committed)
        .await
        .unwrap();

    assert!(session.is_closed());
    assert!(consumer.is_closed());
    assert!(!session.transaction().is_close_pending());
    assert_eq!(session_removes(&ctx), 1);

    session.close().await.unwrap();
    assert_eq!(session_removes(&ctx), 1);
}

#[tokio::test]
async fn test_close_deferred_until_distributed_rollback() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    session.transaction().begin_distributed(xid(2)).await.unwrap();

    session.close().await.unwrap();
    assert!(!session.is_closed());

    session
        .transaction()
        .end_distributed(DistributedOutcome::RolledBack)
        .await
        .unwrap();

    assert!(session.is_closed());
    assert_eq!(session_removes(&ctx), 1);
}

#[tokio::test]
async fn test_concurrent_close_registers_one_callback() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    session.transaction().begin_distributed(xid(3)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let session = session.clone();
        handles.push(tokio::spawn(async move { session.close().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(session.transaction().synchronization_count(), 1);
    session
        .transaction()
        .end_distributed(DistributedOutcome::Committed)
        .await
        .unwrap();
    assert_eq!(session_removes(&ctx), 1);
}

#[tokio::test]
async fn test_local_commit_rejected_in_distributed_transaction() {
    let ctx = TestContext::new();
    let session = ctx
        .connection
        .create_session(AckMode::Transacted)
        .await
        .unwrap();
    session.transaction().begin_distributed(xid(4)).await.unwrap();

    assert_eq!(
        session.commit().await.unwrap_err().kind(),
        ErrorKind::IllegalState
    );
    assert_eq!(
        session
            .transaction()
            .begin_distributed(xid(5))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::IllegalState
    );
}

#[tokio::test]
async fn test_close_after_distributed_end_is_immediate() {
    let ctx = TestContext::new();
    let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
    session.transaction().begin_distributed(xid(6)).await.unwrap();
    session
        .transaction()
        .end_distributed(DistributedOutcome::Committed)
        .await
        .unwrap();

    session.close().await.unwrap();

    assert!(session.is_closed());
    assert!(!session.transaction().is_close_pending());
    assert_eq!(session_removes(&ctx), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_distributed_end_always_closes() {
    for round in 0..50u8 {
        let ctx = TestContext::new();
        let session = ctx.connection.create_session(AckMode::Auto).await.unwrap();
        session.transaction().begin_distributed(xid(round)).await.unwrap();

        let closer = {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        };
        let ender = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .transaction()
                    .end_distributed(DistributedOutcome::Committed)
                    .await
            })
        };
        closer.await.unwrap().unwrap();
        ender.await.unwrap().unwrap();

        assert!(wait_until(|| session.is_closed()).await, "round {round}");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.transaction().is_close_pending());
        assert_eq!(session_removes(&ctx), 1);
    }
}
