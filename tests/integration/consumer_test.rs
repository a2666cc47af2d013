// tests/integration/consumer_test.rs

//! Integration tests for message delivery, acknowledgement modes, and redelivery

use super::test_helpers::{TestContext, wait_until};
use mqsession::core::commands::{AckType, CommandBody, Message, MessageAck, TransactionType};
use mqsession::core::errors::ErrorKind;
use mqsession::session::AckMode;
use mqsession::Destination;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(1));

fn acks(ctx: &TestContext) -> Vec<MessageAck> {
    ctx.sent_bodies("MessageAck")
        .into_iter()
        .filter_map(|b| match b {
            CommandBody::MessageAck(ack) => Some(ack),
            _ => None,
        })
        .collect()
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

async fn started_session(ctx: &TestContext, mode: AckMode) -> mqsession::Session {
    let session = ctx.connection.create_session(mode).await.unwrap();
    ctx.connection.start().await.unwrap();
    session
}

// ===== Synchronous receive =====

#[tokio::test]
async fn test_receive_in_order_with_auto_ack() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();

    for (seq, body) in ["a", "b", "c"].iter().enumerate() {
        ctx.dispatch(consumer.id(), &queue, seq as u64 + 1, body);
    }

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let message = consumer.receive(WAIT).await.unwrap().unwrap();
        bodies.push(message.body_str().unwrap().to_string());
    }
    assert_eq!(bodies, vec!["a", "b", "c"]);

    let acks = acks(&ctx);
    assert_eq!(acks.len(), 3);
    assert!(acks.iter().all(|a| a.ack_type == AckType::Standard && a.message_count == 1));
    assert_eq!(consumer.delivered_count(), 0);
}

#[tokio::test]
async fn test_receive_times_out_when_empty() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();

    let received = consumer
        .receive(Some(Duration::from_millis(30)))
        .await
        .unwrap();
    assert!(received.is_none());
    assert!(consumer.receive_no_wait().await.unwrap().is_none());
}

#[tokio::test]
async fn test_stopped_consumer_buffers_messages() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    consumer.stop();

    ctx.dispatch(consumer.id(), &queue, 1, "held");
    let c = consumer.clone();
    assert!(wait_until(|| c.unconsumed_count() == 1).await);
    assert!(consumer.receive_no_wait().await.unwrap().is_none());

    consumer.start();
    let message = consumer.receive(WAIT).await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("held"));
}

#[tokio::test]
async fn test_unrouted_dispatch_is_dropped() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    consumer.close().await.unwrap();

    ctx.dispatch(consumer.id(), &queue, 1, "late");
    assert_eq!(ctx.connection.dispatcher_count(), 0);
    assert_eq!(
        consumer.receive_no_wait().await.unwrap_err().kind(),
        ErrorKind::IllegalState
    );
}

#[tokio::test]
async fn test_zero_prefetch_consumer_pulls() {
    let mut config = TestContext::test_config();
    config.prefetch.queue = 0;
    let ctx = TestContext::with_config(config);
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();

    let received = consumer
        .receive(Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert!(received.is_none());
    assert_eq!(ctx.sent_bodies("MessagePull").len(), 1);

    let err = consumer.set_listener(|_: &Message| -> anyhow::Result<()> { Ok(()) }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[tokio::test]
async fn test_pull_timeout_saturates() {
    let mut config = TestContext::test_config();
    config.prefetch.queue = 0;
    let ctx = TestContext::with_config(config);
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    ctx.dispatch(consumer.id(), &queue, 1, "pulled");

    let message = consumer.receive(Some(Duration::MAX)).await.unwrap().unwrap();
    assert_eq!(message.body_str().unwrap(), "pulled");

    let pulls: Vec<i64> = ctx
        .sent_bodies("MessagePull")
        .into_iter()
        .filter_map(|b| match b {
            CommandBody::MessagePull(pull) => Some(pull.timeout_ms),
            _ => None,
        })
        .collect();
    assert_eq!(pulls, vec![i64::MAX]);
}

// ===== Listener delivery =====

#[tokio::test]
async fn test_listener_receives_in_dispatch_order() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    consumer
        .set_listener(move |m: &Message| -> anyhow::Result<()> {
            sink.lock().unwrap().push(m.body_str().unwrap_or_default().to_string());
            Ok(())
        })
        .unwrap();

    for seq in 1..=5u64 {
        ctx.dispatch(consumer.id(), &queue, seq, &format!("m{seq}"));
    }

    assert!(wait_until(|| received.lock().unwrap().len() == 5).await);
    assert_eq!(
        *received.lock().unwrap(),
        vec!["m1", "m2", "m3", "m4", "m5"]
    );
    let err = consumer.receive_no_wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[tokio::test]
async fn test_listener_drains_buffered_messages() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    ctx.dispatch(consumer.id(), &queue, 1, "early-1");
    ctx.dispatch(consumer.id(), &queue, 2, "early-2");
    let c = consumer.clone();
    assert!(wait_until(|| c.unconsumed_count() == 2).await);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    consumer
        .set_listener(move |m: &Message| -> anyhow::Result<()> {
            sink.lock().unwrap().push(m.body_str().unwrap_or_default().to_string());
            Ok(())
        })
        .unwrap();
    ctx.dispatch(consumer.id(), &queue, 3, "late");

    assert!(wait_until(|| received.lock().unwrap().len() == 3).await);
    assert_eq!(*received.lock().unwrap(), vec!["early-1", "early-2", "late"]);
}

#[tokio::test]
async fn test_listener_failure_redelivers() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let sink = attempts.clone();
    consumer
        .set_listener(move |m: &Message| -> anyhow::Result<()> {
            let mut attempts = sink.lock().unwrap();
            attempts.push(m.redelivery_counter);
            if attempts.len() == 1 {
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        })
        .unwrap();

    ctx.dispatch(consumer.id(), &queue, 1, "retry-me");

    assert!(wait_until(|| attempts.lock().unwrap().len() == 2).await);
    assert_eq!(*attempts.lock().unwrap(), vec![0, 1]);
    let types: Vec<AckType> = acks(&ctx).iter().map(|a| a.ack_type).collect();
    assert_eq!(types, vec![AckType::Redelivered, AckType::Standard]);
}

// ===== Client and individual acknowledgement =====

#[tokio::test]
async fn test_client_ack_acknowledges_everything_delivered() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::ClientAck).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    for seq in 1..=3u64 {
        ctx.dispatch(consumer.id(), &queue, seq, "work");
    }
    for _ in 0..3 {
        consumer.receive(WAIT).await.unwrap().unwrap();
    }
    assert!(acks(&ctx).is_empty());
    assert_eq!(consumer.delivered_count(), 3);

    session.acknowledge().await.unwrap();

    let acks = acks(&ctx);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckType::Standard);
    assert_eq!(acks[0].message_count, 3);
    assert_eq!(
        acks[0].first_message_id.as_ref().unwrap().producer_sequence_id,
        1
    );
    assert_eq!(
        acks[0].last_message_id.as_ref().unwrap().producer_sequence_id,
        3
    );
    assert_eq!(consumer.delivered_count(), 0);
}

#[tokio::test]
async fn test_individual_ack_acknowledges_one_message() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Individual).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    ctx.dispatch(consumer.id(), &queue, 1, "one");
    ctx.dispatch(consumer.id(), &queue, 2, "two");
    let first = consumer.receive(WAIT).await.unwrap().unwrap();
    let _second = consumer.receive(WAIT).await.unwrap().unwrap();

    consumer.acknowledge_message(&first).await.unwrap();

    let acks = acks(&ctx);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckType::Individual);
    assert_eq!(acks[0].first_message_id, first.message_id);
    assert_eq!(acks[0].last_message_id, first.message_id);
    assert_eq!(consumer.delivered_count(), 1);
}

#[tokio::test]
async fn test_dups_ok_topic_acks_in_batches() {
    let mut config = TestContext::test_config();
    config.prefetch.topic = 4;
    let ctx = TestContext::with_config(config);
    let session = started_session(&ctx, AckMode::DupsOk).await;
    let topic = Destination::topic("prices");
    let consumer = session.create_consumer(&topic, None, false).await.unwrap();

    for seq in 1..=3u64 {
        ctx.dispatch(consumer.id(), &topic, seq, "tick");
        consumer.receive(WAIT).await.unwrap().unwrap();
    }

    // Half the prefetch window (2) flushes one batch; the third stays pending.
    let sent = acks(&ctx);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ack_type, AckType::Standard);
    assert_eq!(sent[0].message_count, 2);

    session.deliver_acks().await.unwrap();
    let sent = acks(&ctx);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].message_count, 1);
}

// ===== Recovery and redelivery =====

#[tokio::test]
async fn test_recover_redelivers_in_original_order() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::ClientAck).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    for seq in 1..=3u64 {
        ctx.dispatch(consumer.id(), &queue, seq, &format!("m{seq}"));
    }
    for _ in 0..3 {
        consumer.receive(WAIT).await.unwrap().unwrap();
    }

    session.recover().await.unwrap();

    let mut redelivered = Vec::new();
    for _ in 0..3 {
        let message = consumer.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(message.redelivery_counter, 1);
        redelivered.push(message.body_str().unwrap().to_string());
    }
    assert_eq!(redelivered, vec!["m1", "m2", "m3"]);
    let acks = acks(&ctx);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckType::Redelivered);
    assert_eq!(acks[0].message_count, 3);
}

#[tokio::test]
async fn test_exhausted_redelivery_poisons() {
    let mut config = TestContext::test_config();
    config.redelivery.maximum_redeliveries = 1;
    let ctx = TestContext::with_config(config);
    let session = started_session(&ctx, AckMode::ClientAck).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    ctx.dispatch(consumer.id(), &queue, 1, "poison-pill");

    consumer.receive(WAIT).await.unwrap().unwrap();
    session.recover().await.unwrap();
    let again = consumer.receive(WAIT).await.unwrap().unwrap();
    assert_eq!(again.redelivery_counter, 1);
    session.recover().await.unwrap();

    assert!(consumer.receive_no_wait().await.unwrap().is_none());
    let acks = acks(&ctx);
    let types: Vec<AckType> = acks.iter().map(|a| a.ack_type).collect();
    assert_eq!(types, vec![AckType::Redelivered, AckType::Poison]);
    assert!(acks[1].poison_cause.is_some());
}

#[tokio::test]
async fn test_redelivery_delay_pauses_consumer() {
    let mut config = TestContext::test_config();
    config.redelivery.initial_redelivery_delay = Duration::from_millis(100);
    let ctx = TestContext::with_config(config);
    let session = started_session(&ctx, AckMode::ClientAck).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    ctx.dispatch(consumer.id(), &queue, 1, "slow");
    consumer.receive(WAIT).await.unwrap().unwrap();

    session.recover().await.unwrap();

    assert!(consumer.receive_no_wait().await.unwrap().is_none());
    let message = consumer.receive(WAIT).await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("slow"));
    assert_eq!(message.redelivery_counter, 1);
}

#[tokio::test]
async fn test_clear_messages_in_progress_drops_buffered() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Auto).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    consumer.stop();
    ctx.dispatch(consumer.id(), &queue, 1, "stale");
    let c = consumer.clone();
    assert!(wait_until(|| c.unconsumed_count() == 1).await);

    session.clear_messages_in_progress();

    let c = consumer.clone();
    assert!(wait_until(|| c.unconsumed_count() == 0).await);
}

// ===== Transacted sessions =====

#[tokio::test]
async fn test_transacted_commit_acks_within_transaction() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Transacted).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    ctx.dispatch(consumer.id(), &queue, 1, "a");
    ctx.dispatch(consumer.id(), &queue, 2, "b");
    consumer.receive(WAIT).await.unwrap().unwrap();
    consumer.receive(WAIT).await.unwrap().unwrap();
    let transaction_id = session.transaction().transaction_id();
    assert!(transaction_id.is_some());

    session.commit().await.unwrap();

    assert_eq!(
        transaction_kinds(&ctx),
        vec![TransactionType::Begin, TransactionType::CommitOnePhase]
    );
    let acks = acks(&ctx);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ack_type, AckType::Standard);
    assert_eq!(acks[0].message_count, 2);
    assert_eq!(acks[0].transaction_id, transaction_id);
    assert_eq!(consumer.delivered_count(), 0);
    assert!(session.transaction().transaction_id().is_none());
}

#[tokio::test]
async fn test_transacted_rollback_redelivers() {
    let ctx = TestContext::new();
    let session = started_session(&ctx, AckMode::Transacted).await;
    let queue = Destination::queue("orders");
    let consumer = session.create_consumer(&queue, None, false).await.unwrap();
    ctx.dispatch(consumer.id(), &queue, 1, "a");
    ctx.dispatch(consumer.id(), &queue, 2, "b");
    consumer.receive(WAIT).await.unwrap().unwrap();
    consumer.receive(WAIT).await.unwrap().unwrap();

    session.rollback().await.unwrap();

    assert_eq!(
        transaction_kinds(&ctx),
        vec![TransactionType::Begin, TransactionType::Rollback]
    );
    let first = consumer.receive(WAIT).await.unwrap().unwrap();
    let second = consumer.receive(WAIT).await.unwrap().unwrap();
    assert_eq!(first.body_str(), Some("a"));
    assert_eq!(second.body_str(), Some("b"));
    assert_eq!(first.redelivery_counter, 1);
    assert!(acks(&ctx).iter().any(|a| a.ack_type == AckType::Redelivered));
}
