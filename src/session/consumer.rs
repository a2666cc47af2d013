// src/session/consumer.rs

//! The consumer kernel: delivery, acknowledgement, and redelivery.

use super::AckMode;
use super::kernel::SessionKernel;
use super::transaction::Synchronization;
use crate::config::RedeliveryPolicy;
use crate::connection::ConnectionEngine;
use crate::core::commands::{
    AckType, Command, ConsumerId, ConsumerInfo, Message, MessageAck, MessageDispatch, MessagePull,
    RemoveInfo,
};
use crate::core::destination::Destination;
use crate::core::dispatch::MessageDispatchChannel;
use crate::core::errors::{ClientError, Result};
use crate::core::metrics;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Receives messages pushed by the session's delivery loop.
///
/// Returning an error in Auto, DupsOk or Individual mode rolls the message back
/// for redelivery.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

impl<F> MessageListener for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        self(message)
    }
}

#[derive(Debug, Default)]
struct AckState {
    /// Delivered but not yet acknowledged, newest first.
    delivered: VecDeque<MessageDispatch>,
    pending_ack: Option<MessageAck>,
    delivered_counter: u32,
}

pub struct ConsumerKernel {
    info: ConsumerInfo,
    ack_mode: AckMode,
    session: Weak<SessionKernel>,
    connection: Arc<ConnectionEngine>,
    redelivery_policy: RedeliveryPolicy,
    unconsumed: MessageDispatchChannel,
    acks: Mutex<AckState>,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    started: AtomicBool,
    closed: AtomicBool,
    sync_registered: AtomicBool,
    last_delivered_sequence_id: AtomicI64,
    weak_self: Weak<ConsumerKernel>,
}

impl std::fmt::Debug for ConsumerKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerKernel")
            .field("id", &self.info.consumer_id)
            .field("destination", &self.info.destination)
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConsumerKernel {
    pub(crate) fn new(
        info: ConsumerInfo,
        ack_mode: AckMode,
        session: Weak<SessionKernel>,
        connection: Arc<ConnectionEngine>,
    ) -> Arc<Self> {
        let redelivery_policy = connection.config().redelivery.clone();
        Arc::new_cyclic(|weak_self| Self {
            info,
            ack_mode,
            session,
            connection,
            redelivery_policy,
            unconsumed: MessageDispatchChannel::new(),
            acks: Mutex::new(AckState::default()),
            listener: RwLock::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sync_registered: AtomicBool::new(false),
            last_delivered_sequence_id: AtomicI64::new(-1),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> &ConsumerId {
        &self.info.consumer_id
    }

    pub fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    pub fn destination(&self) -> &Destination {
        &self.info.destination
    }

    pub fn selector(&self) -> Option<&str> {
        self.info.selector.as_deref()
    }

    pub fn prefetch_size(&self) -> u32 {
        self.info.prefetch_size
    }

    pub fn is_durable(&self) -> bool {
        self.info.subscription_name.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Highest broker sequence id handed to the application, or `-1`.
    pub fn last_delivered_sequence_id(&self) -> i64 {
        self.last_delivered_sequence_id.load(Ordering::Acquire)
    }

    /// Messages received from the broker and not yet handed out.
    pub fn unconsumed_count(&self) -> usize {
        self.unconsumed.len()
    }

    /// Messages handed out and not yet acknowledged.
    pub fn delivered_count(&self) -> usize {
        self.acks.lock().delivered.len()
    }

    pub fn start(&self) {
        if self.is_closed() {
            return;
        }
        self.started.store(true, Ordering::Release);
        self.unconsumed.start();
        if let Some(session) = self.session.upgrade() {
            session.wakeup();
        }
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.unconsumed.stop();
    }

    /// Installs a listener and routes any buffered messages through it.
    pub fn set_listener<L>(&self, listener: L) -> Result<()>
    where
        L: MessageListener + 'static,
    {
        self.check_closed()?;
        if self.info.prefetch_size == 0 {
            return Err(ClientError::IllegalState(
                "cannot set a listener on a consumer with zero prefetch".to_string(),
            ));
        }
        *self.listener.write() = Some(Arc::new(listener));
        if let Some(session) = self.session.upgrade() {
            let buffered = self.unconsumed.remove_all();
            if !buffered.is_empty() {
                session.redispatch(buffered);
            }
            session.wakeup();
        }
        Ok(())
    }

    pub fn clear_listener(&self) {
        self.listener.write().take();
    }

    pub fn has_listener(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Waits for the next message. `None` waits until one arrives or the
    /// consumer closes.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.check_receive()?;
        self.send_pull(timeout).await?;
        match self.unconsumed.dequeue(timeout).await {
            Some(dispatch) => self.consume_received(dispatch).await.map(Some),
            None => Ok(None),
        }
    }

    /// Takes a message only if one is already buffered.
    pub async fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.check_receive()?;
        match self.unconsumed.dequeue_no_wait() {
            Some(dispatch) => self.consume_received(dispatch).await.map(Some),
            None => Ok(None),
        }
    }

    async fn consume_received(&self, dispatch: MessageDispatch) -> Result<Message> {
        self.before_consumed(&dispatch).await?;
        let message = (*dispatch.message).clone();
        self.after_consumed(&dispatch).await?;
        Ok(message)
    }

    fn check_receive(&self) -> Result<()> {
        self.check_closed()?;
        if self.has_listener() {
            return Err(ClientError::IllegalState(
                "cannot receive synchronously while a listener is set".to_string(),
            ));
        }
        Ok(())
    }

    async fn send_pull(&self, timeout: Option<Duration>) -> Result<()> {
        if self.info.prefetch_size != 0 {
            return Ok(());
        }
        let pull = MessagePull {
            consumer_id: self.info.consumer_id.clone(),
            destination: self.info.destination.clone(),
            timeout_ms: timeout
                .map(|t| i64::try_from(t.as_millis()).unwrap_or(i64::MAX))
                .unwrap_or(0),
        };
        self.connection.oneway(Command::new(pull)).await
    }

    /// Called from the session's delivery loop for every routed dispatch.
    pub(crate) async fn dispatch(&self, dispatch: MessageDispatch) {
        if self.is_closed() {
            return;
        }
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) if self.unconsumed.is_running() => {
                self.deliver_to_listener(listener, dispatch).await;
            }
            _ => self.unconsumed.enqueue(dispatch),
        }
    }

    /// Offers one buffered message to the listener, if there is one.
    pub(crate) async fn iterate(&self) -> bool {
        let Some(listener) = self.listener.read().clone() else {
            return false;
        };
        match self.unconsumed.dequeue_no_wait() {
            Some(dispatch) => {
                self.deliver_to_listener(listener, dispatch).await;
                true
            }
            None => false,
        }
    }

    async fn deliver_to_listener(&self, listener: Arc<dyn MessageListener>, dispatch: MessageDispatch) {
        if let Err(e) = self.before_consumed(&dispatch).await {
            warn!("Consumer {}: failed to record delivery: {}", self.id(), e);
        }
        metrics::MESSAGES_DISPATCHED_TOTAL.inc();

        let outcome = listener.on_message(&dispatch.message);
        let result = match outcome {
            Ok(()) => self.after_consumed(&dispatch).await,
            Err(e) => {
                warn!("Consumer {}: listener failed: {:#}", self.id(), e);
                if self.ack_mode.is_auto() || self.ack_mode == AckMode::Individual {
                    self.rollback().await
                } else {
                    self.after_consumed(&dispatch).await
                }
            }
        };
        if let Err(e) = result {
            warn!("Consumer {}: acknowledgement failed: {}", self.id(), e);
        }
    }

    /// Auto-ack batching applies to DupsOk on topics.
    fn is_auto_ack_batch(&self) -> bool {
        self.ack_mode == AckMode::DupsOk && self.info.destination.is_topic()
    }

    /// Auto-ack of each message applies to Auto, and to DupsOk on queues.
    fn is_auto_ack_each(&self) -> bool {
        self.ack_mode == AckMode::Auto
            || (self.ack_mode == AckMode::DupsOk && self.info.destination.is_queue())
    }

    fn is_transacted(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.is_transacted())
    }

    async fn before_consumed(&self, dispatch: &MessageDispatch) -> Result<()> {
        self.last_delivered_sequence_id
            .store(dispatch.broker_sequence_id(), Ordering::Release);
        if self.is_auto_ack_batch() {
            return Ok(());
        }
        self.acks.lock().delivered.push_front(dispatch.clone());
        if self.is_transacted() {
            self.ack_later(dispatch, AckType::Delivered).await?;
        }
        Ok(())
    }

    async fn after_consumed(&self, dispatch: &MessageDispatch) -> Result<()> {
        if self.is_closed() || self.is_transacted() {
            return Ok(());
        }
        if self.is_auto_ack_each() {
            let ack = {
                let mut acks = self.acks.lock();
                let ack = self.ack_for_all_delivered(&acks, AckType::Standard);
                if ack.is_some() {
                    acks.delivered.clear();
                    acks.pending_ack = None;
                    acks.delivered_counter = 0;
                }
                ack
            };
            if let Some(ack) = ack {
                self.send_ack(ack, false).await?;
            }
        } else if self.is_auto_ack_batch() {
            self.ack_later(dispatch, AckType::Standard).await?;
        } else {
            self.ack_later(dispatch, AckType::Delivered).await?;
        }
        Ok(())
    }

    /// Folds `dispatch` into the pending ack and flushes it once half the
    /// prefetch window has been consumed.
    async fn ack_later(&self, dispatch: &MessageDispatch, ack_type: AckType) -> Result<()> {
        let transaction_id = if self.is_transacted() {
            self.register_sync();
            let Some(session) = self.session.upgrade() else {
                return Err(ClientError::closed("session"));
            };
            session.do_start_transaction().await?;
            session.transaction().transaction_id()
        } else {
            None
        };

        let ready = {
            let mut acks = self.acks.lock();
            acks.delivered_counter += 1;
            let first_message_id = acks
                .pending_ack
                .as_ref()
                .and_then(|a| a.first_message_id.clone())
                .or_else(|| dispatch.message.message_id.clone());
            acks.pending_ack = Some(MessageAck {
                consumer_id: self.info.consumer_id.clone(),
                destination: dispatch.destination.clone(),
                ack_type,
                first_message_id,
                last_message_id: dispatch.message.message_id.clone(),
                message_count: acks.delivered_counter,
                transaction_id,
                poison_cause: None,
            });
            let threshold = (self.info.prefetch_size as f64 * 0.5).max(1.0);
            if acks.delivered_counter as f64 >= threshold {
                acks.delivered_counter = 0;
                acks.pending_ack.take()
            } else {
                None
            }
        };
        if let Some(ack) = ready {
            self.send_ack(ack, false).await?;
        }
        Ok(())
    }

    fn ack_for_all_delivered(&self, acks: &AckState, ack_type: AckType) -> Option<MessageAck> {
        let last = acks.delivered.front()?;
        let first = acks.delivered.back()?;
        Some(MessageAck {
            consumer_id: self.info.consumer_id.clone(),
            destination: last.destination.clone(),
            ack_type,
            first_message_id: first.message.message_id.clone(),
            last_message_id: last.message.message_id.clone(),
            message_count: acks.delivered.len() as u32,
            transaction_id: None,
            poison_cause: None,
        })
    }

    async fn send_ack(&self, ack: MessageAck, force_async: bool) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => session.send_ack(ack, force_async).await,
            None => self.connection.oneway(Command::new(ack)).await,
        }
    }

    fn register_sync(&self) {
        if self.sync_registered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            session
                .transaction()
                .add_synchronization(Arc::new(ConsumerSynchronization {
                    consumer: self.weak_self.clone(),
                }));
        }
    }

    /// Acknowledges every message delivered so far (ClientAck mode).
    pub async fn acknowledge(&self) -> Result<()> {
        self.check_closed()?;
        let transacted = self.is_transacted();
        let transaction_id = if transacted {
            let Some(session) = self.session.upgrade() else {
                return Err(ClientError::closed("session"));
            };
            session.do_start_transaction().await?;
            session.transaction().transaction_id()
        } else {
            None
        };

        let ack = {
            let mut acks = self.acks.lock();
            let Some(mut ack) = self.ack_for_all_delivered(&acks, AckType::Standard) else {
                return Ok(());
            };
            ack.transaction_id = transaction_id;
            acks.pending_ack = None;
            acks.delivered_counter = 0;
            if !transacted {
                acks.delivered.clear();
            }
            ack
        };
        self.send_ack(ack, false).await
    }

    /// Acknowledges a single delivered message (Individual mode).
    pub async fn acknowledge_message(&self, message: &Message) -> Result<()> {
        self.check_closed()?;
        let Some(message_id) = message.message_id.clone() else {
            return Err(ClientError::IllegalState(
                "message has no id and cannot be acknowledged".to_string(),
            ));
        };
        let dispatch = {
            let mut acks = self.acks.lock();
            let position = acks
                .delivered
                .iter()
                .position(|d| d.message.message_id.as_ref() == Some(&message_id));
            match position.and_then(|p| acks.delivered.remove(p)) {
                Some(d) => d,
                None => return Ok(()),
            }
        };
        let transaction_id = self
            .session
            .upgrade()
            .and_then(|s| s.transaction().transaction_id());
        let ack = MessageAck {
            consumer_id: self.info.consumer_id.clone(),
            destination: dispatch.destination.clone(),
            ack_type: AckType::Individual,
            first_message_id: Some(message_id.clone()),
            last_message_id: Some(message_id),
            message_count: 1,
            transaction_id,
            poison_cause: None,
        };
        self.send_ack(ack, false).await
    }

    /// Flushes acknowledgements that are owed to the broker.
    pub async fn deliver_acks(&self) -> Result<()> {
        let ack = {
            let mut acks = self.acks.lock();
            if self.is_auto_ack_each() {
                let ack = self.ack_for_all_delivered(&acks, AckType::Standard);
                if ack.is_some() {
                    acks.delivered.clear();
                }
                ack
            } else {
                match &acks.pending_ack {
                    Some(p) if p.ack_type == AckType::Standard => {
                        acks.delivered_counter = 0;
                        acks.pending_ack.take()
                    }
                    _ => None,
                }
            }
        };
        match ack {
            Some(ack) => self.send_ack(ack, true).await,
            None => Ok(()),
        }
    }

    /// Sends the Standard ack that folds every delivered message into the
    /// ending transaction. Delivered messages are kept until the outcome is known.
    async fn ack_for_transaction(&self) -> Result<()> {
        let transaction_id = self
            .session
            .upgrade()
            .and_then(|s| s.transaction().transaction_id());
        let ack = {
            let mut acks = self.acks.lock();
            let Some(mut ack) = self.ack_for_all_delivered(&acks, AckType::Standard) else {
                return Ok(());
            };
            ack.transaction_id = transaction_id;
            acks.pending_ack = None;
            acks.delivered_counter = 0;
            ack
        };
        self.send_ack(ack, true).await
    }

    /// Forgets delivered messages once their transaction commits.
    pub(crate) fn commit(&self) {
        self.sync_registered.store(false, Ordering::Release);
        let mut acks = self.acks.lock();
        acks.delivered.clear();
        acks.pending_ack = None;
        acks.delivered_counter = 0;
    }

    /// Puts every delivered message back in front of the unconsumed queue.
    ///
    /// Messages past the redelivery limit are poisoned instead.
    pub async fn rollback(&self) -> Result<()> {
        self.sync_registered.store(false, Ordering::Release);
        let mut delivered: Vec<MessageDispatch> = {
            let mut acks = self.acks.lock();
            acks.pending_ack = None;
            acks.delivered_counter = 0;
            acks.delivered.drain(..).collect()
        };
        if delivered.is_empty() {
            return Ok(());
        }

        for dispatch in delivered.iter_mut() {
            dispatch.message.redelivery_counter += 1;
            dispatch.redelivery_counter = dispatch.message.redelivery_counter;
        }

        // `delivered` is newest first.
        let newest = &delivered[0];
        let oldest = &delivered[delivered.len() - 1];
        let redelivery_count = newest.message.redelivery_counter;
        let mut ack = MessageAck {
            consumer_id: self.info.consumer_id.clone(),
            destination: newest.destination.clone(),
            ack_type: AckType::Redelivered,
            first_message_id: oldest.message.message_id.clone(),
            last_message_id: newest.message.message_id.clone(),
            message_count: delivered.len() as u32,
            transaction_id: None,
            poison_cause: None,
        };

        if self.redelivery_policy.is_exhausted(redelivery_count) {
            debug!(
                "Consumer {}: poisoning {} messages after {} redeliveries",
                self.id(),
                delivered.len(),
                redelivery_count - 1
            );
            ack.ack_type = AckType::Poison;
            ack.poison_cause = Some(format!(
                "exceeded redelivery limit of {}",
                self.redelivery_policy.maximum_redeliveries
            ));
            return self.send_ack(ack, true).await;
        }

        let ack_result = self.send_ack(ack, true).await;

        metrics::MESSAGES_REDELIVERED_TOTAL.inc_by(delivered.len() as f64);
        delivered.reverse();
        let delay = self.redelivery_policy.delay_for(redelivery_count);
        if !delay.is_zero() && self.is_started() {
            self.unconsumed.stop();
            let consumer = self.weak_self.clone();
            self.connection.scheduler().execute_after_delay(
                Box::new(move || {
                    if let Some(consumer) = consumer.upgrade() {
                        if !consumer.is_closed() && consumer.is_started() {
                            consumer.unconsumed.start();
                            if let Some(session) = consumer.session.upgrade() {
                                session.wakeup();
                            }
                        }
                    }
                }),
                delay,
            );
        }

        match (self.has_listener(), self.session.upgrade()) {
            (true, Some(session)) => {
                let mut requeue = delivered;
                requeue.extend(self.unconsumed.remove_all());
                session.redispatch(requeue);
            }
            _ => self.unconsumed.requeue_front(delivered),
        }
        ack_result
    }

    /// Drops buffered messages so the broker can redeliver them.
    pub fn clear_messages_in_progress(&self) {
        let dropped = self.unconsumed.remove_all().len();
        let mut acks = self.acks.lock();
        acks.pending_ack = None;
        acks.delivered_counter = 0;
        if !self.is_transacted() {
            acks.delivered.clear();
        }
        if dropped > 0 {
            debug!("Consumer {}: cleared {} in-progress messages", self.id(), dropped);
        }
    }

    /// Closes the consumer and tells the broker to remove it.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.dispose().await?;
        let remove = RemoveInfo {
            object_id: self.info.consumer_id.clone().into(),
            last_delivered_sequence_id: self.last_delivered_sequence_id(),
        };
        self.connection.oneway(Command::new(remove)).await
    }

    /// Stops delivery and unregisters the consumer locally. Idempotent.
    pub(crate) async fn dispose(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let acks = if !self.is_transacted() {
            self.deliver_acks().await
        } else {
            Ok(())
        };

        self.started.store(false, Ordering::Release);
        self.unconsumed.close();
        self.unconsumed.clear();
        self.listener.write().take();
        if let Some(session) = self.session.upgrade() {
            session.remove_consumer(self.id());
        }
        metrics::ACTIVE_CONSUMERS.dec();
        debug!("Consumer {} disposed", self.id());
        acks
    }

    /// Marks a consumer whose broker registration never completed as closed.
    pub(crate) fn abandon(&self) {
        self.closed.store(true, Ordering::Release);
        self.unconsumed.close();
    }

    fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::closed("consumer"));
        }
        Ok(())
    }
}

/// Ties delivered messages to the outcome of the session's transaction.
struct ConsumerSynchronization {
    consumer: Weak<ConsumerKernel>,
}

#[async_trait]
impl Synchronization for ConsumerSynchronization {
    async fn before_end(&self) -> Result<()> {
        match self.consumer.upgrade() {
            Some(consumer) => consumer.ack_for_transaction().await,
            None => Ok(()),
        }
    }

    async fn after_commit(&self) -> Result<()> {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.commit();
        }
        Ok(())
    }

    async fn after_rollback(&self) -> Result<()> {
        match self.consumer.upgrade() {
            Some(consumer) => consumer.rollback().await,
            None => Ok(()),
        }
    }
}
