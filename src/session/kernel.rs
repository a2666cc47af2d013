// src/session/kernel.rs

//! The session kernel: lifecycle, resource registries, and the close protocol.

use super::AckMode;
use super::consumer::ConsumerKernel;
use super::producer::{ProducerKernel, SendOptions};
use super::registration::ConsumerRegistration;
use super::transaction::{CloseDeferral, Synchronization, TransactionContext};
use crate::connection::ConnectionEngine;
use crate::core::commands::{
    Command, ConsumerId, ConsumerInfo, Message, MessageAck, MessageDispatch, MessageId, ProducerId,
    ProducerInfo, RemoveInfo, RemoveSubscriptionInfo, SessionId, SessionInfo,
};
use crate::core::destination::{Destination, MessageDestination};
use crate::core::dispatch::{DispatchExecutor, Dispatcher};
use crate::core::errors::{ClientError, Result, Suppressed};
use crate::core::identity::IdentityGenerator;
use crate::core::metrics;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// What `dispose` hands back to the close paths.
pub(crate) struct Teardown {
    pub suppressed: Suppressed,
    pub consumer_ids: Vec<ConsumerId>,
    pub last_delivered_sequence_id: i64,
}

pub struct SessionKernel {
    info: SessionInfo,
    ack_mode: AckMode,
    connection: Arc<ConnectionEngine>,
    transaction: Arc<TransactionContext>,
    executor: DispatchExecutor,
    consumers: RwLock<BTreeMap<ConsumerId, Arc<ConsumerKernel>>>,
    producers: RwLock<BTreeMap<ProducerId, Arc<ProducerKernel>>>,
    consumer_ids: IdentityGenerator,
    producer_ids: IdentityGenerator,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    last_delivered_sequence_id: AtomicI64,
    /// Serializes sends so message ids and transaction begins stay ordered.
    send_lock: tokio::sync::Mutex<()>,
    weak_self: Weak<SessionKernel>,
}

impl std::fmt::Debug for SessionKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKernel")
            .field("id", &self.info.session_id)
            .field("ack_mode", &self.ack_mode)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionKernel {
    pub(crate) fn new(
        connection: Arc<ConnectionEngine>,
        session_id: SessionId,
        ack_mode: AckMode,
    ) -> Arc<Self> {
        let transaction = Arc::new(TransactionContext::new(Arc::clone(&connection)));
        Arc::new_cyclic(|weak_self| Self {
            info: SessionInfo { session_id },
            ack_mode,
            connection,
            transaction,
            executor: DispatchExecutor::new(),
            consumers: RwLock::new(BTreeMap::new()),
            producers: RwLock::new(BTreeMap::new()),
            consumer_ids: IdentityGenerator::new(),
            producer_ids: IdentityGenerator::new(),
            state: Mutex::new(SessionState::Active),
            closed: AtomicBool::new(false),
            last_delivered_sequence_id: AtomicI64::new(-1),
            send_lock: tokio::sync::Mutex::new(()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.info.session_id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.executor.is_running()
    }

    /// True for transacted sessions and while a distributed transaction is active.
    pub fn is_transacted(&self) -> bool {
        self.ack_mode == AckMode::Transacted || self.transaction.is_in_distributed_transaction()
    }

    pub fn transaction(&self) -> &Arc<TransactionContext> {
        &self.transaction
    }

    pub fn connection(&self) -> &Arc<ConnectionEngine> {
        &self.connection
    }

    /// The watermark reported to the broker when the session was removed.
    pub fn last_delivered_sequence_id(&self) -> i64 {
        self.last_delivered_sequence_id.load(Ordering::Acquire)
    }

    pub fn consumers(&self) -> Vec<Arc<ConsumerKernel>> {
        self.consumers.read().values().cloned().collect()
    }

    pub fn producers(&self) -> Vec<Arc<ProducerKernel>> {
        self.producers.read().values().cloned().collect()
    }

    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<ConsumerKernel>> {
        self.consumers.read().get(id).cloned()
    }

    fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::closed("session"));
        }
        Ok(())
    }

    // --- Delivery ---

    /// Starts the consumers and the delivery loop.
    pub fn start(&self) -> Result<()> {
        self.check_closed()?;
        for consumer in self.consumers() {
            consumer.start();
        }
        let target: Weak<dyn Dispatcher> = self.weak_self.clone();
        self.executor.start(target)
    }

    /// Pauses delivery. Queued messages are kept.
    pub fn stop(&self) {
        self.executor.stop();
        for consumer in self.consumers() {
            consumer.stop();
        }
    }

    /// Queues a dispatch routed here by the connection. Never blocks.
    pub(crate) fn enqueue_dispatch(&self, dispatch: MessageDispatch) {
        if self.is_closed() {
            return;
        }
        self.executor.execute(dispatch);
    }

    /// Puts `unconsumed` back at the head of the delivery queue, in order.
    pub fn redispatch(&self, unconsumed: Vec<MessageDispatch>) {
        self.executor.redispatch(unconsumed);
    }

    pub fn wakeup(&self) {
        self.executor.wakeup();
    }

    // --- Resource creation ---

    /// Creates a consumer on `destination`.
    pub async fn create_consumer(
        &self,
        destination: &dyn MessageDestination,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<Arc<ConsumerKernel>> {
        self.create_consumer_internal(destination, selector, no_local, None)
            .await
    }

    /// Creates a durable subscription named `name` on `topic`.
    pub async fn create_durable_consumer(
        &self,
        topic: &dyn MessageDestination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<Arc<ConsumerKernel>> {
        if name.trim().is_empty() {
            return Err(ClientError::IllegalState(
                "durable subscription name cannot be empty".to_string(),
            ));
        }
        self.create_consumer_internal(topic, selector, no_local, Some(name.to_string()))
            .await
    }

    async fn create_consumer_internal(
        &self,
        destination: &dyn MessageDestination,
        selector: Option<&str>,
        no_local: bool,
        subscription_name: Option<String>,
    ) -> Result<Arc<ConsumerKernel>> {
        self.check_closed()?;
        let destination = destination.as_wire().cloned().ok_or_else(|| {
            ClientError::InvalidDestination("destination was not created by this client".to_string())
        })?;
        if subscription_name.is_some() && !destination.is_topic() {
            return Err(ClientError::InvalidDestination(format!(
                "durable subscriptions require a topic, got {destination}"
            )));
        }
        self.connection.check_consumable(&destination)?;

        let prefetch = &self.connection.config().prefetch;
        let prefetch_size = if subscription_name.is_some() {
            prefetch.durable_topic
        } else if destination.is_topic() {
            prefetch.topic
        } else {
            prefetch.queue
        };

        let consumer_id = ConsumerId::new(self.id().clone(), self.consumer_ids.next()?);
        let info = ConsumerInfo {
            consumer_id,
            destination,
            selector: selector.map(str::to_string),
            no_local,
            prefetch_size,
            subscription_name,
            dispatch_async: self.connection.config().dispatch_async,
        };
        let consumer = ConsumerKernel::new(
            info.clone(),
            self.ack_mode,
            self.weak_self.clone(),
            Arc::clone(&self.connection),
        );

        let this = self.arc()?;
        let registration = ConsumerRegistration::tentative(&this, consumer);
        self.connection
            .sync_request(Command::new(info), Duration::ZERO)
            .await?;
        let consumer = registration.confirm();
        metrics::ACTIVE_CONSUMERS.inc();

        if self.connection.is_started() {
            consumer.start();
        }
        debug!("Session {}: created consumer {}", self.id(), consumer.id());
        Ok(consumer)
    }

    /// Creates a producer, optionally bound to one destination.
    pub async fn create_producer(
        &self,
        destination: Option<&dyn MessageDestination>,
    ) -> Result<Arc<ProducerKernel>> {
        self.check_closed()?;
        let destination = match destination {
            Some(d) => Some(d.as_wire().cloned().ok_or_else(|| {
                ClientError::InvalidDestination(
                    "destination was not created by this client".to_string(),
                )
            })?),
            None => None,
        };

        let producer_id = ProducerId::new(self.id().clone(), self.producer_ids.next()?);
        let info = ProducerInfo {
            producer_id: producer_id.clone(),
            destination,
        };
        let producer = Arc::new(ProducerKernel::new(info.clone(), self.weak_self.clone()));

        self.producers
            .write()
            .insert(producer_id.clone(), Arc::clone(&producer));
        if let Err(e) = self.connection.oneway(Command::new(info)).await {
            self.producers.write().remove(&producer_id);
            return Err(e);
        }
        debug!("Session {}: created producer {}", self.id(), producer_id);
        Ok(producer)
    }

    pub fn create_queue(&self, name: &str) -> Result<Destination> {
        self.check_closed()?;
        if name.trim().is_empty() {
            return Err(ClientError::InvalidDestination(
                "destination name cannot be empty".to_string(),
            ));
        }
        Ok(Destination::queue(name))
    }

    pub fn create_topic(&self, name: &str) -> Result<Destination> {
        self.check_closed()?;
        if name.trim().is_empty() {
            return Err(ClientError::InvalidDestination(
                "destination name cannot be empty".to_string(),
            ));
        }
        Ok(Destination::topic(name))
    }

    pub async fn create_temporary_queue(&self) -> Result<Destination> {
        self.check_closed()?;
        self.connection.create_temporary_destination(false).await
    }

    pub async fn create_temporary_topic(&self) -> Result<Destination> {
        self.check_closed()?;
        self.connection.create_temporary_destination(true).await
    }

    /// Removes a durable subscription from the broker.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.check_closed()?;
        let command = RemoveSubscriptionInfo {
            connection_id: self.connection.id().clone(),
            client_id: self.connection.client_id().to_string(),
            subscription_name: name.to_string(),
        };
        self.connection
            .sync_request(Command::new(command), Duration::ZERO)
            .await?;
        Ok(())
    }

    // --- Registry maintenance ---

    pub(crate) fn insert_consumer(&self, consumer: Arc<ConsumerKernel>) {
        self.consumers
            .write()
            .insert(consumer.id().clone(), consumer);
    }

    pub(crate) fn remove_consumer_entry(&self, id: &ConsumerId) -> Option<Arc<ConsumerKernel>> {
        self.consumers.write().remove(id)
    }

    /// Called by a consumer disposing itself.
    ///
    /// While the session is tearing down, routing entries are left for the
    /// session to detach after the broker has been told.
    pub(crate) fn remove_consumer(&self, id: &ConsumerId) {
        self.remove_consumer_entry(id);
        if !self.is_closed() {
            self.connection.remove_dispatcher(id);
        }
    }

    pub(crate) fn remove_producer(&self, id: &ProducerId) {
        self.producers.write().remove(id);
    }

    fn arc(&self) -> Result<Arc<SessionKernel>> {
        self.weak_self
            .upgrade()
            .ok_or_else(|| ClientError::closed("session"))
    }

    // --- Sending ---

    pub(crate) async fn send(
        &self,
        producer: &ProducerKernel,
        destination: Destination,
        message: &mut Message,
        options: SendOptions,
    ) -> Result<MessageId> {
        self.check_closed()?;
        if destination.owner_connection() == Some(self.connection.id().value())
            && !self.connection.is_temporary_destination_live(&destination)
        {
            return Err(ClientError::InvalidDestination(format!(
                "temporary destination {destination} has been deleted"
            )));
        }

        let _guard = self.send_lock.lock().await;
        message.clear_send_state();
        self.do_start_transaction().await?;
        let transaction_id = self.transaction.transaction_id();

        let message_id = MessageId::new(producer.id().clone(), producer.next_sequence()?);
        message.message_id = Some(message_id.clone());
        message.producer_id = Some(producer.id().clone());
        message.destination = Some(destination);
        message.delivery_mode = options.delivery_mode;
        message.priority = options.priority;
        let now = chrono::Utc::now().timestamp_millis();
        message.timestamp = if options.disable_timestamp { 0 } else { now };
        message.expiration = if options.time_to_live.is_zero() {
            0
        } else {
            now + options.time_to_live.as_millis() as i64
        };
        message.transaction_id = transaction_id.clone();

        let config = self.connection.config();
        let synchronous = !config.send_timeout.is_zero()
            || message.response_required
            || config.always_sync_send
            || (message.is_persistent() && !config.use_async_send && transaction_id.is_none());

        let command = Command::new(message.clone());
        if synchronous {
            self.connection
                .sync_request(command, config.send_timeout)
                .await?;
        } else {
            self.connection.oneway(command).await?;
        }
        metrics::MESSAGES_SENT_TOTAL.inc();
        Ok(message_id)
    }

    /// Begins the local transaction on first use in a transacted session.
    pub(crate) async fn do_start_transaction(&self) -> Result<()> {
        if self.ack_mode == AckMode::Transacted && !self.transaction.is_in_distributed_transaction()
        {
            self.transaction.begin().await?;
        }
        Ok(())
    }

    pub(crate) async fn send_ack(&self, ack: MessageAck, force_async: bool) -> Result<()> {
        let command = Command::new(ack);
        if force_async || self.connection.config().send_acks_async || self.is_transacted() {
            self.connection.oneway(command).await
        } else {
            self.connection
                .sync_request(command, Duration::ZERO)
                .await
                .map(|_| ())
        }
    }

    // --- Transactions and acknowledgement ---

    pub async fn commit(&self) -> Result<()> {
        self.check_closed()?;
        if self.ack_mode != AckMode::Transacted {
            return Err(ClientError::IllegalState(
                "session is not transacted".to_string(),
            ));
        }
        self.transaction.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.check_closed()?;
        if self.ack_mode != AckMode::Transacted {
            return Err(ClientError::IllegalState(
                "session is not transacted".to_string(),
            ));
        }
        self.transaction.rollback().await
    }

    /// Redelivers every unacknowledged message of every consumer.
    pub async fn recover(&self) -> Result<()> {
        self.check_closed()?;
        if self.ack_mode == AckMode::Transacted {
            return Err(ClientError::IllegalState(
                "cannot recover a transacted session".to_string(),
            ));
        }
        for consumer in self.consumers() {
            consumer.rollback().await?;
        }
        Ok(())
    }

    /// Acknowledges everything delivered to every consumer.
    pub async fn acknowledge(&self) -> Result<()> {
        self.check_closed()?;
        for consumer in self.consumers() {
            consumer.acknowledge().await?;
        }
        Ok(())
    }

    pub async fn deliver_acks(&self) -> Result<()> {
        for consumer in self.consumers() {
            consumer.deliver_acks().await?;
        }
        Ok(())
    }

    /// Drops queued and buffered messages, deferring each consumer's part to
    /// the scheduler.
    pub fn clear_messages_in_progress(&self) {
        let dropped = self.executor.clear();
        if !dropped.is_empty() {
            debug!(
                "Session {}: dropped {} queued dispatches",
                self.id(),
                dropped.len()
            );
        }
        let scheduler = self.connection.scheduler();
        for consumer in self.consumers() {
            scheduler.execute_after_delay(
                Box::new(move || consumer.clear_messages_in_progress()),
                Duration::ZERO,
            );
        }
    }

    // --- Close ---

    /// Closes the session.
    ///
    /// Inside a distributed transaction the teardown is deferred until that
    /// transaction completes; the first such call registers the callback and
    /// later calls do nothing. Returns the failures absorbed during teardown.
    pub async fn close(&self) -> Result<Suppressed> {
        if self.is_closed() {
            return Ok(Suppressed::new());
        }
        let deferral = self.transaction.defer_close(Arc::new(CloseSynchronization {
            session: self.weak_self.clone(),
        }));
        match deferral {
            CloseDeferral::NotDistributed => self.do_close().await,
            CloseDeferral::Registered => {
                debug!(
                    "Session {}: close deferred until the distributed transaction completes",
                    self.id()
                );
                let mut state = self.state.lock();
                if !self.is_closed() {
                    *state = SessionState::Closing;
                }
                Ok(Suppressed::new())
            }
            CloseDeferral::AlreadyPending => Ok(Suppressed::new()),
        }
    }

    /// Tears the session down and tells the broker to remove it.
    pub(crate) async fn do_close(&self) -> Result<Suppressed> {
        let Some(teardown) = self.dispose().await else {
            return Ok(Suppressed::new());
        };
        let remove = RemoveInfo {
            object_id: self.id().clone().into(),
            last_delivered_sequence_id: teardown.last_delivered_sequence_id,
        };
        let result = self.connection.oneway(Command::new(remove)).await;
        for id in &teardown.consumer_ids {
            self.connection.remove_dispatcher(id);
        }
        info!("Session {} closed", self.id());
        result.map(|_| teardown.suppressed)
    }

    /// Releases every resource the session owns. Runs once; later calls
    /// return `None`.
    pub(crate) async fn dispose(&self) -> Option<Teardown> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        *self.state.lock() = SessionState::Closing;
        self.executor.close();

        let mut suppressed = Suppressed::new();
        if self.transaction.is_in_local_transaction() {
            suppressed.absorb("rollback on close", self.transaction.rollback().await);
        }

        // Snapshot under the lock, dispose outside it.
        let consumers: Vec<Arc<ConsumerKernel>> =
            std::mem::take(&mut *self.consumers.write()).into_values().collect();
        let mut last_delivered = -1i64;
        for consumer in &consumers {
            suppressed.absorb(
                format!("disposing consumer {}", consumer.id()),
                consumer.dispose().await,
            );
            last_delivered = last_delivered.max(consumer.last_delivered_sequence_id());
        }

        let producers: Vec<Arc<ProducerKernel>> =
            std::mem::take(&mut *self.producers.write()).into_values().collect();
        for producer in &producers {
            producer.dispose();
        }

        self.connection.remove_session(self.id());
        self.last_delivered_sequence_id
            .store(last_delivered, Ordering::Release);
        *self.state.lock() = SessionState::Closed;
        metrics::ACTIVE_SESSIONS.dec();

        Some(Teardown {
            suppressed,
            consumer_ids: consumers.iter().map(|c| c.id().clone()).collect(),
            last_delivered_sequence_id: last_delivered,
        })
    }
}

#[async_trait]
impl Dispatcher for SessionKernel {
    async fn dispatch(&self, dispatch: MessageDispatch) {
        match self.consumer(&dispatch.consumer_id) {
            Some(consumer) => consumer.dispatch(dispatch).await,
            None => debug!(
                "Session {}: no consumer {} for dispatch, dropping",
                self.id(),
                dispatch.consumer_id
            ),
        }
    }

    async fn iterate(&self) -> bool {
        for consumer in self.consumers() {
            if consumer.iterate().await {
                return true;
            }
        }
        false
    }
}

/// Runs the deferred close once the distributed transaction completes.
struct CloseSynchronization {
    session: Weak<SessionKernel>,
}

impl CloseSynchronization {
    async fn close_now(&self) -> Result<()> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let result = session.do_close().await;
        session.transaction.clear_close_sync();
        result.map(|_| ())
    }
}

#[async_trait]
impl Synchronization for CloseSynchronization {
    async fn after_commit(&self) -> Result<()> {
        self.close_now().await
    }

    async fn after_rollback(&self) -> Result<()> {
        self.close_now().await
    }
}
