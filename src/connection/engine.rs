// src/connection/engine.rs

//! The connection engine: link state, command correlation, and dispatch routing.

use super::state::ConnectionState;
use crate::config::ClientConfig;
use crate::core::commands::{
    Command, CommandBody, ConnectionId, ConnectionInfo, ConsumerId, DestinationInfo,
    DestinationOperation, ObjectId, RemoveInfo, SessionId, ShutdownInfo, TransactionId,
};
use crate::core::correlator::RequestCorrelator;
use crate::core::destination::Destination;
use crate::core::errors::{ClientError, Result, Suppressed};
use crate::core::identity::IdentityGenerator;
use crate::core::metrics;
use crate::core::scheduler::{Scheduler, TokioScheduler};
use crate::core::transport::{Transport, TransportListener};
use crate::session::{AckMode, SessionKernel};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Receives failures the transport reports outside of `close()`.
pub type ExceptionListener = Arc<dyn Fn(&ClientError) + Send + Sync>;

pub struct ConnectionEngine {
    id: ConnectionId,
    client_id: String,
    config: ClientConfig,
    correlator: RequestCorrelator,
    scheduler: Arc<dyn Scheduler>,
    state: RwLock<ConnectionState>,
    started: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    /// Serializes the handshake against `close()`.
    lifecycle: tokio::sync::Mutex<()>,
    sessions: RwLock<Vec<Arc<SessionKernel>>>,
    /// Routes inbound dispatches by consumer id.
    dispatchers: DashMap<ConsumerId, Arc<SessionKernel>>,
    temporary_destinations: DashMap<String, Destination>,
    session_ids: IdentityGenerator,
    temp_destination_ids: IdentityGenerator,
    transaction_ids: IdentityGenerator,
    exception_listener: RwLock<Option<ExceptionListener>>,
    first_failure: Mutex<Option<ClientError>>,
}

impl std::fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("started", &self.is_started())
            .finish()
    }
}

impl ConnectionEngine {
    /// Creates a connection with a freshly generated id.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Arc<Self> {
        Self::with_id(transport, config, ConnectionId::generate())
    }

    pub fn with_id(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        id: ConnectionId,
    ) -> Arc<Self> {
        Self::with_scheduler(transport, config, id, Arc::new(TokioScheduler::new()))
    }

    pub fn with_scheduler(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        id: ConnectionId,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| id.value().to_string());
        let correlator = RequestCorrelator::new(Arc::clone(&transport), config.request_timeout);
        let engine = Arc::new(Self {
            id,
            client_id,
            config,
            correlator,
            scheduler,
            state: RwLock::new(ConnectionState::Disconnected),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            sessions: RwLock::new(Vec::new()),
            dispatchers: DashMap::new(),
            temporary_destinations: DashMap::new(),
            session_ids: IdentityGenerator::new(),
            temp_destination_ids: IdentityGenerator::new(),
            transaction_ids: IdentityGenerator::new(),
            exception_listener: RwLock::new(None),
            first_failure: Mutex::new(None),
        });
        let weak: Weak<ConnectionEngine> = Arc::downgrade(&engine);
        let listener: Weak<dyn TransportListener> = weak;
        transport.set_listener(listener);
        engine
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The failure that moved the connection into the `Error` state, if any.
    pub fn first_failure(&self) -> Option<ClientError> {
        self.first_failure.lock().clone()
    }

    /// Correlated requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn sessions(&self) -> Vec<Arc<SessionKernel>> {
        self.sessions.read().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Connection {}: {} -> {}", self.id, *current, state);
            *current = state;
        }
    }

    fn check_closed_or_failed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::closed("connection"));
        }
        if self.state() == ConnectionState::Error {
            let cause = self
                .first_failure()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(ClientError::ProtocolIo(format!("connection has failed: {cause}")));
        }
        Ok(())
    }

    // --- Lifecycle ---

    /// Starts the transport and performs the handshake once.
    async fn ensure_connection_info_sent(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.check_closed_or_failed()?;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let handshake = async {
            self.correlator.transport().start().await?;
            let info = ConnectionInfo {
                connection_id: self.id.clone(),
                client_id: self.client_id.clone(),
                username: self.config.username.clone(),
                password: self.config.password.clone(),
            };
            self.correlator
                .request(Command::new(info), Duration::ZERO)
                .await
        };
        match handshake.await {
            Ok(_) => {
                self.set_state(ConnectionState::Connected);
                info!("Connection {} established", self.id);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Connects if needed and starts delivery on every session.
    ///
    /// Fails with `IllegalState` if the connection is already started.
    pub async fn start(&self) -> Result<()> {
        self.check_closed_or_failed()?;
        if self.is_started() {
            return Err(ClientError::IllegalState(
                "connection is already started".to_string(),
            ));
        }
        self.ensure_connection_info_sent().await?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ClientError::IllegalState(
                "connection is already started".to_string(),
            ));
        }
        for session in self.sessions() {
            session.start()?;
        }
        info!("Connection {} started", self.id);
        Ok(())
    }

    /// Pauses delivery on every session.
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            for session in self.sessions() {
                session.stop();
            }
            debug!("Connection {} stopped", self.id);
        }
    }

    /// Closes every session and the transport. Idempotent.
    ///
    /// Failures while releasing resources are absorbed and returned; the
    /// transport is closed regardless.
    pub async fn close(&self) -> Result<Suppressed> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(Suppressed::new());
        }
        let _lifecycle = self.lifecycle.lock().await;
        let mut suppressed = Suppressed::new();
        let was_connected = self.state() == ConnectionState::Connected;

        self.stop();

        let sessions = std::mem::take(&mut *self.sessions.write());
        let mut last_delivered = -1i64;
        for session in &sessions {
            if let Some(teardown) = session.dispose().await {
                last_delivered = last_delivered.max(teardown.last_delivered_sequence_id);
                suppressed.extend(teardown.suppressed);
                for id in &teardown.consumer_ids {
                    self.dispatchers.remove(id);
                }
            }
        }
        self.dispatchers.clear();

        if was_connected {
            let temporaries: Vec<Destination> = self
                .temporary_destinations
                .iter()
                .map(|e| e.value().clone())
                .collect();
            for destination in temporaries {
                let remove = self.destination_info(destination.clone(), DestinationOperation::Remove);
                suppressed.absorb(
                    format!("deleting {destination}"),
                    self.correlator.request(remove, Duration::ZERO).await,
                );
            }

            let remove = RemoveInfo {
                object_id: self.id.clone().into(),
                last_delivered_sequence_id: last_delivered,
            };
            suppressed.absorb(
                "disconnecting",
                self.correlator
                    .request(Command::new(remove), self.config.close_timeout)
                    .await,
            );
            suppressed.absorb(
                "sending shutdown",
                self.correlator.oneway(Command::new(ShutdownInfo)).await,
            );
        }
        self.temporary_destinations.clear();

        suppressed.absorb(
            "closing transport",
            self.correlator.transport().close().await,
        );
        self.correlator.fail_all(&ClientError::closed("connection"));
        self.set_state(ConnectionState::Disconnected);
        self.closed.store(true, Ordering::Release);
        info!("Connection {} closed", self.id);
        Ok(suppressed)
    }

    // --- Sessions ---

    /// Creates a session, connecting first if needed.
    pub async fn create_session(self: &Arc<Self>, ack_mode: AckMode) -> Result<Arc<SessionKernel>> {
        self.check_closed_or_failed()?;
        self.ensure_connection_info_sent().await?;

        let session_id = SessionId::new(self.id.clone(), self.session_ids.next()?);
        let session = SessionKernel::new(Arc::clone(self), session_id, ack_mode);
        self.sessions.write().push(Arc::clone(&session));

        if let Err(e) = self.oneway(Command::new(session.info().clone())).await {
            self.remove_session(session.id());
            return Err(e);
        }
        metrics::ACTIVE_SESSIONS.inc();

        if self.is_started() {
            session.start()?;
        }
        debug!("Connection {}: created session {}", self.id, session.id());
        Ok(session)
    }

    pub(crate) fn remove_session(&self, id: &SessionId) {
        self.sessions.write().retain(|s| s.id() != id);
    }

    // --- Commands ---

    /// Sends `command` without waiting for a reply.
    pub async fn oneway(&self, command: Command) -> Result<()> {
        self.check_closed_or_failed()?;
        self.correlator.oneway(command).await
    }

    /// Sends `command` and waits for its reply. A zero `timeout` uses the
    /// configured request timeout.
    pub async fn sync_request(&self, command: Command, timeout: Duration) -> Result<Command> {
        self.check_closed_or_failed()?;
        self.correlator.request(command, timeout).await
    }

    /// Asks the broker to remove `object_id`, waiting for confirmation only
    /// when a timeout is given.
    pub async fn dispose_of(&self, object_id: ObjectId, timeout: Option<Duration>) -> Result<()> {
        let command = Command::new(RemoveInfo {
            object_id,
            last_delivered_sequence_id: -1,
        });
        match timeout {
            Some(timeout) => self.sync_request(command, timeout).await.map(|_| ()),
            None => self.oneway(command).await,
        }
    }

    pub(crate) fn next_local_transaction_id(&self) -> Result<TransactionId> {
        Ok(TransactionId::Local {
            connection_id: self.id.clone(),
            value: self.transaction_ids.next()?,
        })
    }

    // --- Dispatch routing ---

    pub fn add_dispatcher(&self, consumer_id: ConsumerId, session: Arc<SessionKernel>) {
        self.dispatchers.insert(consumer_id, session);
    }

    pub fn remove_dispatcher(&self, consumer_id: &ConsumerId) {
        self.dispatchers.remove(consumer_id);
    }

    pub fn has_dispatcher(&self, consumer_id: &ConsumerId) -> bool {
        self.dispatchers.contains_key(consumer_id)
    }

    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    // --- Listener ---

    /// Installs the exception listener, replacing any previous one.
    pub fn set_exception_listener<F>(&self, listener: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        *self.exception_listener.write() = Some(Arc::new(listener));
    }

    pub fn clear_exception_listener(&self) {
        self.exception_listener.write().take();
    }

    // --- Temporary destinations ---

    pub(crate) async fn create_temporary_destination(&self, topic: bool) -> Result<Destination> {
        self.check_closed_or_failed()?;
        let name = format!("{}:{}", self.id, self.temp_destination_ids.next()?);
        let destination = if topic {
            Destination::TemporaryTopic(name.clone())
        } else {
            Destination::TemporaryQueue(name.clone())
        };
        let add = self.destination_info(destination.clone(), DestinationOperation::Add);
        self.sync_request(add, Duration::ZERO).await?;
        self.temporary_destinations
            .insert(name, destination.clone());
        debug!("Connection {}: created {}", self.id, destination);
        Ok(destination)
    }

    /// Deletes a temporary destination this connection created.
    pub async fn delete_temporary_destination(&self, destination: &Destination) -> Result<()> {
        self.check_closed_or_failed()?;
        if !self.is_temporary_destination_live(destination) {
            return Err(ClientError::InvalidDestination(format!(
                "{destination} is not a live temporary destination of this connection"
            )));
        }
        let in_use = self
            .sessions()
            .iter()
            .flat_map(|s| s.consumers())
            .any(|c| c.destination() == destination);
        if in_use {
            return Err(ClientError::IllegalState(format!(
                "a consumer is still consuming from {destination}"
            )));
        }
        let remove = self.destination_info(destination.clone(), DestinationOperation::Remove);
        self.sync_request(remove, Duration::ZERO).await?;
        self.temporary_destinations.remove(destination.name());
        Ok(())
    }

    pub fn is_temporary_destination_live(&self, destination: &Destination) -> bool {
        destination.is_temporary() && self.temporary_destinations.contains_key(destination.name())
    }

    /// Rejects temporary destinations this connection cannot consume from.
    pub(crate) fn check_consumable(&self, destination: &Destination) -> Result<()> {
        let Some(owner) = destination.owner_connection() else {
            return Ok(());
        };
        if owner != self.id.value() {
            return Err(ClientError::InvalidDestination(format!(
                "{destination} belongs to another connection"
            )));
        }
        if !self.is_temporary_destination_live(destination) {
            return Err(ClientError::InvalidDestination(format!(
                "{destination} has been deleted"
            )));
        }
        Ok(())
    }

    fn destination_info(&self, destination: Destination, operation: DestinationOperation) -> Command {
        Command::new(DestinationInfo {
            connection_id: self.id.clone(),
            destination,
            operation,
        })
    }
}

impl TransportListener for ConnectionEngine {
    fn on_command(&self, command: Command) {
        match command.body {
            CommandBody::Response(_) | CommandBody::ExceptionResponse(_) => {
                self.correlator.on_response(command);
            }
            CommandBody::MessageDispatch(dispatch) => {
                let session = self
                    .dispatchers
                    .get(&dispatch.consumer_id)
                    .map(|entry| Arc::clone(entry.value()));
                match session {
                    Some(session) => session.enqueue_dispatch(dispatch),
                    None => debug!(
                        "Connection {}: no route for consumer {}, dropping dispatch",
                        self.id, dispatch.consumer_id
                    ),
                }
            }
            CommandBody::ProducerAck(ack) => {
                trace!("Producer {} acknowledged {} bytes", ack.producer_id, ack.size);
            }
            CommandBody::ConnectionError(error) => {
                self.on_transport_exception(ClientError::BrokerError {
                    message: error.message,
                    exception_class: None,
                });
            }
            CommandBody::ShutdownInfo(_) => {
                self.on_transport_exception(ClientError::ProtocolIo(
                    "broker is shutting down".to_string(),
                ));
            }
            other => {
                trace!("Connection {}: ignoring inbound {}", self.id, other.name());
            }
        }
    }

    fn on_transport_exception(&self, error: ClientError) {
        if self.closing.load(Ordering::Acquire)
            || self.state() == ConnectionState::Disconnected
        {
            debug!("Connection {}: ignoring transport error while disconnected: {}", self.id, error);
            return;
        }

        {
            let mut first = self.first_failure.lock();
            if first.is_none() {
                *first = Some(error.clone());
            }
        }
        self.set_state(ConnectionState::Error);
        self.correlator.fail_all(&error);
        warn!("Connection {} failed: {}", self.id, error);

        let listener = self.exception_listener.read().clone();
        if let Some(listener) = listener {
            listener(&error);
        }
    }
}
