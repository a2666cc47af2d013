// src/session/producer.rs

//! The producer kernel.

use super::kernel::SessionKernel;
use crate::core::commands::message::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::core::commands::{DeliveryMode, Message, MessageId, ProducerId, ProducerInfo};
use crate::core::destination::{Destination, MessageDestination};
use crate::core::errors::{ClientError, Result};
use crate::core::identity::IdentityGenerator;
use parking_lot::Mutex;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Defaults applied by [`ProducerKernel::send`].
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    /// Zero means messages never expire.
    pub time_to_live: Duration,
    pub disable_message_timestamp: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: Duration::ZERO,
            disable_message_timestamp: false,
        }
    }
}

#[derive(Debug)]
pub struct ProducerKernel {
    info: ProducerInfo,
    session: Weak<SessionKernel>,
    sequence: IdentityGenerator,
    options: Mutex<ProducerOptions>,
    closed: AtomicBool,
}

impl ProducerKernel {
    pub(crate) fn new(info: ProducerInfo, session: Weak<SessionKernel>) -> Self {
        Self {
            info,
            session,
            // Message sequence numbers start at 1.
            sequence: IdentityGenerator::starting_at(1),
            options: Mutex::new(ProducerOptions::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ProducerId {
        &self.info.producer_id
    }

    pub fn info(&self) -> &ProducerInfo {
        &self.info
    }

    /// The fixed destination, if the producer was created with one.
    pub fn destination(&self) -> Option<&Destination> {
        self.info.destination.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn options(&self) -> ProducerOptions {
        self.options.lock().clone()
    }

    pub fn set_delivery_mode(&self, mode: DeliveryMode) {
        self.options.lock().delivery_mode = mode;
    }

    pub fn set_priority(&self, priority: u8) {
        self.options.lock().priority = priority.min(MAX_PRIORITY);
    }

    pub fn set_time_to_live(&self, ttl: Duration) {
        self.options.lock().time_to_live = ttl;
    }

    pub fn set_disable_message_timestamp(&self, disabled: bool) {
        self.options.lock().disable_message_timestamp = disabled;
    }

    /// Sends to the producer's fixed destination with its default options.
    pub async fn send(&self, message: &mut Message) -> Result<MessageId> {
        let options = self.options();
        self.send_with(
            None,
            message,
            options.delivery_mode,
            options.priority,
            options.time_to_live,
        )
        .await
    }

    /// Sends to `destination` with the producer's default options.
    pub async fn send_to(
        &self,
        destination: &dyn MessageDestination,
        message: &mut Message,
    ) -> Result<MessageId> {
        let options = self.options();
        self.send_with(
            Some(destination),
            message,
            options.delivery_mode,
            options.priority,
            options.time_to_live,
        )
        .await
    }

    /// Sends with explicit delivery options.
    ///
    /// The message is stamped in place with its new id, producer, destination,
    /// timestamps, and transaction.
    pub async fn send_with(
        &self,
        destination: Option<&dyn MessageDestination>,
        message: &mut Message,
        delivery_mode: DeliveryMode,
        priority: u8,
        time_to_live: Duration,
    ) -> Result<MessageId> {
        if self.is_closed() {
            return Err(ClientError::closed("producer"));
        }
        let destination = self.resolve_destination(destination)?;
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| ClientError::closed("session"))?;
        let disable_timestamp = self.options.lock().disable_message_timestamp;

        session
            .send(
                self,
                destination,
                message,
                SendOptions {
                    delivery_mode,
                    priority: priority.min(MAX_PRIORITY),
                    time_to_live,
                    disable_timestamp,
                },
            )
            .await
    }

    fn resolve_destination(
        &self,
        requested: Option<&dyn MessageDestination>,
    ) -> Result<Destination> {
        let requested = match requested {
            Some(d) => Some(d.as_wire().cloned().ok_or_else(|| {
                ClientError::InvalidDestination(
                    "destination was not created by this client".to_string(),
                )
            })?),
            None => None,
        };
        match (&self.info.destination, requested) {
            (Some(fixed), Some(requested)) if *fixed != requested => {
                Err(ClientError::InvalidDestination(format!(
                    "producer is bound to {fixed} and cannot send to {requested}"
                )))
            }
            (Some(fixed), _) => Ok(fixed.clone()),
            (None, Some(requested)) => Ok(requested),
            (None, None) => Err(ClientError::InvalidDestination(
                "no destination given for an unbound producer".to_string(),
            )),
        }
    }

    pub(crate) fn next_sequence(&self) -> Result<u64> {
        self.sequence.next()
    }

    /// Closes the producer and tells the broker to remove it.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.dispose();
        match self.session.upgrade() {
            Some(session) => {
                session
                    .connection()
                    .dispose_of(self.info.producer_id.clone().into(), None)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Marks the producer closed and unregisters it locally. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            session.remove_producer(self.id());
        }
        debug!("Producer {} disposed", self.id());
    }
}

/// Per-send delivery settings resolved by the producer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendOptions {
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    pub time_to_live: Duration,
    pub disable_timestamp: bool,
}
