// src/session/registration.rs

//! Defines `ConsumerRegistration`, an RAII guard for two-phase consumer registration.

use super::consumer::ConsumerKernel;
use super::kernel::SessionKernel;
use std::sync::Arc;
use tracing::debug;

/// Holds a consumer that is visible for routing but not yet confirmed by the
/// broker.
///
/// Creating the guard inserts the consumer into the session's registry and the
/// connection's routing table, so dispatches racing with the broker's reply
/// are queued rather than dropped. Dropping the guard without calling
/// [`confirm`](Self::confirm) removes both entries again.
pub(crate) struct ConsumerRegistration<'a> {
    session: &'a Arc<SessionKernel>,
    consumer: Arc<ConsumerKernel>,
    confirmed: bool,
}

impl<'a> ConsumerRegistration<'a> {
    pub(crate) fn tentative(session: &'a Arc<SessionKernel>, consumer: Arc<ConsumerKernel>) -> Self {
        session.insert_consumer(Arc::clone(&consumer));
        session
            .connection()
            .add_dispatcher(consumer.id().clone(), Arc::clone(session));
        debug!("Consumer {} registered tentatively", consumer.id());
        Self {
            session,
            consumer,
            confirmed: false,
        }
    }

    /// Makes the registration permanent.
    pub(crate) fn confirm(mut self) -> Arc<ConsumerKernel> {
        self.confirmed = true;
        Arc::clone(&self.consumer)
    }
}

impl Drop for ConsumerRegistration<'_> {
    fn drop(&mut self) {
        if self.confirmed {
            return;
        }
        let id = self.consumer.id();
        debug!("Consumer {} registration rolled back", id);
        self.session.remove_consumer_entry(id);
        self.session.connection().remove_dispatcher(id);
        self.consumer.abandon();
    }
}
