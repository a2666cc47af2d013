// src/core/correlator.rs

//! Oneway sends and correlated request/response over a [`Transport`].

use crate::core::commands::{Command, CommandBody};
use crate::core::errors::{ClientError, Result};
use crate::core::metrics;
use crate::core::transport::Transport;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

type ReplySender = oneshot::Sender<Result<Command>>;

/// Assigns command ids and matches replies to waiting requests.
pub struct RequestCorrelator {
    transport: Arc<dyn Transport>,
    next_command_id: AtomicU32,
    pending: DashMap<u32, ReplySender>,
    default_timeout: Duration,
}

/// Removes a pending slot when the waiting request finishes, whatever the outcome.
struct PendingSlot<'a> {
    pending: &'a DashMap<u32, ReplySender>,
    id: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.pending.remove(&self.id).is_some() {
            trace!("Released correlation slot {}", self.id);
        }
    }
}

impl RequestCorrelator {
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            next_command_id: AtomicU32::new(1),
            pending: DashMap::new(),
            default_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn next_id(&self) -> u32 {
        // Zero is reserved for "unassigned".
        loop {
            let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Sends `command` without waiting for a reply.
    pub async fn oneway(&self, mut command: Command) -> Result<()> {
        command.command_id = self.next_id();
        command.response_required = false;
        trace!("oneway -> {} (id {})", command.name(), command.command_id);
        metrics::ONEWAY_COMMANDS_TOTAL.inc();
        self.transport.oneway(command).await.map_err(into_protocol_io)
    }

    /// Sends `command` and waits for the matching reply.
    ///
    /// A zero `timeout` selects the configured default. An exception reply is
    /// converted into [`ClientError::BrokerError`]. The correlation slot is
    /// released on every path.
    pub async fn request(&self, mut command: Command, timeout: Duration) -> Result<Command> {
        let id = self.next_id();
        command.command_id = id;
        command.response_required = true;
        let name = command.name();
        let timeout = if timeout.is_zero() {
            self.default_timeout
        } else {
            timeout
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        metrics::SYNC_REQUESTS_TOTAL.inc();
        let started = Instant::now();
        trace!("request -> {} (id {}, timeout {:?})", name, id, timeout);
        self.transport
            .oneway(command)
            .await
            .map_err(into_protocol_io)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(reply) => {
                let reply = reply??;
                metrics::REQUEST_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
                match reply.body {
                    CommandBody::ExceptionResponse(e) => {
                        metrics::BROKER_ERRORS_TOTAL.inc();
                        Err(ClientError::BrokerError {
                            message: e.message,
                            exception_class: e.exception_class,
                        })
                    }
                    _ => Ok(reply),
                }
            }
            Err(_) => {
                metrics::REQUEST_TIMEOUTS_TOTAL.inc();
                debug!("Request {} (id {}) timed out after {:?}", name, id, timeout);
                Err(ClientError::Timeout {
                    command: name.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Completes the request a reply answers.
    ///
    /// Returns `false` when no request is waiting for it (late or unknown reply).
    pub fn on_response(&self, reply: Command) -> bool {
        let Some(correlation_id) = reply.correlation_id() else {
            return false;
        };
        match self.pending.remove(&correlation_id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(reply));
                true
            }
            None => {
                debug!("Dropping reply for unknown request {}", correlation_id);
                false
            }
        }
    }

    /// Fails every waiting request with `error`.
    pub fn fail_all(&self, error: &ClientError) {
        let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// The number of requests currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn into_protocol_io(e: ClientError) -> ClientError {
    match e.kind() {
        crate::core::errors::ErrorKind::ProtocolIo => e,
        _ => ClientError::ProtocolIo(e.to_string()),
    }
}
