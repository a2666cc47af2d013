// src/core/transport/loopback.rs

//! An in-memory transport that records traffic and scripts broker replies.

use super::{Transport, TransportListener};
use crate::core::commands::Command;
use crate::core::errors::{ClientError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// What the scripted broker does with a command that expects a response.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with a plain `Response`.
    Ok,
    /// Answer with an `ExceptionResponse` carrying this message.
    Error(String),
    /// Never answer.
    Silent,
    /// Refuse the write itself.
    Reject(ClientError),
}

type Responder = Arc<dyn Fn(&Command) -> Reply + Send + Sync>;

/// A transport with no network behind it.
///
/// Every written command is recorded. Commands with `response_required` are
/// answered through the responder, which defaults to [`Reply::Ok`]. Replies are
/// delivered to the listener before `oneway` returns.
pub struct LoopbackTransport {
    listener: RwLock<Option<Weak<dyn TransportListener>>>,
    sent: Mutex<Vec<Command>>,
    responder: RwLock<Responder>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self {
            listener: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            responder: RwLock::new(Arc::new(|_| Reply::Ok)),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    /// Replaces the scripted broker behaviour.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Command) -> Reply + Send + Sync + 'static,
    {
        *self.responder.write() = Arc::new(responder);
    }

    /// Delivers `command` to the listener as if it had arrived from the broker.
    pub fn inject(&self, command: Command) {
        if let Some(listener) = self.listener() {
            listener.on_command(command);
        }
    }

    /// Reports a link failure to the listener.
    pub fn fail(&self, error: ClientError) {
        if let Some(listener) = self.listener() {
            listener.on_transport_exception(error);
        }
    }

    /// A snapshot of every command written so far.
    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().clone()
    }

    /// The written commands whose type name is `name`.
    pub fn sent_named(&self, name: &str) -> Vec<Command> {
        self.sent
            .lock()
            .iter()
            .filter(|c| c.name() == name)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ProtocolIo("transport is closed".to_string()));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ProtocolIo("transport is closed".to_string()));
        }

        let reply = if command.response_required {
            let responder = self.responder.read().clone();
            responder(&command)
        } else {
            Reply::Ok
        };
        if let Reply::Reject(e) = reply {
            return Err(e);
        }

        trace!("loopback <- {} (id {})", command.name(), command.command_id);
        self.sent.lock().push(command.clone());

        if !command.response_required {
            return Ok(());
        }
        match reply {
            Reply::Ok => self.inject(command.ok_reply()),
            Reply::Error(message) => self.inject(command.error_reply(message)),
            Reply::Silent | Reply::Reject(_) => {}
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn set_listener(&self, listener: Weak<dyn TransportListener>) {
        *self.listener.write() = Some(listener);
    }
}
