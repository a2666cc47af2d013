// src/core/errors.rs

//! Defines the primary error type for the client engine.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The coarse failure categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    IllegalState,
    InvalidDestination,
    ProtocolIo,
    BrokerError,
    Timeout,
    Overflow,
    Internal,
}

/// The main error enum, representing every failure the engine can report.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The operation is not valid in the current lifecycle state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The destination was not produced by this client, or no longer exists.
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// The transport could not carry a command.
    #[error("Protocol IO error: {0}")]
    ProtocolIo(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The broker answered a request with an exception response.
    #[error("Broker error: {message}")]
    BrokerError {
        message: String,
        exception_class: Option<String>,
    },

    /// A correlated request did not receive its reply in time.
    #[error("Request '{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Identity sequence exhausted")]
    Overflow,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::IllegalState(_) => ErrorKind::IllegalState,
            ClientError::InvalidDestination(_) => ErrorKind::InvalidDestination,
            ClientError::ProtocolIo(_) | ClientError::Io(_) => ErrorKind::ProtocolIo,
            ClientError::BrokerError { .. } => ErrorKind::BrokerError,
            ClientError::Timeout { .. } => ErrorKind::Timeout,
            ClientError::Overflow => ErrorKind::Overflow,
            ClientError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn closed(what: &str) -> Self {
        ClientError::IllegalState(format!("{what} is closed"))
    }
}

// Manual implementation of Clone because `std::io::Error` is not `Clone`.
impl Clone for ClientError {
    fn clone(&self) -> Self {
        match self {
            ClientError::IllegalState(s) => ClientError::IllegalState(s.clone()),
            ClientError::InvalidDestination(s) => ClientError::InvalidDestination(s.clone()),
            ClientError::ProtocolIo(s) => ClientError::ProtocolIo(s.clone()),
            ClientError::Io(e) => ClientError::Io(Arc::clone(e)),
            ClientError::BrokerError {
                message,
                exception_class,
            } => ClientError::BrokerError {
                message: message.clone(),
                exception_class: exception_class.clone(),
            },
            ClientError::Timeout { command, after } => ClientError::Timeout {
                command: command.clone(),
                after: *after,
            },
            ClientError::Overflow => ClientError::Overflow,
            ClientError::Internal(s) => ClientError::Internal(s.clone()),
        }
    }
}

impl PartialEq for ClientError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClientError::IllegalState(a), ClientError::IllegalState(b)) => a == b,
            (ClientError::InvalidDestination(a), ClientError::InvalidDestination(b)) => a == b,
            (ClientError::ProtocolIo(a), ClientError::ProtocolIo(b)) => a == b,
            (ClientError::Io(a), ClientError::Io(b)) => a.kind() == b.kind(),
            (
                ClientError::BrokerError { message: m1, .. },
                ClientError::BrokerError { message: m2, .. },
            ) => m1 == m2,
            (ClientError::Internal(a), ClientError::Internal(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ClientError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ClientError::ProtocolIo("reply channel dropped before a response arrived".to_string())
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Collects failures during best-effort teardown without aborting the loop.
///
/// Every absorbed error is logged at `warn` with its context and kept for
/// callers that want to inspect what went wrong.
#[derive(Debug, Default)]
pub struct Suppressed {
    errors: Vec<(String, ClientError)>,
}

impl Suppressed {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records the error of `result`, if any, and returns the success value.
    pub fn absorb<T>(&mut self, context: impl Into<String>, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                let context = context.into();
                tracing::warn!("Suppressed error during {}: {}", context, e);
                self.errors.push((context, e));
                None
            }
        }
    }

    pub fn extend(&mut self, other: Suppressed) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[(String, ClientError)] {
        &self.errors
    }

    /// Fails with the first absorbed error, if any.
    pub fn into_result(self) -> Result<()> {
        match self.errors.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }
}
