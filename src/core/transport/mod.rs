// src/core/transport/mod.rs

//! The boundary between the engine and the byte-level transport.
//!
//! A transport accepts already-built [`Command`] values, writes them however it
//! likes, and reports decoded inbound commands and failures to a single
//! [`TransportListener`]. Request/response correlation is layered on top by the
//! [`RequestCorrelator`](crate::core::correlator::RequestCorrelator).

use crate::core::commands::Command;
use crate::core::errors::{ClientError, Result};
use async_trait::async_trait;
use std::sync::Weak;

mod loopback;

pub use loopback::{LoopbackTransport, Reply};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the underlying link. Calling it twice must be harmless.
    async fn start(&self) -> Result<()>;

    /// Hands `command` to the link without waiting for any reply.
    async fn oneway(&self, command: Command) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Registers the receiver of inbound commands and failures.
    ///
    /// The listener is held weakly so the transport never keeps its owner alive.
    fn set_listener(&self, listener: Weak<dyn TransportListener>);
}

/// Callbacks invoked from the transport's receiving task.
///
/// Implementations must hand work off and return promptly; blocking here would
/// stall every reply the correlator is waiting for.
pub trait TransportListener: Send + Sync {
    fn on_command(&self, command: Command);

    fn on_transport_exception(&self, error: ClientError);
}
