// src/session/mod.rs

//! Sessions and the consumers, producers, and transactions they own.

mod consumer;
mod kernel;
mod producer;
mod registration;
mod transaction;

pub use consumer::{ConsumerKernel, MessageListener};
pub use kernel::{SessionKernel, SessionState};
pub use producer::{ProducerKernel, ProducerOptions};
pub use transaction::{DistributedOutcome, Synchronization, TransactionContext, TransactionState};

use std::sync::Arc;
use strum_macros::{Display, EnumString};

pub type Session = Arc<SessionKernel>;
pub type Consumer = Arc<ConsumerKernel>;
pub type Producer = Arc<ProducerKernel>;

/// How a session acknowledges the messages its consumers receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AckMode {
    /// Each message is acknowledged once the application has consumed it.
    Auto,
    /// Like `Auto`, but topic acknowledgements are batched.
    DupsOk,
    /// The application acknowledges every delivered message at once.
    ClientAck,
    /// The application acknowledges messages one at a time.
    Individual,
    /// Acknowledgements and sends are grouped into local transactions.
    Transacted,
}

impl AckMode {
    pub fn is_auto(&self) -> bool {
        matches!(self, AckMode::Auto | AckMode::DupsOk)
    }
}
