// src/core/commands/ids.rs

//! Hierarchical resource identities.
//!
//! Every identity renders as `<connectionId>:<sessionSeq>[:<resourceSeq>]` so the
//! broker can attribute each resource to the connection and session that own it.

use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a globally unique id of the form `ID:<hostname>-<uuid>`.
    pub fn generate() -> Self {
        let host = System::host_name().unwrap_or_else(|| "localhost".to_string());
        Self(format!("ID:{}-{}", host, Uuid::new_v4().simple()))
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub connection_id: ConnectionId,
    pub value: u64,
}

impl SessionId {
    pub fn new(connection_id: ConnectionId, value: u64) -> Self {
        Self {
            connection_id,
            value,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

/// Identity of a consumer: `<connectionId>:<sessionSeq>:<consumerSeq>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId {
    pub session_id: SessionId,
    pub value: u64,
}

impl ConsumerId {
    pub fn new(session_id: SessionId, value: u64) -> Self {
        Self { session_id, value }
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

/// Identity of a producer: `<connectionId>:<sessionSeq>:<producerSeq>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    pub session_id: SessionId,
    pub value: u64,
}

impl ProducerId {
    pub fn new(session_id: SessionId, value: u64) -> Self {
        Self { session_id, value }
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub producer_id: ProducerId,
    pub producer_sequence_id: u64,
    /// Assigned by the broker on dispatch; `0` on outbound messages.
    pub broker_sequence_id: i64,
}

impl MessageId {
    pub fn new(producer_id: ProducerId, producer_sequence_id: u64) -> Self {
        Self {
            producer_id,
            producer_sequence_id,
            broker_sequence_id: 0,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.producer_sequence_id)
    }
}

/// An externally managed transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_transaction_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionId {
    Local {
        connection_id: ConnectionId,
        value: u64,
    },
    Xa(Xid),
}

impl TransactionId {
    pub fn is_local(&self) -> bool {
        matches!(self, TransactionId::Local { .. })
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionId::Local {
                connection_id,
                value,
            } => write!(f, "TX:{connection_id}:{value}"),
            TransactionId::Xa(xid) => {
                write!(f, "XID:[{}:", xid.format_id)?;
                for b in &xid.global_transaction_id {
                    write!(f, "{b:02x}")?;
                }
                f.write_str(":")?;
                for b in &xid.branch_qualifier {
                    write!(f, "{b:02x}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Any resource the broker can be asked to remove.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Connection(id) => id.fmt(f),
            ObjectId::Session(id) => id.fmt(f),
            ObjectId::Consumer(id) => id.fmt(f),
            ObjectId::Producer(id) => id.fmt(f),
        }
    }
}

impl From<ConnectionId> for ObjectId {
    fn from(id: ConnectionId) -> Self {
        ObjectId::Connection(id)
    }
}

impl From<SessionId> for ObjectId {
    fn from(id: SessionId) -> Self {
        ObjectId::Session(id)
    }
}

impl From<ConsumerId> for ObjectId {
    fn from(id: ConsumerId) -> Self {
        ObjectId::Consumer(id)
    }
}

impl From<ProducerId> for ObjectId {
    fn from(id: ProducerId) -> Self {
        ObjectId::Producer(id)
    }
}
