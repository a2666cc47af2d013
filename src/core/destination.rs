// src/core/destination.rs

//! Queue and topic addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A destination the engine can address on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Queue(String),
    Topic(String),
    TemporaryQueue(String),
    TemporaryTopic(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(n)
            | Destination::Topic(n)
            | Destination::TemporaryQueue(n)
            | Destination::TemporaryTopic(n) => n,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_) | Destination::TemporaryTopic(_))
    }

    pub fn is_queue(&self) -> bool {
        !self.is_topic()
    }

    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Destination::TemporaryQueue(_) | Destination::TemporaryTopic(_)
        )
    }

    /// For temporary destinations, the connection id prefix of the name.
    pub fn owner_connection(&self) -> Option<&str> {
        if !self.is_temporary() {
            return None;
        }
        self.name().rsplit_once(':').map(|(owner, _)| owner)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(n) => write!(f, "queue://{n}"),
            Destination::Topic(n) => write!(f, "topic://{n}"),
            Destination::TemporaryQueue(n) => write!(f, "temp-queue://{n}"),
            Destination::TemporaryTopic(n) => write!(f, "temp-topic://{n}"),
        }
    }
}

/// Capability query for destinations handed in by application code.
///
/// Only values that expose a wire form through [`as_wire`](Self::as_wire) can be
/// used with this engine; everything else is rejected as a foreign destination.
pub trait MessageDestination: fmt::Debug + Send + Sync {
    fn as_wire(&self) -> Option<&Destination> {
        None
    }
}

impl MessageDestination for Destination {
    fn as_wire(&self) -> Option<&Destination> {
        Some(self)
    }
}
