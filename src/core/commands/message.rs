// src/core/commands/message.rs

//! The message payload carried by producer sends and broker dispatches.

use crate::core::commands::ids::{MessageId, ProducerId, TransactionId};
use crate::core::destination::Destination;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PRIORITY: u8 = 4;
pub const MAX_PRIORITY: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub producer_id: Option<ProducerId>,
    pub transaction_id: Option<TransactionId>,
    pub destination: Option<Destination>,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    /// Milliseconds since the Unix epoch; `0` when timestamps are disabled.
    pub timestamp: i64,
    /// Absolute expiry in milliseconds since the Unix epoch; `0` never expires.
    pub expiration: i64,
    pub redelivery_counter: u32,
    /// Requests a broker receipt even when the send would otherwise be oneway.
    pub response_required: bool,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            message_id: None,
            producer_id: None,
            transaction_id: None,
            destination: None,
            reply_to: None,
            correlation_id: None,
            message_type: None,
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            timestamp: 0,
            expiration: 0,
            redelivery_counter: 0,
            response_required: false,
            properties: BTreeMap::new(),
            body: Bytes::new(),
        }
    }
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn text(body: &str) -> Self {
        Self::new(Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiration > 0 && now_millis > self.expiration
    }

    /// Strips the fields a previous send stamped onto this message.
    pub(crate) fn clear_send_state(&mut self) {
        self.message_id = None;
        self.producer_id = None;
        self.transaction_id = None;
    }
}
