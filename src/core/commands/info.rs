// src/core/commands/info.rs

//! Control commands exchanged with the broker.

use crate::core::commands::ids::{
    ConnectionId, ConsumerId, MessageId, ObjectId, ProducerId, SessionId, TransactionId,
};
use crate::core::commands::message::Message;
use crate::core::destination::Destination;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub selector: Option<String>,
    pub no_local: bool,
    pub prefetch_size: u32,
    /// Set for durable topic subscriptions.
    pub subscription_name: Option<String>,
    pub dispatch_async: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub destination: Option<Destination>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveInfo {
    pub object_id: ObjectId,
    /// Highest broker sequence id delivered through the removed resource, or `-1`.
    pub last_delivered_sequence_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Begin,
    End,
    CommitOnePhase,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub connection_id: ConnectionId,
    pub transaction_id: TransactionId,
    pub kind: TransactionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckType {
    /// Messages were handed to the application but not yet consumed.
    Delivered,
    /// Messages were consumed and can be discarded by the broker.
    Standard,
    /// Messages exceeded the redelivery limit.
    Poison,
    /// Messages are being redelivered after a rollback.
    Redelivered,
    Individual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAck {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub ack_type: AckType,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    pub message_count: u32,
    pub transaction_id: Option<TransactionId>,
    pub poison_cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub message: Box<Message>,
    pub redelivery_counter: u32,
}

impl MessageDispatch {
    /// The broker sequence id of the carried message, or `-1` if unassigned.
    pub fn broker_sequence_id(&self) -> i64 {
        self.message
            .message_id
            .as_ref()
            .map(|id| id.broker_sequence_id)
            .unwrap_or(-1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePull {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub timeout_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationOperation {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub connection_id: ConnectionId,
    pub destination: Destination,
    pub operation: DestinationOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveSubscriptionInfo {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub subscription_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerAck {
    pub producer_id: ProducerId,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionError {
    pub connection_id: Option<ConnectionId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionResponse {
    pub correlation_id: u32,
    pub message: String,
    pub exception_class: Option<String>,
}
