// src/core/commands/mod.rs

//! Typed command objects exchanged with the transport.
//!
//! The engine never looks at bytes. It builds and consumes these values and leaves
//! encoding to whatever wire format sits behind the [`Transport`](crate::core::transport::Transport).

#[macro_use]
mod command_def;

pub mod ids;
pub mod info;
pub mod message;

pub use ids::{
    ConnectionId, ConsumerId, MessageId, ObjectId, ProducerId, SessionId, TransactionId, Xid,
};
pub use info::{
    AckType, ConnectionError, ConnectionInfo, ConsumerInfo, DestinationInfo,
    DestinationOperation, ExceptionResponse, MessageAck, MessageDispatch, MessagePull,
    ProducerAck, ProducerInfo, RemoveInfo, RemoveSubscriptionInfo, Response, SessionInfo,
    ShutdownInfo, TransactionInfo, TransactionType,
};
pub use message::{DeliveryMode, Message};

use serde::{Deserialize, Serialize};

define_commands! {
    (ConnectionInfo, ConnectionInfo),
    (SessionInfo, SessionInfo),
    (ConsumerInfo, ConsumerInfo),
    (ProducerInfo, ProducerInfo),
    (RemoveInfo, RemoveInfo),
    (TransactionInfo, TransactionInfo),
    (Message, Box<Message>),
    (MessageAck, MessageAck),
    (MessageDispatch, MessageDispatch),
    (MessagePull, MessagePull),
    (DestinationInfo, DestinationInfo),
    (RemoveSubscriptionInfo, RemoveSubscriptionInfo),
    (ProducerAck, ProducerAck),
    (ConnectionError, ConnectionError),
    (ShutdownInfo, ShutdownInfo),
    (Response, Response),
    (ExceptionResponse, ExceptionResponse),
}

/// A command plus the header fields used for correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Assigned by the correlator just before the command is written.
    pub command_id: u32,
    pub response_required: bool,
    pub body: CommandBody,
}

impl Command {
    pub fn new(body: impl Into<CommandBody>) -> Self {
        Self {
            command_id: 0,
            response_required: false,
            body: body.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.body.name()
    }

    /// For replies, the `command_id` of the request they answer.
    pub fn correlation_id(&self) -> Option<u32> {
        match &self.body {
            CommandBody::Response(r) => Some(r.correlation_id),
            CommandBody::ExceptionResponse(r) => Some(r.correlation_id),
            _ => None,
        }
    }

    /// Builds the plain success reply to this command.
    pub fn ok_reply(&self) -> Command {
        Command::new(Response {
            correlation_id: self.command_id,
        })
    }

    /// Builds an exception reply to this command carrying `message`.
    pub fn error_reply(&self, message: impl Into<String>) -> Command {
        Command::new(ExceptionResponse {
            correlation_id: self.command_id,
            message: message.into(),
            exception_class: None,
        })
    }
}

impl From<Message> for CommandBody {
    fn from(message: Message) -> Self {
        CommandBody::Message(Box::new(message))
    }
}
