// src/core/dispatch/mod.rs

//! Ordered, pausable delivery of inbound message dispatches.

mod channel;
mod executor;

pub use channel::MessageDispatchChannel;
pub use executor::{DispatchExecutor, Dispatcher};
