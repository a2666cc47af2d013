// src/connection/mod.rs

//! The connection engine and its public handle.

mod engine;
mod state;

pub use engine::{ConnectionEngine, ExceptionListener};
pub use state::ConnectionState;

pub type Connection = std::sync::Arc<ConnectionEngine>;
