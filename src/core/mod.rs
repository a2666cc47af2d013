// src/core/mod.rs

//! Commands, correlation, dispatch, and the other building blocks the
//! connection and its sessions are made of.

pub mod commands;
pub mod correlator;
pub mod destination;
pub mod dispatch;
pub mod errors;
pub mod identity;
pub mod metrics;
pub mod scheduler;
pub mod transport;

pub use commands::Command;
pub use errors::ClientError;
