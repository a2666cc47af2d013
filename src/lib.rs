// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod logging;
pub mod session;

// Re-export
pub use crate::config::ClientConfig;
pub use crate::connection::{Connection, ConnectionEngine, ConnectionState};
pub use crate::core::destination::{Destination, MessageDestination};
pub use crate::core::errors::{ClientError, ErrorKind, Result, Suppressed};
pub use crate::session::{AckMode, Consumer, Producer, Session};
