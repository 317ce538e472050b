//! Marmot link for Linux: TCP transport and the connection manager that
//! carries `marmot-core` messages between two devices.

pub mod config;
pub mod connection;
pub mod error;
pub mod transport;

pub use config::Config;
pub use connection::{
    CloseReason, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, Role,
    Status, Subscription, DEFAULT_PORT,
};
pub use error::{ConnectionError, TransportError};
