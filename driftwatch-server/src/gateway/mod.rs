//! Real-time gateway: topic pub/sub over long-lived WebSocket connections.

pub mod connection;
pub mod manager;
pub mod messages;

pub use connection::Connection;
pub use manager::ConnectionManager;
pub use messages::{Frame, valid_topic};
