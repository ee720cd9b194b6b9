pub mod backoff;
pub mod manager;
pub mod transport;

pub use manager::{ConnectionManager, ConnectionSettings};
pub use transport::{Connector, PushChannel, WsConnector};
