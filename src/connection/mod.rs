mod error;
mod manager;
mod message;
mod registry;
mod state;
mod transport;

pub use error::ConnectError;
pub use manager::ConnectionManager;
pub use message::{InboundMessage, OutboundMessage};
pub use registry::Handler;
pub use state::{ConnectionState, ReconnectPolicy};
#[cfg(test)]
pub use transport::Channel;
pub use transport::{Connector, WsConnector};

/// `{ws_base}/api/ws/objects/{client_id}`
pub fn objects_endpoint(ws_base: &str, client_id: &str) -> String {
    format!("{}/api/ws/objects/{}", ws_base.trim_end_matches('/'), client_id)
}

/// `{ws_base}/api/ws/data-source/{source_id}/{client_id}`
pub fn data_source_endpoint(ws_base: &str, source_id: &str, client_id: &str) -> String {
    format!(
        "{}/api/ws/data-source/{}/{}",
        ws_base.trim_end_matches('/'),
        source_id,
        client_id
    )
}
