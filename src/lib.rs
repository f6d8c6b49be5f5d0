//! HTTP Upgrade Tunnel
//!
//! Turns an HTTP/1.1 upgrade request (typically WebSocket) into a raw byte
//! tunnel between the client and an origin server. Translates the request for
//! the origin, relays both directions with flushed writes, and tears the pair
//! down on half-close, error or idle timeout.

pub mod brigade;
pub mod config;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod relay;
pub mod request;
pub mod security;
pub mod server;
pub mod shutdown;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use brigade::{Brigade, write_brigade};
pub use config::{
    Config, ListenConfig, TargetConfig, TlsConfig, TunnelConfig, load_config, parse_config,
};
pub use error::TunnelError;
pub use headers::{BodyFraming, TranslatedRequest, resolve_body_framing, translate};
pub use proxy::{Connector, TcpConnector, proxy_upgrade};
pub use relay::{BUFFER_SIZE, Direction};
pub use request::{RequestDescriptor, read_request_head};
pub use security::{ProxyAllowlist, parse_original_client_ip};
pub use server::handle_connection;
pub use shutdown::{
    ConnectionState, Disposition, RelayFailure, RelayOp, TunnelOutcome, TunnelPair, TunnelStatus,
};
pub use stream::StreamType;
pub use tls::load_tls_config;
