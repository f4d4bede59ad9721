//! Proxy engine: listeners, the per-connection state machine, and the
//! upstream relay.

pub mod connection;
pub mod server;
pub mod upstream;

pub use connection::ConnectionHandler;
pub use server::{ProxyServer, ServerHandle};
pub use upstream::{ForwardTarget, Forwarder, LocalResponder, TcpForwarder, UpstreamResponse};
