//! TLS identity management and rustls configuration

pub mod authority;
pub mod config;

pub use authority::*;
pub use config::*;
