//! Command-line interface: serve and certificate management commands.

pub mod cert;
pub mod server;

pub use cert::*;
pub use server::*;
