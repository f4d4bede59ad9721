//! Utility functions for the proxy engine

pub mod target;

pub use target::*;
