//! Connection Management Module
//!
//! Accept loop and lifecycle control for relay sessions.

pub mod manager;

pub use manager::{ConnectionHandle, ConnectionManager};
