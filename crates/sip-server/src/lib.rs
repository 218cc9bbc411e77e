//! sip-server: serve an interactive command to browsers over WebSocket.
//!
//! One command runs on a pseudo-terminal; every connected browser sees its
//! output (scrollback first, then live) and may type into it and resize it.

pub mod config;
pub mod manager;
pub mod session;
pub mod transport;

pub use config::{CliOverrides, ServerConfig};
pub use manager::SessionManager;
