//! Browser-facing transport.

pub mod websocket;

pub use websocket::{bind, reject, serve_client, start_listener, ClientSettings, WebSocketConnection};
