//! sip-core: Shared protocol library for sip.
//!
//! Provides the wire message types exchanged between the browser terminal and
//! the server, the binary/JSON codec for those messages, and the error type
//! used across the workspace.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_client, decode_client_text, decode_server, encode_client, encode_server};
pub use error::{SipError, SipResult};
pub use messages::{ClientFrame, CloseReason, ClosedInfo, ServerFrame, WindowSize};
