//! Tagged binary framing for the sip WebSocket protocol.
//!
//! Wire format of a binary message: `[1-byte tag][payload]`. Resize payloads
//! are two big-endian `u16`s (rows, cols); `SessionClosed` carries JSON.
//! Text messages carry a JSON [`TextMessage`](crate::messages::TextMessage).

use crate::error::{SipError, SipResult};
use crate::messages::{tag, ClientFrame, ServerFrame, TextMessage, WindowSize};
use bytes::Bytes;

fn tagged(t: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(t);
    frame.extend_from_slice(payload);
    frame
}

fn split_tag(data: &[u8]) -> SipResult<(u8, &[u8])> {
    match data.split_first() {
        Some((t, rest)) => Ok((*t, rest)),
        None => Err(SipError::InvalidMessage("empty frame".into())),
    }
}

/// Encode a server frame into a binary WebSocket payload.
pub fn encode_server(frame: &ServerFrame) -> SipResult<Vec<u8>> {
    Ok(match frame {
        ServerFrame::Data(data) => tagged(tag::DATA, data),
        ServerFrame::SessionClosed(info) => tagged(tag::SESSION_CLOSED, &serde_json::to_vec(info)?),
        ServerFrame::Pong(payload) => tagged(tag::PONG, payload),
    })
}

/// Decode a binary WebSocket payload sent by the server.
pub fn decode_server(data: &[u8]) -> SipResult<ServerFrame> {
    let (t, payload) = split_tag(data)?;
    match t {
        tag::DATA => Ok(ServerFrame::Data(Bytes::copy_from_slice(payload))),
        tag::SESSION_CLOSED => Ok(ServerFrame::SessionClosed(serde_json::from_slice(payload)?)),
        tag::PONG => Ok(ServerFrame::Pong(Bytes::copy_from_slice(payload))),
        other => Err(SipError::InvalidMessage(format!(
            "unknown server frame tag 0x{other:02x}"
        ))),
    }
}

/// Encode a client frame into a binary WebSocket payload.
pub fn encode_client(frame: &ClientFrame) -> Vec<u8> {
    match frame {
        ClientFrame::Data(data) => tagged(tag::DATA, data),
        ClientFrame::Resize(size) => {
            let mut payload = [0u8; 4];
            payload[..2].copy_from_slice(&size.rows.to_be_bytes());
            payload[2..].copy_from_slice(&size.cols.to_be_bytes());
            tagged(tag::RESIZE, &payload)
        }
        ClientFrame::Ping(payload) => tagged(tag::PING, payload),
        ClientFrame::Pong(payload) => tagged(tag::PONG, payload),
    }
}

/// Decode a binary WebSocket payload sent by a browser.
pub fn decode_client(data: &[u8]) -> SipResult<ClientFrame> {
    let (t, payload) = split_tag(data)?;
    match t {
        tag::DATA => Ok(ClientFrame::Data(Bytes::copy_from_slice(payload))),
        tag::RESIZE => {
            if payload.len() != 4 {
                return Err(SipError::InvalidMessage(format!(
                    "resize payload must be 4 bytes, got {}",
                    payload.len()
                )));
            }
            let rows = u16::from_be_bytes([payload[0], payload[1]]);
            let cols = u16::from_be_bytes([payload[2], payload[3]]);
            Ok(ClientFrame::Resize(WindowSize::checked(rows as u32, cols as u32)?))
        }
        tag::PING => Ok(ClientFrame::Ping(Bytes::copy_from_slice(payload))),
        tag::PONG => Ok(ClientFrame::Pong(Bytes::copy_from_slice(payload))),
        other => Err(SipError::InvalidMessage(format!(
            "unknown client frame tag 0x{other:02x}"
        ))),
    }
}

/// Decode a text WebSocket message sent by a browser.
pub fn decode_client_text(text: &str) -> SipResult<ClientFrame> {
    let msg: TextMessage = serde_json::from_str(text)?;
    ClientFrame::try_from(msg)
}
