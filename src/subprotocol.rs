//! IAP relay subprotocol framing.
//!
//! The relay carries an application-level subprotocol inside WebSocket
//! binary messages. Every frame starts with a big-endian `u16` tag; the
//! shape of the rest depends on the tag.
//!
//! # Frame Layout
//!
//! | Tag | Name | Body |
//! |-----|------|------|
//! | `0x0001` | `CONNECT_SUCCESS_SID` | `u32` length + session id bytes |
//! | `0x0004` | `DATA` | `u32` length + payload bytes |
//! | `0x0007` | `ACK` | `u64` cumulative bytes received |
//!
//! All integers are big-endian. Outbound data is chunked so no single DATA
//! frame carries more than [`MAX_DATA_FRAME_SIZE`] payload bytes.
//!
//! Decoders return the extracted value together with the bytes remaining
//! after the frame, so a caller can detect (and log) trailing garbage.

// ============================================================================
// Imports
// ============================================================================

use url::Url;

use crate::error::{Error, Result};
use crate::target::TunnelTarget;

// ============================================================================
// Constants
// ============================================================================

/// Subprotocol name sent in the `Sec-WebSocket-Protocol` header.
pub const SUBPROTOCOL_NAME: &str = "relay.tunnel.cloudproxy.app";

/// Maximum payload bytes in a single DATA frame.
pub const MAX_DATA_FRAME_SIZE: usize = 16384;

/// Tag of the connect-success frame carrying the session id.
pub const TAG_CONNECT_SUCCESS_SID: u16 = 0x0001;

/// Tag of a data frame.
pub const TAG_DATA: u16 = 0x0004;

/// Tag of an acknowledgment frame.
pub const TAG_ACK: u16 = 0x0007;

/// Production relay host.
pub const URL_HOST: &str = "tunnel.cloudproxy.app";

/// Relay URL path root (protocol version).
pub const URL_PATH_ROOT: &str = "/v4";

/// Endpoint for establishing a new tunnel.
pub const CONNECT_ENDPOINT: &str = "connect";

/// Origin header value expected by the relay.
pub const TUNNEL_ORIGIN: &str = "bot:iap-tunneler";

/// Size of the tag prefix.
const TAG_LEN: usize = 2;

/// Size of a length prefix.
const LEN_PREFIX_LEN: usize = 4;

/// Size of an ack body.
const ACK_BODY_LEN: usize = 8;

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a DATA frame around `data`.
///
/// The caller is responsible for chunking: `data` must not exceed
/// [`MAX_DATA_FRAME_SIZE`] bytes.
///
/// # Panics
///
/// Panics if `data` exceeds [`MAX_DATA_FRAME_SIZE`]; an over-limit frame
/// would be rejected by the relay.
#[must_use]
pub fn create_data_frame(data: &[u8]) -> Vec<u8> {
    assert!(
        data.len() <= MAX_DATA_FRAME_SIZE,
        "payload of {} bytes exceeds MAX_DATA_FRAME_SIZE",
        data.len()
    );

    let mut frame = Vec::with_capacity(TAG_LEN + LEN_PREFIX_LEN + data.len());
    frame.extend_from_slice(&TAG_DATA.to_be_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(data);
    frame
}

/// Encodes an ACK frame for `bytes_received` cumulative tunnel bytes.
#[must_use]
pub fn create_ack_frame(bytes_received: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(TAG_LEN + ACK_BODY_LEN);
    frame.extend_from_slice(&TAG_ACK.to_be_bytes());
    frame.extend_from_slice(&bytes_received.to_be_bytes());
    frame
}

// ============================================================================
// Decoding
// ============================================================================

/// Extracts the tag from the front of a frame.
///
/// Returns the tag and the bytes after it.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the frame is shorter than the tag.
pub fn extract_subprotocol_tag(frame: &[u8]) -> Result<(u16, &[u8])> {
    if frame.len() < TAG_LEN {
        return Err(Error::malformed_frame(format!(
            "frame too short for tag: {} bytes",
            frame.len()
        )));
    }
    let tag = u16::from_be_bytes([frame[0], frame[1]]);
    Ok((tag, &frame[TAG_LEN..]))
}

/// Extracts the payload of a DATA frame body (after the tag).
///
/// Returns the payload and the bytes after it.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the length prefix is truncated or
/// claims more bytes than the body holds.
pub fn extract_subprotocol_data(body: &[u8]) -> Result<(&[u8], &[u8])> {
    extract_len_prefixed(body)
}

/// Extracts the session id from a CONNECT_SUCCESS_SID frame body.
///
/// Returns the session id bytes and the bytes after them.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] on truncation.
pub fn extract_subprotocol_connect_success_sid(body: &[u8]) -> Result<(&[u8], &[u8])> {
    extract_len_prefixed(body)
}

/// Extracts the cumulative byte count from an ACK frame body.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the body is shorter than 8 bytes.
pub fn extract_subprotocol_ack(body: &[u8]) -> Result<(u64, &[u8])> {
    if body.len() < ACK_BODY_LEN {
        return Err(Error::malformed_frame(format!(
            "ack body too short: {} bytes",
            body.len()
        )));
    }
    let mut buf = [0u8; ACK_BODY_LEN];
    buf.copy_from_slice(&body[..ACK_BODY_LEN]);
    Ok((u64::from_be_bytes(buf), &body[ACK_BODY_LEN..]))
}

/// Splits a `u32`-length-prefixed chunk off the front of `body`.
fn extract_len_prefixed(body: &[u8]) -> Result<(&[u8], &[u8])> {
    if body.len() < LEN_PREFIX_LEN {
        return Err(Error::malformed_frame(format!(
            "body too short for length prefix: {} bytes",
            body.len()
        )));
    }
    let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let rest = &body[LEN_PREFIX_LEN..];
    if rest.len() < len {
        return Err(Error::malformed_frame(format!(
            "length prefix claims {len} bytes, only {} available",
            rest.len()
        )));
    }
    Ok((&rest[..len], &rest[len..]))
}

// ============================================================================
// URL Construction
// ============================================================================

/// Builds the relay URL for `endpoint` and `target`.
///
/// Production form:
/// `wss://tunnel.cloudproxy.app/v4/connect?project=…&port=…&zone=…&instance=…&interface=…`
///
/// When the target carries a `url_override`, its scheme, host, and port
/// replace the production relay's; the path and query are unchanged.
///
/// # Errors
///
/// Returns [`Error::InvalidTarget`] if the override is not a parseable
/// `ws://`/`wss://` base URL.
pub fn create_websocket_url(endpoint: &str, target: &TunnelTarget) -> Result<Url> {
    let base = match &target.url_override {
        Some(override_url) => Url::parse(override_url)
            .map_err(|e| Error::invalid_target(format!("bad url override: {e}")))?,
        None => Url::parse(&format!("wss://{URL_HOST}"))
            .map_err(|e| Error::invalid_target(format!("bad relay host: {e}")))?,
    };

    let mut url = base;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::invalid_target(format!(
            "unsupported relay scheme [{}]",
            url.scheme()
        )));
    }
    url.set_path(&format!("{URL_PATH_ROOT}/{endpoint}"));
    url.query_pairs_mut()
        .clear()
        .append_pair("project", &target.project)
        .append_pair("port", &target.port.to_string())
        .append_pair("zone", &target.zone)
        .append_pair("instance", &target.instance)
        .append_pair("interface", &target.interface);

    Ok(url)
}

// ============================================================================
// Tests
// ============================================================================
