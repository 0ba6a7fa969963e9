//! Error types for the IAP tunnel client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use iap_tunnel::{Result, IapTunnelClient};
//!
//! async fn example(client: &IapTunnelClient) -> Result<()> {
//!     client.wait_for_open().await?;
//!     client.send(b"hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::ConnectionCreation`], [`Error::UnexpectedClose`], [`Error::WebSocket`] |
//! | Receive | [`Error::Receive`], [`Error::CloseErrorInfo`], [`Error::UnexpectedData`] |
//! | Subprotocol | [`Error::MalformedFrame`] |
//! | Configuration | [`Error::InvalidTarget`] |
//! | Consumer | [`Error::Callback`] |
//!
//! # Lazy Propagation
//!
//! Failures on the background event loop are recorded inside the client and
//! surfaced to whichever caller next inspects state (`send`, `wait_for_open`,
//! `close`). To support returning the same recorded failure more than once,
//! every variant carries owned string context and the enum derives [`Clone`];
//! underlying transport errors are flattened into their description at the
//! boundary where they are caught.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The connection vanished before the handshake completed.
    ///
    /// Returned by `wait_for_open` when the event loop terminated without a
    /// more specific recorded failure.
    #[error("Error while establishing WebSocket connection")]
    ConnectionCreation,

    /// Send attempted after the connection vanished.
    ///
    /// Returned when the event loop is gone and no failure was recorded.
    #[error("Unexpected connection close during send")]
    UnexpectedClose,

    /// Generic error reported by the WebSocket library.
    ///
    /// The message carries the underlying error's description.
    #[error("WebSocket error: {message}")]
    WebSocket {
        /// Description of the underlying error.
        message: String,
    },

    // ========================================================================
    // Receive Errors
    // ========================================================================
    /// Transport-level failure during the receive loop.
    #[error("Error receiving from WebSocket: {message}")]
    Receive {
        /// Description of the transport failure.
        message: String,
    },

    /// The server-initiated close carried diagnostic payload.
    #[error("Error info during close: {info}")]
    CloseErrorInfo {
        /// Close code and reason reported by the server.
        info: String,
    },

    /// Unexpected WebSocket message or subprotocol state.
    ///
    /// Returned for DATA frames arriving before the connect acknowledgment.
    #[error("Unexpected WebSocket data: {message}")]
    UnexpectedData {
        /// Description of the unexpected data.
        message: String,
    },

    // ========================================================================
    // Subprotocol Errors
    // ========================================================================
    /// A subprotocol frame could not be decoded.
    ///
    /// Returned when a frame is truncated or its length prefix is invalid.
    #[error("Malformed subprotocol frame: {message}")]
    MalformedFrame {
        /// Description of the decode failure.
        message: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Tunnel target validation failed.
    ///
    /// Returned when a required target field is missing or invalid.
    #[error("Invalid tunnel target: {message}")]
    InvalidTarget {
        /// Description of the invalid field.
        message: String,
    },

    // ========================================================================
    // Consumer Errors
    // ========================================================================
    /// The caller-supplied data callback failed.
    ///
    /// Fatal to the event loop: the connection is closed and the loop
    /// terminates.
    #[error("Data callback failed: {message}")]
    Callback {
        /// Description of the callback failure.
        message: String,
    },
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a WebSocket error from the library's reported failure.
    ///
    /// The message is synthesized as `"Kind: description"` so the original
    /// cause survives cloning and lazy re-surfacing.
    #[inline]
    pub fn web_socket(err: &WsError) -> Self {
        Self::WebSocket {
            message: describe_ws_error(err),
        }
    }

    /// Creates a receive error from a transport failure.
    #[inline]
    pub fn receive(err: &WsError) -> Self {
        Self::Receive {
            message: describe_ws_error(err),
        }
    }

    /// Creates a close-error-info error from a close code and reason.
    #[inline]
    pub fn close_error_info(info: impl Into<String>) -> Self {
        Self::CloseErrorInfo { info: info.into() }
    }

    /// Creates an unexpected-data error.
    #[inline]
    pub fn unexpected_data(message: impl Into<String>) -> Self {
        Self::UnexpectedData {
            message: message.into(),
        }
    }

    /// Creates a malformed-frame error.
    #[inline]
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Creates an invalid-target error.
    #[inline]
    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::InvalidTarget {
            message: message.into(),
        }
    }

    /// Creates a callback error.
    #[inline]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }
}

/// Synthesizes `"Kind: description"` for a library-reported failure, so the
/// recorded message names the kind of failure as well as its cause.
fn describe_ws_error(err: &WsError) -> String {
    let kind = match err {
        WsError::ConnectionClosed => "ConnectionClosed",
        WsError::AlreadyClosed => "AlreadyClosed",
        WsError::Io(_) => "Io",
        WsError::Tls(_) => "Tls",
        WsError::Capacity(_) => "Capacity",
        WsError::Protocol(_) => "Protocol",
        WsError::WriteBufferFull(_) => "WriteBufferFull",
        WsError::Url(_) => "Url",
        WsError::Http(_) => "Http",
        WsError::HttpFormat(_) => "HttpFormat",
        _ => "WebSocket",
    };
    format!("{kind}: {err}")
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionCreation
                | Self::UnexpectedClose
                | Self::WebSocket { .. }
                | Self::Receive { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed when the caller recreates the client
    /// and reconnects; there is no retry inside the client itself.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionCreation
                | Self::UnexpectedClose
                | Self::WebSocket { .. }
                | Self::Receive { .. }
                | Self::CloseErrorInfo { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let err = Error::unexpected_data("opcode [Text]");
        assert_eq!(err.to_string(), "Unexpected WebSocket data: opcode [Text]");
    }

    #[test]
    fn test_invalid_target_display() {
        let err = Error::invalid_target("missing project");
        assert_eq!(err.to_string(), "Invalid tunnel target: missing project");
    }

    #[test]
    fn test_web_socket_names_kind_and_cause() {
        let io_err = IoError::new(ErrorKind::ConnectionRefused, "connection refused");
        let ws_err = WsError::Io(io_err);
        let err = Error::web_socket(&ws_err);

        let message = err.to_string();
        assert!(message.contains("Io:"));
        assert!(message.contains("connection refused"));
    }

    #[test]
    fn test_receive_names_kind() {
        let err = Error::receive(&WsError::ConnectionClosed);
        assert!(err.to_string().contains("ConnectionClosed:"));
    }

    #[test]
    fn test_clone_surfaces_same_error() {
        let err = Error::receive(&WsError::ConnectionClosed);
        let again = err.clone();
        assert_eq!(err, again);
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::ConnectionCreation.is_connection_error());
        assert!(Error::UnexpectedClose.is_connection_error());
        assert!(!Error::invalid_target("x").is_connection_error());
        assert!(!Error::callback("x").is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::ConnectionCreation.is_recoverable());
        assert!(Error::close_error_info("code 1011").is_recoverable());
        assert!(!Error::invalid_target("x").is_recoverable());
        assert!(!Error::malformed_frame("short").is_recoverable());
    }
}
