//! IAP tunnel - TCP tunneling client over WebSocket.
//!
//! This library multiplexes a TCP-like byte stream over a WebSocket
//! connection to an Identity-Aware Proxy relay endpoint, relaying SSH/RDP/
//! raw TCP traffic to private VMs without public IPs.
//!
//! # Architecture
//!
//! One [`IapTunnelClient`] owns one WebSocket connection:
//!
//! - **Outbound**: `send(bytes)` chunks the payload into subprotocol DATA
//!   frames and hands them to a background event-loop task.
//! - **Inbound**: the event loop unwraps DATA frames and invokes the
//!   caller-supplied callback with each payload.
//! - **Failures**: transport errors are caught on the event loop, recorded,
//!   and surfaced lazily to whichever caller next inspects state. There is
//!   no automatic reconnection; a relay loop around the client recreates it.
//!
//! # Quick Start
//!
//! ```no_run
//! use iap_tunnel::{IapTunnelClient, Result, TunnelTarget};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let target = TunnelTarget::new("my-project", "us-central1-a", "my-vm", 22);
//!
//!     let client = IapTunnelClient::new(
//!         target,
//!         Some("ya29.access-token".to_owned()),
//!         Box::new(|data| {
//!             // Feed inbound tunnel bytes to the local socket...
//!             println!("received {} bytes", data.len());
//!             Ok(())
//!         }),
//!         false,
//!     );
//!
//!     client.initiate_connection()?;
//!     client.wait_for_open().await?;
//!     client.send(b"SSH-2.0-OpenSSH_9.6\r\n").await?;
//!
//!     client.close()?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`subprotocol`] | Relay subprotocol framing and URL construction |
//! | [`target`] | [`TunnelTarget`] and [`ProxyConfig`] descriptors |
//! | [`tunnel`] | [`IapTunnelClient`] and its event loop |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Relay subprotocol framing.
///
/// Frame encode/decode, tag constants, and relay URL construction.
pub mod subprotocol;

/// Tunnel target and proxy configuration descriptors.
pub mod target;

/// Tunnel WebSocket client.
///
/// Connection lifecycle, background event loop, send chunking.
pub mod tunnel;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use tunnel::{DataCallback, IapTunnelClient};

// Target types
pub use target::{ProxyConfig, TunnelTarget};

// Error types
pub use error::{Error, Result};

// Subprotocol constants
pub use subprotocol::{MAX_DATA_FRAME_SIZE, SUBPROTOCOL_NAME};
