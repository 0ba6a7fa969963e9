//! Tunnel WebSocket client layer.
//!
//! This module owns the full-duplex byte-stream tunnel to the IAP relay.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                               ┌─────────────────┐
//! │  Relay / caller  │                               │  IAP relay      │
//! │  (SSH, RDP, …)   │          WebSocket            │  endpoint       │
//! │                  │◄─────────────────────────────►│                 │
//! │  IapTunnelClient │   wss://…/v4/connect?…        │  Subprotocol    │
//! │  → event loop    │   (optional HTTP proxy)       │  frames         │
//! └──────────────────┘                               └─────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. [`IapTunnelClient::new`] - construct with target, token, callback
//! 2. [`IapTunnelClient::initiate_connection`] - validate, spawn event loop
//! 3. [`IapTunnelClient::wait_for_open`] - block until usable (or failed)
//! 4. [`IapTunnelClient::send`] - chunked DATA frames outbound; inbound
//!    DATA payloads arrive on the callback
//! 5. [`IapTunnelClient::close`] - idempotent shutdown
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | Tunnel client and event loop |
//! | `connect` | Handshake request, proxy CONNECT, TLS setup |

// ============================================================================
// Submodules
// ============================================================================

/// Tunnel client and event loop.
pub mod client;

/// Connection establishment: handshake request, proxy CONNECT, TLS.
mod connect;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{DataCallback, IapTunnelClient};
