//! Tunnel target and proxy configuration types.
//!
//! A [`TunnelTarget`] names the VM interface and port a tunnel connects to.
//! It is supplied by the caller and read-only to the client.
//!
//! # Example
//!
//! ```
//! use iap_tunnel::{ProxyConfig, TunnelTarget};
//!
//! let target = TunnelTarget::new("my-project", "us-central1-a", "my-vm", 22);
//!
//! // Tunnel through a corporate HTTP proxy
//! let target = TunnelTarget::new("my-project", "us-central1-a", "my-vm", 3389)
//!     .with_interface("nic1")
//!     .with_proxy(ProxyConfig::new("proxy.corp.example", 3128).with_credentials("user", "pass"));
//! ```

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default VM network interface.
const DEFAULT_INTERFACE: &str = "nic0";

// ============================================================================
// ProxyConfig
// ============================================================================

/// HTTP proxy configuration for the WebSocket connection.
///
/// The connection is established with an HTTP `CONNECT` request through the
/// proxy before the WebSocket handshake (and TLS, for `wss://`) runs over
/// the resulting stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy hostname.
    pub host: String,

    /// Proxy port.
    pub port: u16,

    /// Username for basic authentication (optional).
    pub username: Option<String>,

    /// Password for basic authentication (optional).
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Creates a new proxy configuration.
    ///
    /// # Arguments
    ///
    /// * `host` - Proxy hostname
    /// * `port` - Proxy port
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Sets basic authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Returns `true` if the proxy requires authentication.
    #[inline]
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

// ============================================================================
// TunnelTarget
// ============================================================================

/// Immutable descriptor of the VM/port a tunnel connects to.
///
/// Built once by the caller, validated by
/// [`IapTunnelClient::initiate_connection`](crate::IapTunnelClient::initiate_connection),
/// and never mutated by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Cloud project ID.
    pub project: String,

    /// Zone the instance runs in.
    pub zone: String,

    /// Instance name.
    pub instance: String,

    /// Network interface on the instance (default `nic0`).
    pub interface: String,

    /// Destination port on the instance.
    pub port: u16,

    /// Relay endpoint override, e.g. `ws://127.0.0.1:8080` for a local
    /// relay. When unset the production relay host is used.
    pub url_override: Option<String>,

    /// Optional HTTP proxy to connect through.
    pub proxy: Option<ProxyConfig>,
}

// ============================================================================
// TunnelTarget - Constructors
// ============================================================================

impl TunnelTarget {
    /// Creates a tunnel target for the default network interface.
    ///
    /// # Arguments
    ///
    /// * `project` - Cloud project ID
    /// * `zone` - Zone the instance runs in
    /// * `instance` - Instance name
    /// * `port` - Destination port on the instance
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            interface: DEFAULT_INTERFACE.to_owned(),
            port,
            url_override: None,
            proxy: None,
        }
    }
}

// ============================================================================
// TunnelTarget - Builder Methods
// ============================================================================

impl TunnelTarget {
    /// Sets the network interface to tunnel to.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Overrides the relay endpoint.
    ///
    /// Accepts a `ws://` or `wss://` base URL; the connect path and query
    /// are appended to it.
    #[must_use]
    pub fn with_url_override(mut self, url: impl Into<String>) -> Self {
        self.url_override = Some(url.into());
        self
    }

    /// Sets the HTTP proxy to connect through.
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

// ============================================================================
// TunnelTarget - Validation
// ============================================================================

impl TunnelTarget {
    /// Validates that the target names a reachable VM interface.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTarget`] if a required field is empty or the
    /// port is zero.
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(Error::invalid_target("missing project"));
        }
        if self.zone.is_empty() {
            return Err(Error::invalid_target("missing zone"));
        }
        if self.instance.is_empty() {
            return Err(Error::invalid_target("missing instance"));
        }
        if self.interface.is_empty() {
            return Err(Error::invalid_target("missing interface"));
        }
        if self.port == 0 {
            return Err(Error::invalid_target("missing port"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
