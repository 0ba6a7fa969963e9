//! Connection establishment for the tunnel WebSocket.
//!
//! This module builds the relay handshake request and dials the relay,
//! optionally through an HTTP proxy (`CONNECT` with basic auth). TLS for
//! `wss://` endpoints uses certificates from the platform trust store; the
//! ignore-certs flag disables verification for test and debug relays.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::subprotocol::{SUBPROTOCOL_NAME, TUNNEL_ORIGIN};
use crate::target::ProxyConfig;

// ============================================================================
// Constants
// ============================================================================

/// User agent reported to the relay.
const USER_AGENT: &str = concat!("iap-tunnel/", env!("CARGO_PKG_VERSION"));

/// Upper bound on the proxy's CONNECT response head.
const MAX_PROXY_RESPONSE: usize = 8192;

// ============================================================================
// Types
// ============================================================================

/// The established tunnel stream, plain or TLS.
pub(crate) type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Handshake Request
// ============================================================================

/// Builds the WebSocket handshake request for the relay.
///
/// Adds the user agent, the relay subprotocol, the tunneler origin, and the
/// bearer token when one is supplied.
///
/// # Errors
///
/// Returns [`Error::InvalidTarget`] if the access token contains bytes that
/// cannot appear in an HTTP header.
pub(crate) fn build_request(url: &Url, access_token: Option<&str>) -> Result<Request> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::web_socket(&e))?;

    let headers = request.headers_mut();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(SUBPROTOCOL_NAME),
    );
    headers.insert(header::ORIGIN, HeaderValue::from_static(TUNNEL_ORIGIN));

    if let Some(token) = access_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::invalid_target("access token is not a valid header value"))?;
        headers.insert(header::AUTHORIZATION, value);
    }

    Ok(request)
}

// ============================================================================
// TLS Connector
// ============================================================================

/// Builds the TLS connector for `wss://` endpoints.
///
/// Verification uses the platform trust store unless `ignore_certs` is set.
///
/// # Errors
///
/// Returns [`Error::WebSocket`] if the native TLS backend fails to
/// initialize.
pub(crate) fn build_tls_connector(ignore_certs: bool) -> Result<Connector> {
    let mut builder = native_tls::TlsConnector::builder();
    if ignore_certs {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().map_err(|e| Error::WebSocket {
        message: format!("TLS setup failed: {e}"),
    })?;
    Ok(Connector::NativeTls(connector))
}

// ============================================================================
// Connection
// ============================================================================

/// Dials the relay and completes the WebSocket handshake.
///
/// With a proxy configured, the TCP stream is established with an HTTP
/// `CONNECT` through it first; TLS (for `wss://`) then runs end to end over
/// the proxied stream.
///
/// # Errors
///
/// Returns [`Error::WebSocket`] if the TCP connection, the proxy CONNECT,
/// or the WebSocket handshake fails.
pub(crate) async fn connect(
    request: Request,
    proxy: Option<&ProxyConfig>,
    connector: Connector,
) -> Result<TunnelStream> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| Error::invalid_target("relay URL has no host"))?
        .to_owned();
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("wss") => 443,
        _ => 80,
    });

    let stream = match proxy {
        Some(proxy) => connect_via_proxy(proxy, &host, port).await?,
        None => TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| Error::web_socket(&WsError::Io(e)))?,
    };

    let (ws_stream, response) =
        client_async_tls_with_config(request, stream, None, Some(connector))
            .await
            .map_err(|e| Error::web_socket(&e))?;

    debug!(status = %response.status(), "WebSocket handshake completed");
    Ok(ws_stream)
}

/// Establishes a TCP stream to `host:port` through an HTTP proxy.
async fn connect_via_proxy(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| Error::web_socket(&WsError::Io(e)))?;

    let mut connect_req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if proxy.has_credentials() {
        let credentials = format!(
            "{}:{}",
            proxy.username.as_deref().unwrap_or_default(),
            proxy.password.as_deref().unwrap_or_default()
        );
        connect_req.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    connect_req.push_str("\r\n");

    stream
        .write_all(connect_req.as_bytes())
        .await
        .map_err(|e| Error::web_socket(&WsError::Io(e)))?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    if status != Some("200") {
        return Err(Error::WebSocket {
            message: format!("proxy CONNECT failed: {status_line}"),
        });
    }

    debug!(proxy = %proxy.host, "proxy CONNECT established");
    Ok(stream)
}

/// Reads the proxy response head, up to and including the blank line.
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE {
            return Err(Error::WebSocket {
                message: "proxy CONNECT response too large".to_owned(),
            });
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| Error::web_socket(&WsError::Io(e)))?;
        if n == 0 {
            return Err(Error::WebSocket {
                message: "proxy closed connection during CONNECT".to_owned(),
            });
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

// ============================================================================
// Tests
// ============================================================================
