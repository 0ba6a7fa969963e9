//! Tunnel WebSocket client and its event loop.
//!
//! [`IapTunnelClient`] owns one WebSocket connection to the relay. The
//! blocking work happens on a spawned event-loop task; callers interact
//! through a command channel and a phase watch channel.
//!
//! # Lifecycle
//!
//! ```text
//! Unconnected ──initiate_connection──► Connecting ──handshake──► Open
//!                                           │                     │
//!                                           └──────── error ──────┤
//!                                                                 ▼
//!                                                              Closed
//! ```
//!
//! Errors can occur in any non-terminal phase and always transition to
//! `Closed`. They are recorded in an append-only list and surfaced lazily:
//! whichever caller next touches [`IapTunnelClient::send`],
//! [`IapTunnelClient::wait_for_open`], or [`IapTunnelClient::close`]
//! receives the most recent recorded error. There is no retry inside the
//! client; reconnection means building a new client.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::subprotocol::{
    self, CONNECT_ENDPOINT, MAX_DATA_FRAME_SIZE, TAG_CONNECT_SUCCESS_SID, TAG_DATA,
};
use crate::target::{ProxyConfig, TunnelTarget};

use super::connect;

// ============================================================================
// Types
// ============================================================================

/// Caller-supplied sink for inbound tunnel bytes.
///
/// Invoked once per received DATA frame with the unwrapped payload. An `Err`
/// return is fatal to the connection: it is recorded, the connection is
/// closed, and the event loop terminates.
pub type DataCallback = Box<dyn FnMut(Vec<u8>) -> Result<()> + Send>;

/// Internal commands for the event loop.
enum Command {
    /// Write one already-framed binary message and report the result.
    Send {
        frame: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    /// Close the WebSocket and terminate the loop.
    Shutdown,
}

/// Connection phase, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// `initiate_connection` has not run.
    Unconnected,
    /// Event loop spawned, handshake in flight.
    Connecting,
    /// Handshake completed; tunnel traffic can flow.
    Open,
    /// Terminal. Reached from every exit path.
    Closed,
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared between callers and the event-loop task.
struct Shared {
    /// Connection phase; watch so waiters are signalled, not polled.
    phase: watch::Sender<Phase>,

    /// Live connection attempt. A superseded event loop must not touch
    /// shared state, so every mutation from the loop is generation-checked.
    generation: AtomicU64,

    /// Recorded failures, append-only; only the last is surfaced.
    errors: Mutex<Vec<Error>>,

    /// Server-issued session id from the connect acknowledgment.
    session_id: Mutex<Option<Vec<u8>>>,

    /// Set once the connect acknowledgment arrives; gates DATA frames.
    connect_msg_received: AtomicBool,

    /// Cumulative DATA payload bytes received, acked after each send.
    total_bytes_received: AtomicU64,
}

impl Shared {
    /// Returns `true` if `generation` is the live connection attempt.
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Publishes a phase transition on behalf of `generation`. A stale
    /// loop's terminal `Closed` must not stomp its successor's phase.
    fn set_phase(&self, generation: u64, phase: Phase) {
        if self.is_current(generation) {
            self.phase.send_replace(phase);
        }
    }

    /// Records a failure for `generation` and logs it. The phase transition
    /// to `Closed` happens on the event loop's exit path.
    fn record_error(&self, generation: u64, err: Error) {
        if !self.is_current(generation) {
            debug!(error = %err, "dropping error from superseded connection attempt");
            return;
        }
        error!(error = %err, "tunnel error recorded");
        self.errors.lock().push(err);
    }

    fn last_error(&self) -> Option<Error> {
        self.errors.lock().last().cloned()
    }
}

// ============================================================================
// IapTunnelClient
// ============================================================================

/// WebSocket client tunneling a TCP-like byte stream through the IAP relay.
///
/// Exposes `send(bytes)` outbound and a callback-based receive path to a
/// higher-level relay (e.g. a local TCP proxy feeding an SSH client).
///
/// # Thread Safety
///
/// The client is `Send + Sync`; every method takes `&self` and may be called
/// from any task. [`close`](Self::close) is safe to call concurrently with
/// event-loop activity.
pub struct IapTunnelClient {
    /// Immutable connection parameters.
    target: TunnelTarget,
    /// Bearer token for the relay handshake.
    access_token: Option<String>,
    /// Disables TLS verification for test and debug relays.
    ignore_certs: bool,
    /// Consumer of inbound DATA payloads, shared with the event loop.
    callback: Arc<Mutex<DataCallback>>,
    /// Command channel to the live event loop, if any. Taken on close so
    /// only the first close reaches the socket.
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    /// State shared with the event loop.
    shared: Arc<Shared>,
}

impl IapTunnelClient {
    /// Creates a client for `target`.
    ///
    /// # Arguments
    ///
    /// * `target` - VM interface and port to tunnel to
    /// * `access_token` - Bearer token sent in the handshake, if any
    /// * `callback` - Consumer of inbound tunnel bytes
    /// * `ignore_certs` - Disable TLS verification (test relays only)
    #[must_use]
    pub fn new(
        target: TunnelTarget,
        access_token: Option<String>,
        callback: DataCallback,
        ignore_certs: bool,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Unconnected);
        Self {
            target,
            access_token,
            ignore_certs,
            callback: Arc::new(Mutex::new(callback)),
            command_tx: Mutex::new(None),
            shared: Arc::new(Shared {
                phase,
                generation: AtomicU64::new(0),
                errors: Mutex::new(Vec::new()),
                session_id: Mutex::new(None),
                connect_msg_received: AtomicBool::new(false),
                total_bytes_received: AtomicU64::new(0),
            }),
        }
    }

    /// Initiates the WebSocket connection.
    ///
    /// Validates the target, builds the handshake request and TLS connector,
    /// and spawns the event-loop task. Returns immediately; the handshake
    /// completes in the background. Use [`wait_for_open`](Self::wait_for_open)
    /// to block until the tunnel is usable.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTarget`] if the target or access token is invalid
    /// - [`Error::WebSocket`] if TLS setup fails or a connection is already
    ///   in flight
    pub fn initiate_connection(&self) -> Result<()> {
        self.target.validate()?;
        let url = subprotocol::create_websocket_url(CONNECT_ENDPOINT, &self.target)?;
        let request = connect::build_request(&url, self.access_token.as_deref())?;
        let connector = connect::build_tls_connector(self.ignore_certs)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        {
            let mut guard = self.command_tx.lock();
            if guard.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return Err(Error::WebSocket {
                    message: "connection already initiated".to_owned(),
                });
            }
            *guard = Some(command_tx);
        }

        // Supersede any previous attempt before resetting its state, so a
        // still-draining loop can no longer touch the phase or errors.
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.errors.lock().clear();
        *self.shared.session_id.lock() = None;
        self.shared.connect_msg_received.store(false, Ordering::Release);
        self.shared.phase.send_replace(Phase::Connecting);

        info!(url = %url, "connecting to relay");
        tokio::spawn(run_event_loop(
            request,
            self.target.proxy.clone(),
            connector,
            command_rx,
            generation,
            Arc::clone(&self.shared),
            Arc::clone(&self.callback),
        ));
        Ok(())
    }

    /// Waits until the connection is open or a failure is recorded.
    ///
    /// # Errors
    ///
    /// Returns the most recent recorded error, or
    /// [`Error::ConnectionCreation`] if the connection went away (or was
    /// never initiated) without one.
    pub async fn wait_for_open(&self) -> Result<()> {
        let mut phase_rx = self.shared.phase.subscribe();
        loop {
            match *phase_rx.borrow_and_update() {
                Phase::Open => return Ok(()),
                Phase::Unconnected | Phase::Closed => {
                    return Err(self.last_error().unwrap_or(Error::ConnectionCreation));
                }
                Phase::Connecting => {}
            }
            if phase_rx.changed().await.is_err() {
                return Err(self.last_error().unwrap_or(Error::ConnectionCreation));
            }
        }
    }

    /// Sends bytes over the tunnel.
    ///
    /// Blocks via [`wait_for_open`](Self::wait_for_open) if the connection
    /// is not yet open. The payload is split into DATA frames of at most
    /// [`MAX_DATA_FRAME_SIZE`] payload bytes each; an ACK for cumulative
    /// received bytes follows the batch. Each frame's socket write is
    /// awaited, so write failures surface here and a fast producer is
    /// paced by the connection.
    ///
    /// # Errors
    ///
    /// - The most recent recorded error, if the connection failed
    /// - [`Error::UnexpectedClose`] if the connection vanished mid-send
    ///   without a recorded cause
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            self.wait_for_open().await?;
        }
        for chunk in data.chunks(MAX_DATA_FRAME_SIZE) {
            self.send_frame(subprotocol::create_data_frame(chunk)).await?;
        }
        self.send_ack().await
    }

    /// Closes the connection. Idempotent.
    ///
    /// The first call shuts the event loop down; the socket close ignores
    /// transport-level failures. Every call returns the most recent recorded
    /// error so the caller observes failure causes even after a clean
    /// shutdown attempt.
    ///
    /// # Errors
    ///
    /// Returns the last recorded error, if any.
    pub fn close(&self) -> Result<()> {
        if let Some(command_tx) = self.command_tx.lock().take() {
            let _ = command_tx.send(Command::Shutdown);
        }
        self.shared.phase.send_replace(Phase::Closed);
        match self.last_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns `true` if the WebSocket handshake has completed and the
    /// connection has not closed.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.shared.phase.borrow() == Phase::Open
    }

    /// Returns the server-issued session id, once the connect
    /// acknowledgment has arrived.
    #[must_use]
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.shared.session_id.lock().clone()
    }

    /// Returns cumulative DATA payload bytes received over this connection.
    #[inline]
    #[must_use]
    pub fn total_bytes_received(&self) -> u64 {
        self.shared.total_bytes_received.load(Ordering::Acquire)
    }

    /// Queues one framed message for the event loop and waits for the
    /// socket write to land.
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = {
            let guard = self.command_tx.lock();
            guard.as_ref().is_some_and(|command_tx| {
                command_tx
                    .send(Command::Send {
                        frame,
                        done: done_tx,
                    })
                    .is_ok()
            })
        };
        if !queued {
            return Err(self.last_error().unwrap_or(Error::UnexpectedClose));
        }
        match done_rx.await {
            Ok(result) => result,
            // Event loop died before writing this frame.
            Err(_) => Err(self.last_error().unwrap_or(Error::UnexpectedClose)),
        }
    }

    /// Acks cumulative received bytes, if any.
    async fn send_ack(&self) -> Result<()> {
        let total = self.total_bytes_received();
        if total == 0 {
            return Ok(());
        }
        self.send_frame(subprotocol::create_ack_frame(total)).await
    }

    fn last_error(&self) -> Option<Error> {
        self.shared.last_error()
    }
}

impl Drop for IapTunnelClient {
    fn drop(&mut self) {
        // Best-effort shutdown of the event loop; errors are unobservable
        // at this point.
        if let Some(command_tx) = self.command_tx.lock().take() {
            let _ = command_tx.send(Command::Shutdown);
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Connects to the relay and runs the receive/command loop until the
/// connection ends. Every exit path transitions the phase to `Closed`.
async fn run_event_loop(
    request: Request,
    proxy: Option<ProxyConfig>,
    connector: Connector,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    generation: u64,
    shared: Arc<Shared>,
    callback: Arc<Mutex<DataCallback>>,
) {
    let ws_stream = match connect::connect(request, proxy.as_ref(), connector).await {
        Ok(stream) => stream,
        Err(err) => {
            shared.record_error(generation, err);
            shared.set_phase(generation, Phase::Closed);
            fail_pending_sends(&mut command_rx, generation, &shared);
            return;
        }
    };
    shared.set_phase(generation, Phase::Open);

    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            // Inbound messages from the relay
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(err) = handle_frame(&data, generation, &shared, &callback) {
                            shared.record_error(generation, err);
                            let _ = ws_write.close().await;
                            break;
                        }
                    }

                    Some(Ok(Message::Close(close_frame))) => {
                        match close_frame {
                            Some(frame)
                                if frame.code != CloseCode::Normal
                                    || !frame.reason.is_empty() =>
                            {
                                shared.record_error(generation, Error::close_error_info(format!(
                                    "code [{}], reason [{}]",
                                    frame.code, frame.reason
                                )));
                            }
                            _ => info!("WebSocket connection closed"),
                        }
                        break;
                    }

                    Some(Ok(Message::Text(_))) => {
                        warn!("unexpected text message, discarding");
                    }

                    Some(Err(err)) => {
                        shared.record_error(generation, Error::receive(&err));
                        break;
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }

                    // Ping/Pong handled by the library
                    _ => {}
                }
            }

            // Commands from the caller
            command = command_rx.recv() => {
                match command {
                    Some(Command::Send { frame, done }) => {
                        match ws_write.send(Message::Binary(frame.into())).await {
                            Ok(()) => {
                                let _ = done.send(Ok(()));
                            }
                            Err(err) => {
                                let err = Error::web_socket(&err);
                                shared.record_error(generation, err.clone());
                                let _ = done.send(Err(err));
                                break;
                            }
                        }
                    }

                    Some(Command::Shutdown) | None => {
                        debug!("shutdown requested");
                        // Transport failures while closing are ignored.
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }

    shared.set_phase(generation, Phase::Closed);
    fail_pending_sends(&mut command_rx, generation, &shared);
    debug!("event loop terminated");
}

/// Completes every queued send with the connection's failure cause so no
/// sender waits on a loop that has already exited.
fn fail_pending_sends(
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    generation: u64,
    shared: &Shared,
) {
    command_rx.close();
    while let Ok(command) = command_rx.try_recv() {
        if let Command::Send { done, .. } = command {
            let err = if shared.is_current(generation) {
                shared.last_error().unwrap_or(Error::UnexpectedClose)
            } else {
                Error::UnexpectedClose
            };
            let _ = done.send(Err(err));
        }
    }
}

/// Dispatches one inbound subprotocol frame.
///
/// An `Err` return is fatal to the event loop.
fn handle_frame(
    data: &[u8],
    generation: u64,
    shared: &Shared,
    callback: &Mutex<DataCallback>,
) -> Result<()> {
    if !shared.is_current(generation) {
        // A newer connection owns the shared state now.
        return Ok(());
    }
    let (tag, body) = subprotocol::extract_subprotocol_tag(data)?;
    // In order of decreasing frequency during a connection:
    match tag {
        TAG_DATA => handle_data(body, shared, callback),
        TAG_CONNECT_SUCCESS_SID => handle_connect_success(body, shared),
        other => {
            warn!(tag = other, "unsupported subprotocol tag, discarding message");
            Ok(())
        }
    }
}

/// Handles a DATA frame: counts the payload and forwards it to the caller.
fn handle_data(body: &[u8], shared: &Shared, callback: &Mutex<DataCallback>) -> Result<()> {
    if !shared.connect_msg_received.load(Ordering::Acquire) {
        return Err(Error::unexpected_data(
            "received DATA before connect acknowledgment",
        ));
    }

    let (payload, rest) = subprotocol::extract_subprotocol_data(body)?;
    shared
        .total_bytes_received
        .fetch_add(payload.len() as u64, Ordering::AcqRel);

    let mut callback = callback.lock();
    (*callback)(payload.to_vec()).map_err(|err| {
        error!(error = %err, "data callback failed, closing connection");
        Error::callback(err.to_string())
    })?;

    if !rest.is_empty() {
        warn!(extra = rest.len(), "discarding extra bytes after DATA");
    }
    Ok(())
}

/// Handles a CONNECT_SUCCESS_SID frame: stores the session id.
fn handle_connect_success(body: &[u8], shared: &Shared) -> Result<()> {
    let (sid, rest) = subprotocol::extract_subprotocol_connect_success_sid(body)?;
    debug!(sid_len = sid.len(), "connect acknowledged by relay");
    *shared.session_id.lock() = Some(sid.to_vec());
    shared.connect_msg_received.store(true, Ordering::Release);

    if !rest.is_empty() {
        warn!(
            extra = rest.len(),
            "discarding extra bytes after CONNECT_SUCCESS_SID"
        );
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn shared() -> Arc<Shared> {
        let (phase, _) = watch::channel(Phase::Unconnected);
        Arc::new(Shared {
            phase,
            generation: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
            session_id: Mutex::new(None),
            connect_msg_received: AtomicBool::new(false),
            total_bytes_received: AtomicU64::new(0),
        })
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> Mutex<DataCallback> {
        Mutex::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn connect_success_frame(sid: &[u8]) -> Vec<u8> {
        let mut frame = TAG_CONNECT_SUCCESS_SID.to_be_bytes().to_vec();
        frame.extend_from_slice(&(sid.len() as u32).to_be_bytes());
        frame.extend_from_slice(sid);
        frame
    }

    #[test]
    fn test_connect_success_sets_session_id_without_callback() {
        let shared = shared();
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = counting_callback(Arc::clone(&calls));

        handle_frame(&connect_success_frame(b"sid1"), 0, &shared, &callback).unwrap();

        assert_eq!(shared.session_id.lock().as_deref(), Some(b"sid1".as_slice()));
        assert!(shared.connect_msg_received.load(Ordering::Acquire));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_data_dispatches_callback_exactly_once() {
        let shared = shared();
        shared.connect_msg_received.store(true, Ordering::Release);
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = counting_callback(Arc::clone(&calls));

        handle_frame(&subprotocol::create_data_frame(b"hello"), 0, &shared, &callback).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared.total_bytes_received.load(Ordering::Acquire), 5);
    }

    #[test]
    fn test_data_before_connect_ack_rejected() {
        let shared = shared();
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = counting_callback(Arc::clone(&calls));

        let err =
            handle_frame(&subprotocol::create_data_frame(b"x"), 0, &shared, &callback).unwrap_err();

        assert!(matches!(err, Error::UnexpectedData { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_tag_discarded_without_state_change() {
        let shared = shared();
        let calls = Arc::new(AtomicUsize::new(0));
        let callback = counting_callback(Arc::clone(&calls));

        let mut frame = 0x00ffu16.to_be_bytes().to_vec();
        frame.extend_from_slice(b"whatever");
        handle_frame(&frame, 0, &shared, &callback).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(shared.session_id.lock().is_none());
        assert_eq!(shared.total_bytes_received.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_callback_failure_is_fatal() {
        let shared = shared();
        shared.connect_msg_received.store(true, Ordering::Release);
        let callback: Mutex<DataCallback> =
            Mutex::new(Box::new(|_| Err(Error::callback("consumer broke"))));

        let err =
            handle_frame(&subprotocol::create_data_frame(b"x"), 0, &shared, &callback).unwrap_err();

        assert!(matches!(err, Error::Callback { .. }));
    }

    fn client() -> IapTunnelClient {
        IapTunnelClient::new(
            TunnelTarget::new("p", "z", "i", 22),
            None,
            Box::new(|_| Ok(())),
            false,
        )
    }

    #[test]
    fn test_close_before_initiate_is_noop() {
        let client = client();
        assert!(client.close().is_ok());
        assert!(client.close().is_ok());
    }

    #[tokio::test]
    async fn test_wait_before_initiate_raises_connection_creation() {
        let client = client();
        assert_eq!(client.wait_for_open().await, Err(Error::ConnectionCreation));
    }

    #[tokio::test]
    async fn test_send_after_close_raises_unexpected_close() {
        let client = client();
        client.close().ok();
        // Closed phase with no recorded error short-circuits via wait_for_open.
        assert_eq!(
            client.send(b"data").await,
            Err(Error::ConnectionCreation)
        );
        // Direct frame queueing reports the vanished connection.
        assert_eq!(
            client.send_frame(subprotocol::create_data_frame(b"x")).await,
            Err(Error::UnexpectedClose)
        );
    }

    #[test]
    fn test_invalid_target_rejected_before_spawn() {
        let client = IapTunnelClient::new(
            TunnelTarget::new("", "z", "i", 22),
            None,
            Box::new(|_| Ok(())),
            false,
        );
        assert!(matches!(
            client.initiate_connection(),
            Err(Error::InvalidTarget { .. })
        ));
    }
}
