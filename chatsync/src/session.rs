//! Transport session manager.
//!
//! Owns the single WebSocket session to the backend: the authentication
//! handshake, the inbound reader task, and the bounded reconnection policy.
//! One session per process -- the engine never opens a second one, regardless
//! of which conversation kind is active.
//!
//! State machine:
//!
//! ```text
//! Idle -> Connecting -> Connected -> (Reconnecting <-> ...) -> Disconnected
//! ```
//!
//! `Disconnected` is terminal: after the bounded retry budget is exhausted
//! the manager waits for an explicit [`SessionManager::reconnect`] call -- no
//! silent infinite retry. Only `Connected` accepts emits; every other state
//! returns [`SessionError::NotConnected`] so the caller can hand the action
//! to the outbound queue instead of dropping it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chatsync_proto::codec::{self, CodecError};
use chatsync_proto::event::{ClientEvent, ServerEvent};
use chatsync_proto::message::UserId;

/// Type alias for the write half of the WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Type alias for the read half of the WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Errors raised by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Connect or handshake exceeded its deadline.
    #[error("session operation timed out")]
    Timeout,

    /// The connection closed (or was never established).
    #[error("connection closed")]
    Closed,

    /// The backend rejected the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The session is not in the `Connected` state; the caller should queue
    /// the action.
    #[error("session not connected")]
    NotConnected,

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bounded reconnection policy: fixed delay between a fixed number of
/// attempts, then terminal disconnect.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Number of reconnection attempts before giving up.
    pub max_attempts: u32,
    /// Fixed delay before each attempt.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the backend event channel (e.g. `ws://host/ws`).
    pub server_url: String,
    /// The authenticating user.
    pub user_id: UserId,
    /// Deadline for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Deadline for the `Connect`/`Welcome` handshake.
    pub handshake_timeout: Duration,
    /// Reconnection policy after a drop.
    pub reconnect: ReconnectPolicy,
    /// Capacity of the session event channel.
    pub event_buffer: usize,
}

impl SessionConfig {
    /// Creates a config with default timeouts and reconnect policy.
    #[must_use]
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            user_id,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            event_buffer: 256,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected.
    Idle,
    /// Initial connection in progress.
    Connecting,
    /// Live session; emits are accepted.
    Connected,
    /// Automatic reconnection in progress.
    Reconnecting {
        /// The attempt currently being made (1-based).
        attempt: u32,
    },
    /// Retry budget exhausted; waiting for an explicit reconnect call.
    Disconnected,
}

/// Events emitted by the session manager, consumed by the engine loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session (re-)entered `Connected`.
    Connected,
    /// A reconnection attempt is starting.
    Reconnecting {
        /// The attempt being made (1-based).
        attempt: u32,
        /// Total attempts in the budget.
        max_attempts: u32,
    },
    /// The retry budget is exhausted; the session is terminal until an
    /// explicit reconnect.
    Disconnected,
    /// An inbound event from the backend, in arrival order.
    Inbound(ServerEvent),
}

/// Shared state between the manager handle and its background tasks.
struct Shared {
    config: SessionConfig,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<WsSender>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn state(&self) -> SessionState {
        self.state.lock().map_or(SessionState::Disconnected, |s| *s)
    }
}

/// Manages the single backend session.
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Establishes the session: dials the server, performs the
    /// `Connect`/`Welcome` handshake, and spawns the inbound reader task.
    ///
    /// Returns the manager and the receiver for [`SessionEvent`]s. The first
    /// event delivered is `Connected`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the connection or handshake fails; no
    /// automatic retry is made for the initial connect.
    pub async fn connect(
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(SessionState::Connecting),
            writer: tokio::sync::Mutex::new(None),
            event_tx,
        });

        let (sender, reader) = dial(&shared.config).await.inspect_err(|_| {
            shared.set_state(SessionState::Idle);
        })?;

        *shared.writer.lock().await = Some(sender);
        shared.set_state(SessionState::Connected);
        let _ = shared.event_tx.send(SessionEvent::Connected).await;

        tokio::spawn(session_task(reader, Arc::clone(&shared)));

        Ok((Self { shared }, event_rx))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Emits an event on the live session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] in any state but `Connected`
    /// (the caller routes the action to the outbound queue), or
    /// [`SessionError::Closed`] if the socket drops mid-send.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), SessionError> {
        if self.shared.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let bytes = codec::encode_client(event)?;

        let mut writer = self.shared.writer.lock().await;
        let Some(sender) = writer.as_mut() else {
            return Err(SessionError::NotConnected);
        };
        sender
            .send(WsMessage::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "session send failed");
                SessionError::Closed
            })
    }

    /// Explicit reconnect from the terminal `Disconnected` state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the session is not terminal or the dial
    /// fails; the session stays `Disconnected` on failure.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        if self.shared.state() != SessionState::Disconnected {
            return Err(SessionError::NotConnected);
        }
        self.shared.set_state(SessionState::Connecting);
        match dial(&self.shared.config).await {
            Ok((sender, reader)) => {
                *self.shared.writer.lock().await = Some(sender);
                self.shared.set_state(SessionState::Connected);
                let _ = self.shared.event_tx.send(SessionEvent::Connected).await;
                tokio::spawn(session_task(reader, Arc::clone(&self.shared)));
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }
}

/// Dials the server and performs the `Connect`/`Welcome` handshake.
async fn dial(config: &SessionConfig) -> Result<(WsSender, WsReader), SessionError> {
    let (ws_stream, _response) =
        tokio::time::timeout(config.connect_timeout, connect_async(config.server_url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %config.server_url, "session connect timed out");
                SessionError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %config.server_url, err = %e, "session connect failed");
                map_ws_connect_error(e)
            })?;

    let (mut sender, mut reader) = ws_stream.split();

    let connect = ClientEvent::Connect {
        user_id: config.user_id.clone(),
    };
    let bytes = codec::encode_client(&connect)?;
    sender
        .send(WsMessage::Binary(bytes.into()))
        .await
        .map_err(|e| {
            tracing::warn!(err = %e, "failed to send handshake");
            SessionError::Closed
        })?;

    let ack = tokio::time::timeout(config.handshake_timeout, reader.next())
        .await
        .map_err(|_| {
            tracing::warn!(url = %config.server_url, "handshake acknowledgment timed out");
            SessionError::Timeout
        })?;

    match ack {
        Some(Ok(WsMessage::Binary(data))) => match codec::decode_server(&data) {
            Ok(ServerEvent::Welcome { user_id }) => {
                tracing::info!(user_id = %user_id, url = %config.server_url, "session established");
                Ok((sender, reader))
            }
            Ok(ServerEvent::Error { message }) => {
                tracing::warn!(reason = %message, "handshake rejected");
                Err(SessionError::Rejected(message))
            }
            Ok(other) => {
                tracing::warn!(?other, "unexpected event during handshake");
                Err(SessionError::Rejected(
                    "unexpected event during handshake".into(),
                ))
            }
            Err(e) => {
                tracing::warn!(err = %e, "malformed handshake response");
                Err(SessionError::Rejected(format!(
                    "malformed handshake response: {e}"
                )))
            }
        },
        Some(Ok(WsMessage::Close(_))) | None => Err(SessionError::Closed),
        Some(Ok(_)) => Err(SessionError::Rejected(
            "unexpected non-binary frame during handshake".into(),
        )),
        Some(Err(e)) => Err(SessionError::Rejected(format!(
            "WebSocket error during handshake: {e}"
        ))),
    }
}

/// Background task: drives one established session through reads and
/// bounded reconnects until the session is terminal or the engine is gone.
async fn session_task(mut reader: WsReader, shared: Arc<Shared>) {
    loop {
        read_frames(&mut reader, &shared).await;
        shared.writer.lock().await.take();

        if shared.event_tx.is_closed() {
            // Receiver dropped; the engine is gone.
            return;
        }
        match run_reconnect(&shared).await {
            Some(new_reader) => reader = new_reader,
            None => return,
        }
    }
}

/// Reads inbound frames and forwards them in arrival order until the stream
/// ends.
///
/// Malformed frames are logged and skipped -- the reader does not disconnect
/// on bad data.
async fn read_frames(reader: &mut WsReader, shared: &Arc<Shared>) {
    while let Some(msg_result) = reader.next().await {
        match msg_result {
            Ok(WsMessage::Binary(data)) => match codec::decode_server(&data) {
                Ok(ServerEvent::Welcome { .. }) => {
                    // Handshake frames are consumed during dial; a stray one
                    // here is harmless.
                }
                Ok(event) => {
                    if shared
                        .event_tx
                        .send(SessionEvent::Inbound(event))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed inbound frame, skipping");
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::info!("session closed by server");
                return;
            }
            Ok(_) => {
                // Ignore ping/pong/text frames.
            }
            Err(e) => {
                tracing::warn!(err = %e, "session read error");
                return;
            }
        }
    }
}

/// Bounded reconnection: fixed delay, fixed attempt budget, then terminal.
///
/// Returns the new read half on success, `None` once the budget is
/// exhausted (or the engine is gone).
async fn run_reconnect(shared: &Arc<Shared>) -> Option<WsReader> {
    let policy = shared.config.reconnect;
    for attempt in 1..=policy.max_attempts {
        shared.set_state(SessionState::Reconnecting { attempt });
        if shared
            .event_tx
            .send(SessionEvent::Reconnecting {
                attempt,
                max_attempts: policy.max_attempts,
            })
            .await
            .is_err()
        {
            return None;
        }

        tokio::time::sleep(policy.delay).await;

        match dial(&shared.config).await {
            Ok((sender, reader)) => {
                *shared.writer.lock().await = Some(sender);
                shared.set_state(SessionState::Connected);
                let _ = shared.event_tx.send(SessionEvent::Connected).await;
                return Some(reader);
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    err = %e,
                    "reconnection attempt failed"
                );
            }
        }
    }

    tracing::warn!("reconnection budget exhausted, session is terminal");
    shared.set_state(SessionState::Disconnected);
    let _ = shared.event_tx.send(SessionEvent::Disconnected).await;
    None
}

/// Maps a `tokio_tungstenite` connection error to a [`SessionError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> SessionError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => SessionError::Io(io_err),
        WsError::Http(response) => SessionError::Rejected(format!(
            "server HTTP error: status {}",
            response.status()
        )),
        other => SessionError::Rejected(format!("connection error: {other}")),
    }
}
