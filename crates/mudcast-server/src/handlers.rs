//! Connection handlers for the mudcast server.
//!
//! Each WebSocket is one player session. The first frame must be `Login`;
//! after that every client frame maps onto a registry or watch-list command
//! and all outbound traffic goes through the session's queue.

use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use crate::session::{Session, SessionDirectory, SessionError};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mudcast_core::{
    AttributeError, BroadcastRouter, ChannelRegistry, HistoryHook, MaxLengthHook,
    MemoryAttributes, Receiver, ReceiverRef, RegistryError, SendContext, Transition, WatchEngine,
};
use mudcast_protocol::{
    codec, codes, Frame, FrameType, ProtocolError, Version, PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a client command failed.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Attribute(#[from] AttributeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Message rejected on {0}")]
    Vetoed(String),

    #[error("Login required")]
    NotLoggedIn,

    #[error("Already logged in")]
    AlreadyLoggedIn,

    #[error("Unexpected frame: {0:?}")]
    Unexpected(FrameType),

    #[error("Protocol version {client} not supported (server speaks {server})")]
    Version { client: Version, server: Version },
}

impl CommandError {
    /// Wire error code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            CommandError::Registry(e) => match e {
                RegistryError::ChannelNotFound(_) => codes::CHANNEL_NOT_FOUND,
                RegistryError::PermissionDenied { .. } => codes::PERMISSION_DENIED,
                RegistryError::NotSubscribed(_)
                | RegistryError::AlreadySubscribed(_)
                | RegistryError::AlreadyMuted(_)
                | RegistryError::NotMuted(_) => codes::BAD_STATE,
                RegistryError::MaxChannelsReached => codes::SERVER_FULL,
                RegistryError::InvalidChannel(_) | RegistryError::NameTaken(_) => codes::INVALID,
            },
            CommandError::Attribute(_) => codes::STORAGE,
            CommandError::Session(e) => match e {
                SessionError::InvalidName(_) => codes::INVALID,
                SessionError::NameInUse(_) => codes::NAME_IN_USE,
                SessionError::Full => codes::SERVER_FULL,
            },
            CommandError::Vetoed(_) | CommandError::Unexpected(_) => codes::INVALID,
            CommandError::NotLoggedIn | CommandError::AlreadyLoggedIn => codes::NOT_LOGGED_IN,
            CommandError::Version { .. } => codes::VERSION_MISMATCH,
        }
    }

    /// Short label for the error metric.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Registry(_) => "registry",
            CommandError::Attribute(_) => "attribute",
            CommandError::Session(_) => "session",
            CommandError::Vetoed(_) => "vetoed",
            CommandError::NotLoggedIn | CommandError::AlreadyLoggedIn => "login",
            CommandError::Unexpected(_) => "unexpected_frame",
            CommandError::Version { .. } => "version",
        }
    }

    /// Error frame answering request `id`.
    #[must_use]
    pub fn to_frame(&self, id: u64) -> Frame {
        Frame::error(id, self.code(), self.to_string())
    }
}

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    pub registry: ChannelRegistry,
    pub watch: WatchEngine,
    pub attributes: Arc<MemoryAttributes>,
    pub history: Arc<HistoryHook>,
    pub sessions: SessionDirectory,
    auto_join: Vec<String>,
}

impl AppState {
    /// Build the registry, hooks and watch engine from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured channel cannot be created.
    pub fn new(config: Config) -> Result<Self> {
        let history = Arc::new(HistoryHook::with_capacity(config.limits.history_length));
        let router = BroadcastRouter::new()
            .with_hook(Arc::new(MaxLengthHook::new(config.limits.max_message_length)))
            .with_hook(history.clone());
        let registry = ChannelRegistry::with_config(router, config.registry_config());

        let mut auto_join = Vec::new();
        for channel in &config.channels {
            registry
                .create(channel.to_channel())
                .with_context(|| format!("Failed to create channel {}", channel.key))?;
            if channel.auto_join {
                auto_join.push(channel.key.clone());
            }
        }

        let attributes = Arc::new(MemoryAttributes::new());
        let watch = WatchEngine::new(attributes.clone());
        watch.start();

        Ok(Self {
            sessions: SessionDirectory::new(config.limits.max_sessions),
            config,
            registry,
            watch,
            attributes,
            history,
            auto_join,
        })
    }

    /// Claim `name`, join the auto-join channels and tell watchers.
    ///
    /// Returns the session and the channels it joined.
    ///
    /// # Errors
    ///
    /// Returns an error if the name cannot be claimed.
    pub fn login(
        &self,
        name: &str,
        outbox: mpsc::UnboundedSender<Frame>,
    ) -> Result<(Arc<Session>, Vec<String>), CommandError> {
        let session = self.sessions.claim(name, outbox)?;
        let handle: ReceiverRef = session.clone();

        let mut joined = Vec::new();
        for key in &self.auto_join {
            match self.registry.connect(&handle, key) {
                Ok(()) => joined.push(key.clone()),
                Err(e) => debug!(session = %name, channel = %key, error = %e, "Auto-join skipped"),
            }
        }

        let notified = self
            .watch
            .notify_directory(&*session, Transition::Connect, &self.sessions);
        metrics::record_watch_notices(notified);

        info!(session = %name, channels = ?joined, notified, "Player logged in");
        Ok((session, joined))
    }

    /// Tell watchers, then drop the session from every channel.
    pub fn logout(&self, session: &Session) {
        session.close();
        self.sessions.release(session.id());

        let notified = self
            .watch
            .notify_directory(session, Transition::Disconnect, &self.sessions);
        metrics::record_watch_notices(notified);

        let left = self.registry.disconnect_all(session.id());
        info!(session = %session.id(), channels = left.len(), notified, "Player logged out");
    }

    /// Run one client frame. Returns the reply, if any.
    ///
    /// Frames with a request ID always get an `Ack` or `Error`; a failing
    /// frame without one is answered with error ID 0.
    pub fn handle_frame(&self, session: &Arc<Session>, frame: Frame) -> Option<Frame> {
        let id = frame.request_id();
        let frame_type = frame.frame_type();

        match self.execute(session, frame) {
            Ok(Some(reply)) => Some(reply),
            Ok(None) => id.map(Frame::ack),
            Err(e) => {
                debug!(
                    session = %session.id(),
                    frame_type = ?frame_type,
                    error = %e,
                    "Command failed"
                );
                metrics::record_error(e.kind());
                Some(e.to_frame(id.unwrap_or(0)))
            }
        }
    }

    fn execute(&self, session: &Arc<Session>, frame: Frame) -> Result<Option<Frame>, CommandError> {
        let me = session.id();

        match frame {
            Frame::Join { channel, .. } => {
                let handle: ReceiverRef = session.clone();
                self.registry.connect(&handle, &channel)?;
            }
            Frame::Leave { channel, .. } => self.registry.disconnect(me, &channel)?,
            Frame::Mute { channel, .. } => self.registry.mute(me, &channel)?,
            Frame::Unmute { channel, .. } => self.registry.unmute(me, &channel)?,

            Frame::Say { channel, text, .. } => {
                let report = self
                    .registry
                    .send(&channel, &**session, text, SendContext::new())?;
                let label = self.registry.resolve(&channel).unwrap_or(channel);
                metrics::record_route(&label, &report);
                if report.vetoed {
                    return Err(CommandError::Vetoed(label));
                }
            }

            Frame::History { id, channel, limit } => {
                let channel = self.registry.get(&channel)?;
                if !channel.is_subscribed(me) {
                    return Err(RegistryError::NotSubscribed(channel.key().to_string()).into());
                }
                let limit = limit.map_or(self.config.limits.history_length, |l| l as usize);
                let lines = self
                    .history
                    .recent(channel.key(), limit)
                    .iter()
                    .map(|message| message.render(&channel))
                    .collect();
                return Ok(Some(Frame::HistoryLines {
                    id,
                    channel: channel.key().to_string(),
                    lines,
                }));
            }

            Frame::Watch { name, .. } => {
                self.attributes.watch(me, &self.sessions.resolve(&name))?;
            }
            Frame::Unwatch { name, .. } => {
                self.attributes.unwatch(me, &self.sessions.resolve(&name))?;
            }
            Frame::WatchAll { enabled, .. } => self.attributes.set_watch_all(me, enabled)?,
            Frame::WatchActive { enabled, .. } => self.attributes.set_watch_active(me, enabled)?,
            Frame::Hide { hidden, .. } => self.attributes.set_hidden(me, hidden)?,
            Frame::Permit { name, .. } => {
                self.attributes.permit(me, &self.sessions.resolve(&name))?;
            }
            Frame::Unpermit { name, .. } => {
                self.attributes.unpermit(me, &self.sessions.resolve(&name))?;
            }

            Frame::Ping { timestamp } => return Ok(Some(Frame::pong(timestamp))),
            Frame::Login { .. } => return Err(CommandError::AlreadyLoggedIn),
            other => return Err(CommandError::Unexpected(other.frame_type())),
        }

        Ok(None)
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);
    metrics::set_active_channels(state.registry.stats().channel_count);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("mudcast listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "sessions": state.sessions.len(),
        "channels": stats.channel_count,
        "watching": state.watch.is_active(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Read the next frame, buffering partial WebSocket messages.
///
/// Returns `None` when the socket closes.
async fn read_frame(
    receiver: &mut SplitStream<WebSocket>,
    buf: &mut BytesMut,
) -> Option<Result<Frame, ProtocolError>> {
    loop {
        match codec::decode_from(buf) {
            Ok(Some(frame)) => return Some(Ok(frame)),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }

        match receiver.next().await? {
            Ok(Message::Binary(data)) => {
                metrics::record_frame(data.len(), "inbound");
                buf.extend_from_slice(&data);
            }
            Ok(Message::Text(text)) => {
                // Treat text as binary
                buf.extend_from_slice(text.as_bytes());
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                debug!(error = %e, "WebSocket error");
                metrics::record_error("websocket");
                return None;
            }
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Wait for a compatible `Login` and claim the name.
async fn accept_login(
    state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    buf: &mut BytesMut,
    outbox: mpsc::UnboundedSender<Frame>,
) -> Option<(Arc<Session>, Vec<String>)> {
    let idle = Duration::from_millis(state.config.heartbeat.timeout_ms);

    let refusal = match tokio::time::timeout(idle, read_frame(receiver, buf)).await {
        Ok(Some(Ok(Frame::Login { name, version }))) => {
            if version.is_compatible_with(&PROTOCOL_VERSION) {
                match state.login(&name, outbox) {
                    Ok(login) => return Some(login),
                    Err(e) => e,
                }
            } else {
                CommandError::Version {
                    client: version,
                    server: PROTOCOL_VERSION,
                }
            }
        }
        Ok(Some(Ok(_))) => CommandError::NotLoggedIn,
        Ok(Some(Err(e))) => {
            warn!(error = %e, "Undecodable login frame");
            metrics::record_error("decode");
            return None;
        }
        Ok(None) => return None,
        Err(_) => {
            debug!("Login timed out");
            return None;
        }
    };

    debug!(error = %refusal, "Login refused");
    metrics::record_error(refusal.kind());
    let _ = send_frame(sender, &refusal.to_frame(0)).await;
    None
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);
    let (tx, mut outbox) = mpsc::unbounded_channel();

    let Some((session, channels)) =
        accept_login(&state, &mut sender, &mut receiver, &mut read_buffer, tx).await
    else {
        return;
    };
    let _metrics_guard = SessionMetricsGuard::new();

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let welcome = Frame::welcome(session.id().as_str(), heartbeat, channels);
    if send_frame(&mut sender, &welcome).await.is_err() {
        error!(session = %session.id(), "Failed to send Welcome frame");
        state.logout(&session);
        return;
    }

    let idle = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut deadline = Instant::now() + idle;

    loop {
        tokio::select! {
            biased;

            Some(frame) = outbox.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            incoming = read_frame(&mut receiver, &mut read_buffer) => {
                match incoming {
                    Some(Ok(frame)) => {
                        deadline = Instant::now() + idle;
                        let start = std::time::Instant::now();
                        if let Some(reply) = state.handle_frame(&session, frame) {
                            if session.push(reply).is_err() {
                                break;
                            }
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Err(e)) => {
                        warn!(session = %session.id(), error = %e, "Bad frame");
                        metrics::record_error("decode");
                        // An oversized length prefix leaves the stream unaligned.
                        if matches!(e, ProtocolError::FrameTooLarge(_)) {
                            break;
                        }
                        let _ = session.push(Frame::error(0, codes::INVALID, e.to_string()));
                    }
                    None => break,
                }
            }

            () = tokio::time::sleep_until(deadline) => {
                debug!(session = %session.id(), "Session idle, closing");
                break;
            }
        }
    }

    state.logout(&session);
}
