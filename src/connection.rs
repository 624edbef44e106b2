//! Persistent channel connection to the realtime service.
//!
//! A [`ChannelConnection`] owns exactly one WebSocket at a time. The socket
//! itself lives in a background task; the public handle talks to it over a
//! command channel. The task:
//!
//! 1. Connects to the sharded channel URL
//! 2. Multiplexes correlated commands and unsolicited event frames
//! 3. Sends keepalive pings and answers server pings
//! 4. Auto-reconnects after unexpected closes, per [`ConnectionOptions`]
//!
//! Correlation ids come from a single incrementing counter that is never
//! reset while the task lives, so an id is never reused within a
//! connection's lifetime. Pending commands are not actively failed when the
//! transport drops; the command deadline is the only reaper (expired entries
//! are swept on keepalive ticks so the registry stays bounded).

use crate::channel_url::format_channel_url;
use crate::error::{CoinLinkError, Result};
use crate::event_handlers::{
    AnswerNotification, ConnectionErrorInfo, DisconnectReason, EventHandlers,
    TransferNotification,
};
use crate::models::{ConnectionOptions, InitPayload};
use crate::protocol::{decode_frame, encode_push, AnswerKind, ChannelEvent, ServerFrame};
use crate::timeouts::CoinLinkTimeouts;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sleep target used when a timer is disabled.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Commands sent from the public handle to the background connection task.
enum ConnCmd {
    /// Push one correlated command over the socket.
    Command {
        text: String,
        result_tx: oneshot::Sender<Result<String>>,
    },
    /// Close the socket and stop the task.
    Shutdown,
}

struct ConnState {
    url: Option<String>,
    cmd_tx: Option<mpsc::UnboundedSender<ConnCmd>>,
    ready_rx: Option<oneshot::Receiver<Result<InitPayload>>>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<ConnState>,
    balance: Arc<Mutex<Option<i64>>>,
    connected: Arc<AtomicBool>,
    handlers: EventHandlers,
    options: ConnectionOptions,
    timeouts: CoinLinkTimeouts,
}

/// Handle to the persistent realtime channel.
///
/// Cloning yields another handle to the same connection.
///
/// # Example
///
/// ```rust,no_run
/// use coin_link::{ChannelConnection, ConnectionOptions, CoinLinkTimeouts, EventHandlers};
///
/// # async fn example() -> coin_link::Result<()> {
/// let channel = ChannelConnection::new(
///     ConnectionOptions::default(),
///     CoinLinkTimeouts::default(),
///     EventHandlers::new(),
/// );
/// let init = channel
///     .start(Some("https://coin.example/index.html?vk_user_id=1"))
///     .await?;
/// println!("balance: {}", init.score);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<Inner>,
}

impl ChannelConnection {
    /// Create an unconnected channel handle.
    pub fn new(
        options: ConnectionOptions,
        timeouts: CoinLinkTimeouts,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ConnState {
                    url: None,
                    cmd_tx: None,
                    ready_rx: None,
                    task: None,
                }),
                balance: Arc::new(Mutex::new(None)),
                connected: Arc::new(AtomicBool::new(false)),
                handlers,
                options,
                timeouts,
            }),
        }
    }

    /// Set the target from an HTTP(S) entry URL, converting it to the
    /// sharded channel URL.
    pub fn set_entry_url(&self, entry_url: &str) -> Result<()> {
        let url = format_channel_url(entry_url)?;
        self.set_channel_url(url);
        Ok(())
    }

    /// Set the target channel URL directly (already in `ws(s)://` form).
    pub fn set_channel_url(&self, url: impl Into<String>) {
        self.lock_state().url = Some(url.into());
    }

    /// Open the transport and hand it to the background task.
    ///
    /// Fails if no URL has been set or a connection already exists. Does not
    /// wait for the service's init payload; use [`start`](Self::start) for
    /// the blocking bootstrap.
    pub fn connect(&self) -> Result<()> {
        let mut state = self.lock_state();

        if state.cmd_tx.is_some() {
            return Err(CoinLinkError::LifecycleError(
                "channel is already connected".to_string(),
            ));
        }
        let url = state.url.clone().ok_or_else(|| {
            CoinLinkError::LifecycleError("cannot connect without a channel URL".to_string())
        })?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(channel_task(
            cmd_rx,
            url,
            self.inner.options.clone(),
            self.inner.timeouts.clone(),
            self.inner.handlers.clone(),
            self.inner.balance.clone(),
            self.inner.connected.clone(),
            ready_tx,
        ));

        state.cmd_tx = Some(cmd_tx);
        state.ready_rx = Some(ready_rx);
        state.task = Some(task);
        Ok(())
    }

    /// One blocking bootstrap step: connect (optionally after converting the
    /// given entry URL) and wait for the service's init payload.
    ///
    /// Resolves with the init payload once observed; fails if the service
    /// reports `BROKEN` or the transport fails before initialization. Has no
    /// deadline of its own beyond the transport-level connection timeout.
    pub async fn start(&self, entry_url: Option<&str>) -> Result<InitPayload> {
        if let Some(url) = entry_url {
            self.set_entry_url(url)?;
        }
        self.connect()?;

        let ready_rx = self
            .lock_state()
            .ready_rx
            .take()
            .expect("ready channel present right after connect");

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(CoinLinkError::WebSocketError(
                "connection task exited before initialization".to_string(),
            )),
        }
    }

    /// Disable auto-reconnect, close the transport, and clear the
    /// connection. Fails if no connection exists.
    pub fn disconnect(&self) -> Result<()> {
        let mut state = self.lock_state();
        let cmd_tx = state.cmd_tx.take().ok_or_else(|| {
            CoinLinkError::LifecycleError("channel is already disconnected".to_string())
        })?;
        state.ready_rx = None;
        state.task = None;
        drop(state);

        // The task may already be gone after a fatal error; that is fine.
        let _ = cmd_tx.send(ConnCmd::Shutdown);
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Tear down any existing connection and connect again to the same URL.
    pub fn reconnect(&self) -> Result<()> {
        if self.lock_state().cmd_tx.is_some() {
            self.disconnect()?;
        }
        self.connect()
    }

    /// Send one correlated command and wait for its answer.
    ///
    /// Resolves with the answer body on a matching `C` frame, fails with a
    /// service error on a matching `R` frame, and fails with a protocol
    /// timeout once the command deadline elapses without a matching answer.
    /// Concurrent commands are tracked independently by correlation id.
    pub async fn command(&self, text: impl Into<String>) -> Result<String> {
        let cmd_tx = self.lock_state().cmd_tx.clone().ok_or_else(|| {
            CoinLinkError::LifecycleError("channel is not connected".to_string())
        })?;

        let (result_tx, result_rx) = oneshot::channel();
        cmd_tx
            .send(ConnCmd::Command {
                text: text.into(),
                result_tx,
            })
            .map_err(|_| {
                CoinLinkError::WebSocketError("connection task is not running".to_string())
            })?;

        let deadline = self.inner.timeouts.command_timeout;
        match tokio::time::timeout(deadline, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoinLinkError::WebSocketError(
                "connection task dropped the command".to_string(),
            )),
            Err(_) => Err(CoinLinkError::ProtocolTimeout(deadline)),
        }
    }

    /// Last balance reported by the service on this channel, in coin
    /// thousandths. `None` until the first init payload arrives.
    pub fn balance(&self) -> Option<i64> {
        *self.inner.balance.lock().expect("balance lock poisoned")
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The event subscription surface of this channel.
    pub fn handlers(&self) -> &EventHandlers {
        &self.inner.handlers
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.inner.state.lock().expect("connection state poisoned")
    }
}

// ── Background connection task ──────────────────────────────────────────────

struct PendingCommand {
    result_tx: oneshot::Sender<Result<String>>,
    issued_at: Instant,
}

struct TaskState {
    pending: HashMap<u64, PendingCommand>,
    next_correlation: u64,
    init_seen: bool,
    ready_tx: Option<oneshot::Sender<Result<InitPayload>>>,
    balance: Arc<Mutex<Option<i64>>>,
    handlers: EventHandlers,
}

impl TaskState {
    /// Drop pending entries older than the command deadline. Their callers
    /// have already observed a protocol timeout.
    fn sweep_expired(&mut self, deadline: Duration) {
        self.pending
            .retain(|_, entry| entry.issued_at.elapsed() <= deadline);
    }

    fn handle_frame(&mut self, text: &str) {
        match decode_frame(text) {
            ServerFrame::Init(payload) => {
                if self.init_seen {
                    log::debug!("[coin-link] Duplicate init payload ignored");
                    return;
                }
                self.init_seen = true;
                *self.balance.lock().expect("balance lock poisoned") = Some(payload.score);
                self.handlers.emit_init((*payload).clone());
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Ok(*payload));
                }
            }
            ServerFrame::AlreadyConnected => {
                log::warn!("[coin-link] Another client claimed this channel slot");
                self.handlers.emit_already_connected();
            }
            ServerFrame::Broken => {
                self.handlers.emit_broken();
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Err(CoinLinkError::service("BROKEN")));
                }
            }
            ServerFrame::Answer { id, kind, body } => {
                self.handlers.emit_answer(AnswerNotification {
                    id,
                    kind: kind.clone(),
                    body: body.clone(),
                });
                match self.pending.remove(&id) {
                    Some(entry) => {
                        let outcome = match kind {
                            AnswerKind::Complete => Ok(body),
                            AnswerKind::Error => Err(CoinLinkError::service(body)),
                        };
                        // The caller may have timed out already.
                        let _ = entry.result_tx.send(outcome);
                    }
                    None => {
                        log::debug!("[coin-link] Answer for untracked command {}", id);
                    }
                }
            }
            ServerFrame::Event(ChannelEvent::Transfer {
                amount,
                from_id,
                tx_id,
            }) => {
                self.handlers.emit_transfer(TransferNotification {
                    amount,
                    from_id,
                    tx_id,
                });
            }
            ServerFrame::Event(ChannelEvent::BalanceUpdate { balance, .. }) => {
                *self.balance.lock().expect("balance lock poisoned") = Some(balance);
            }
            ServerFrame::Unknown(frame) => {
                log::debug!("[coin-link] Ignoring unknown frame: {}", frame);
            }
        }
    }
}

/// Establish the WebSocket connection within the configured timeout.
async fn establish_ws(url: &str, timeouts: &CoinLinkTimeouts) -> Result<WsStream> {
    log::debug!("[coin-link] Connecting to {}", url);
    let connect = connect_async(url);
    let (stream, _response) =
        tokio::time::timeout(timeouts.connection_timeout, connect)
            .await
            .map_err(|_| {
                CoinLinkError::WebSocketError(format!(
                    "connection timeout ({:?})",
                    timeouts.connection_timeout
                ))
            })?
            .map_err(|e| CoinLinkError::WebSocketError(format!("connection failed: {}", e)))?;
    Ok(stream)
}

/// The background task owning the socket.
#[allow(clippy::too_many_arguments)]
async fn channel_task(
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    url: String,
    options: ConnectionOptions,
    timeouts: CoinLinkTimeouts,
    handlers: EventHandlers,
    balance: Arc<Mutex<Option<i64>>>,
    connected: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<Result<InitPayload>>,
) {
    let mut state = TaskState {
        pending: HashMap::new(),
        next_correlation: 0,
        init_seen: false,
        ready_tx: Some(ready_tx),
        balance,
        handlers,
    };

    let has_keepalive = !timeouts.keepalive_interval.is_zero();
    let keepalive_dur = if has_keepalive {
        timeouts.keepalive_interval
    } else {
        FAR_FUTURE
    };
    let mut idle_deadline = Instant::now() + keepalive_dur;

    let mut ws_stream: Option<WsStream> = None;
    let mut shutdown = false;
    let mut reconnect_attempts: u32 = 0;

    // Initial connection. Auto-reconnect only arms once the transport has
    // reported open, so a failure here is fatal for the task.
    match establish_ws(&url, &timeouts).await {
        Ok(stream) => {
            ws_stream = Some(stream);
            connected.store(true, Ordering::SeqCst);
            state.handlers.emit_connect();
            idle_deadline = Instant::now() + keepalive_dur;
        }
        Err(e) => {
            log::warn!("[coin-link] Initial connection failed: {}", e);
            state
                .handlers
                .emit_error(ConnectionErrorInfo::new(e.to_string(), false));
            if let Some(tx) = state.ready_tx.take() {
                let _ = tx.send(Err(e));
            }
            return;
        }
    }

    loop {
        if shutdown {
            if let Some(mut ws) = ws_stream.take() {
                let _ = ws.close(None).await;
            }
            let was_connected = connected.swap(false, Ordering::SeqCst);
            if was_connected {
                state
                    .handlers
                    .emit_disconnect(DisconnectReason::new("client disconnected"));
            }
            return;
        }

        if let Some(ws) = ws_stream.as_mut() {
            let idle_sleep = tokio::time::sleep_until(idle_deadline);
            tokio::pin!(idle_sleep);

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConnCmd::Command { text, result_tx }) => {
                            state.next_correlation += 1;
                            let id = state.next_correlation;
                            let frame = encode_push(id, &text);
                            log::debug!("[coin-link] -> {}", frame);
                            match ws.send(Message::Text(frame.into())).await {
                                Ok(()) => {
                                    state.pending.insert(id, PendingCommand {
                                        result_tx,
                                        issued_at: Instant::now(),
                                    });
                                }
                                Err(e) => {
                                    let _ = result_tx.send(Err(CoinLinkError::WebSocketError(
                                        format!("failed to send command: {}", e),
                                    )));
                                    state.handlers.emit_disconnect(
                                        DisconnectReason::new(format!("send failed: {}", e)),
                                    );
                                    connected.store(false, Ordering::SeqCst);
                                    ws_stream = None;
                                    continue;
                                }
                            }
                        }
                        Some(ConnCmd::Shutdown) | None => {
                            shutdown = true;
                            continue;
                        }
                    }
                }

                _ = &mut idle_sleep, if has_keepalive => {
                    state.sweep_expired(timeouts.command_timeout);
                    if let Err(e) = ws.send(Message::Ping(Bytes::new())).await {
                        log::warn!("[coin-link] Keepalive ping failed: {}", e);
                        state.handlers.emit_disconnect(
                            DisconnectReason::new(format!("keepalive ping failed: {}", e)),
                        );
                        connected.store(false, Ordering::SeqCst);
                        ws_stream = None;
                        continue;
                    }
                    idle_deadline = Instant::now() + keepalive_dur;
                }

                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            log::debug!("[coin-link] <- {}", text.as_str());
                            state.handle_frame(text.as_str());
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(close))) => {
                            let reason = match close {
                                Some(f) => DisconnectReason::with_code(
                                    f.reason.to_string(),
                                    f.code.into(),
                                ),
                                None => DisconnectReason::new("server closed connection"),
                            };
                            state.handlers.emit_disconnect(reason);
                            connected.store(false, Ordering::SeqCst);
                            ws_stream = None;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let message = e.to_string();
                            state.handlers.emit_error(
                                ConnectionErrorInfo::new(message.as_str(), true),
                            );
                            state.handlers.emit_disconnect(
                                DisconnectReason::new(format!("websocket error: {}", message)),
                            );
                            if let Some(tx) = state.ready_tx.take() {
                                let _ = tx.send(Err(CoinLinkError::WebSocketError(message)));
                            }
                            connected.store(false, Ordering::SeqCst);
                            ws_stream = None;
                        }
                        None => {
                            state.handlers.emit_disconnect(
                                DisconnectReason::new("websocket stream ended"),
                            );
                            if let Some(tx) = state.ready_tx.take() {
                                let _ = tx.send(Err(CoinLinkError::WebSocketError(
                                    "connection closed before initialization".to_string(),
                                )));
                            }
                            connected.store(false, Ordering::SeqCst);
                            ws_stream = None;
                        }
                    }
                }
            }
        } else {
            // ── Transport down: reconnect or wind down ──────────────────

            if !options.auto_reconnect {
                match cmd_rx.recv().await {
                    Some(ConnCmd::Command { result_tx, .. }) => {
                        let _ = result_tx.send(Err(CoinLinkError::LifecycleError(
                            "channel is not connected".to_string(),
                        )));
                        continue;
                    }
                    Some(ConnCmd::Shutdown) | None => return,
                }
            }

            if let Some(max) = options.max_reconnect_attempts {
                if reconnect_attempts >= max {
                    log::warn!(
                        "[coin-link] Giving up after {} reconnection attempts",
                        max
                    );
                    state.handlers.emit_error(ConnectionErrorInfo::new(
                        format!("max reconnection attempts ({}) reached", max),
                        false,
                    ));
                    return;
                }
            }

            let delay = options.reconnect_delay(reconnect_attempts);
            reconnect_attempts += 1;
            log::info!(
                "[coin-link] Reconnecting in {:?} (attempt {})",
                delay,
                reconnect_attempts
            );

            if !delay.is_zero() {
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(ConnCmd::Command { result_tx, .. }) => {
                                    let _ = result_tx.send(Err(CoinLinkError::LifecycleError(
                                        "channel is not connected".to_string(),
                                    )));
                                }
                                Some(ConnCmd::Shutdown) | None => {
                                    shutdown = true;
                                    break;
                                }
                            }
                        }
                        _ = &mut sleep => break,
                    }
                }
                if shutdown {
                    continue;
                }
            }

            match establish_ws(&url, &timeouts).await {
                Ok(stream) => {
                    log::info!("[coin-link] Reconnected");
                    reconnect_attempts = 0;
                    state.init_seen = false;
                    ws_stream = Some(stream);
                    connected.store(true, Ordering::SeqCst);
                    state.handlers.emit_connect();
                    idle_deadline = Instant::now() + keepalive_dur;
                }
                Err(e) => {
                    log::warn!(
                        "[coin-link] Reconnection attempt {} failed: {}",
                        reconnect_attempts,
                        e
                    );
                }
            }
        }
    }
}
