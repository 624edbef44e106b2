//! Typed event subscription surface for the realtime channel.
//!
//! Each event category holds an ordered list of listeners; dispatch invokes
//! them synchronously in registration order. Listeners are registered with
//! the `on_*` methods, which return a [`HandlerId`] that can later be passed
//! to [`EventHandlers::remove`].
//!
//! # Example
//!
//! ```rust
//! use coin_link::EventHandlers;
//!
//! let handlers = EventHandlers::new();
//! let id = handlers.on_connect(|| println!("channel open"));
//! handlers.on_transfer(|tx| {
//!     println!("received {} from {} (tx {})", tx.amount, tx.from_id, tx.tx_id);
//! });
//! handlers.remove(id);
//! ```

use crate::models::InitPayload;
use crate::protocol::AnswerKind;
use std::fmt;
use std::sync::{Arc, Mutex};

/// An incoming transfer notification.
///
/// Carries only what the event line itself provides; full detail for the
/// transaction can be fetched afterwards with
/// [`get_transactions_by_id`](crate::ChannelConnection::get_transactions_by_id)
/// using `tx_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferNotification {
    /// Amount received, in coin thousandths.
    pub amount: i64,
    /// Sender id.
    pub from_id: i64,
    /// Transaction id, usable for a follow-up detail lookup.
    pub tx_id: i64,
}

/// A correlated answer observed on the channel, surfaced to listeners in
/// addition to settling the pending command it belongs to.
#[derive(Debug, Clone)]
pub struct AnswerNotification {
    pub id: u64,
    pub kind: AnswerKind,
    pub body: String,
}

/// Why the channel closed.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    pub message: String,
    /// WebSocket close code, if the peer sent one.
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Error information passed to `on_error` listeners.
#[derive(Debug, Clone)]
pub struct ConnectionErrorInfo {
    pub message: String,
    /// Whether auto-reconnect may recover from this error.
    pub recoverable: bool,
}

impl ConnectionErrorInfo {
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Opaque handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Callback0 = Arc<dyn Fn() + Send + Sync>;
type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    connect: Vec<(u64, Callback0)>,
    init: Vec<(u64, Callback<InitPayload>)>,
    answer: Vec<(u64, Callback<AnswerNotification>)>,
    transfer: Vec<(u64, Callback<TransferNotification>)>,
    already_connected: Vec<(u64, Callback0)>,
    broken: Vec<(u64, Callback0)>,
    disconnect: Vec<(u64, Callback<DisconnectReason>)>,
    error: Vec<(u64, Callback<ConnectionErrorInfo>)>,
}

impl Registry {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Listener registry shared between the client handle and the background
/// connection task. Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventHandlers {
    inner: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.lock().expect("event registry poisoned");
        f.debug_struct("EventHandlers")
            .field("connect", &registry.connect.len())
            .field("init", &registry.init.len())
            .field("answer", &registry.answer.len())
            .field("transfer", &registry.transfer.len())
            .field("already_connected", &registry.already_connected.len())
            .field("broken", &registry.broken.len())
            .field("disconnect", &registry.disconnect.len())
            .field("error", &registry.error.len())
            .finish()
    }
}

macro_rules! register {
    ($self:ident, $category:ident, $cb:expr) => {{
        let mut registry = $self.inner.lock().expect("event registry poisoned");
        let id = registry.next();
        registry.$category.push((id, Arc::new($cb)));
        HandlerId(id)
    }};
}

macro_rules! emit {
    ($self:ident, $category:ident) => {{
        let callbacks: Vec<Callback0> = {
            let registry = $self.inner.lock().expect("event registry poisoned");
            registry.$category.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb();
        }
    }};
    ($self:ident, $category:ident, $value:expr) => {{
        let callbacks: Vec<_> = {
            let registry = $self.inner.lock().expect("event registry poisoned");
            registry.$category.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb($value.clone());
        }
    }};
}

impl EventHandlers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener for the transport reporting open (fires on every successful
    /// connect, including reconnects).
    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) -> HandlerId {
        register!(self, connect, f)
    }

    /// Listener for the one-time init payload of each connection.
    pub fn on_init(&self, f: impl Fn(InitPayload) + Send + Sync + 'static) -> HandlerId {
        register!(self, init, f)
    }

    /// Listener for every correlated answer observed on the channel.
    pub fn on_answer(&self, f: impl Fn(AnswerNotification) + Send + Sync + 'static) -> HandlerId {
        register!(self, answer, f)
    }

    /// Listener for incoming transfer notifications.
    pub fn on_transfer(
        &self,
        f: impl Fn(TransferNotification) + Send + Sync + 'static,
    ) -> HandlerId {
        register!(self, transfer, f)
    }

    /// Listener for the `ALREADY_CONNECTED` connection signal.
    pub fn on_already_connected(&self, f: impl Fn() + Send + Sync + 'static) -> HandlerId {
        register!(self, already_connected, f)
    }

    /// Listener for the `BROKEN` connection signal.
    pub fn on_broken(&self, f: impl Fn() + Send + Sync + 'static) -> HandlerId {
        register!(self, broken, f)
    }

    /// Listener for the channel closing, intentionally or not.
    pub fn on_disconnect(
        &self,
        f: impl Fn(DisconnectReason) + Send + Sync + 'static,
    ) -> HandlerId {
        register!(self, disconnect, f)
    }

    /// Listener for transport or protocol errors.
    pub fn on_error(
        &self,
        f: impl Fn(ConnectionErrorInfo) + Send + Sync + 'static,
    ) -> HandlerId {
        register!(self, error, f)
    }

    /// Remove one registered listener. Returns `false` if the id is unknown.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut registry = self.inner.lock().expect("event registry poisoned");
        let HandlerId(raw) = id;
        macro_rules! drop_from {
            ($field:ident) => {{
                let before = registry.$field.len();
                registry.$field.retain(|(entry_id, _)| *entry_id != raw);
                registry.$field.len() != before
            }};
        }
        drop_from!(connect)
            || drop_from!(init)
            || drop_from!(answer)
            || drop_from!(transfer)
            || drop_from!(already_connected)
            || drop_from!(broken)
            || drop_from!(disconnect)
            || drop_from!(error)
    }

    pub(crate) fn emit_connect(&self) {
        emit!(self, connect)
    }

    pub(crate) fn emit_init(&self, payload: InitPayload) {
        emit!(self, init, payload)
    }

    pub(crate) fn emit_answer(&self, answer: AnswerNotification) {
        emit!(self, answer, answer)
    }

    pub(crate) fn emit_transfer(&self, transfer: TransferNotification) {
        emit!(self, transfer, transfer)
    }

    pub(crate) fn emit_already_connected(&self) {
        emit!(self, already_connected)
    }

    pub(crate) fn emit_broken(&self) {
        emit!(self, broken)
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        emit!(self, disconnect, reason)
    }

    pub(crate) fn emit_error(&self, error: ConnectionErrorInfo) {
        emit!(self, error, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let handlers = EventHandlers::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = order.clone();
            handlers.on_connect(move || order.lock().unwrap().push(tag));
        }

        handlers.emit_connect();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_unsubscribes_single_listener() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let kept = count.clone();
        handlers.on_broken(move || {
            kept.fetch_add(1, Ordering::SeqCst);
        });
        let removed_count = count.clone();
        let id = handlers.on_broken(move || {
            removed_count.fetch_add(10, Ordering::SeqCst);
        });

        assert!(handlers.remove(id));
        assert!(!handlers.remove(id));

        handlers.emit_broken();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transfer_payload_reaches_listener() {
        let handlers = EventHandlers::new();
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        handlers.on_transfer(move |tx| {
            *sink.lock().unwrap() = Some(tx);
        });

        handlers.emit_transfer(TransferNotification {
            amount: 5,
            from_id: 290331922,
            tx_id: 570760228,
        });

        let tx = seen.lock().unwrap().expect("listener not invoked");
        assert_eq!(tx.amount, 5);
        assert_eq!(tx.from_id, 290331922);
        assert_eq!(tx.tx_id, 570760228);
    }
}
