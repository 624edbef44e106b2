//! Wire protocol for the realtime channel.
//!
//! The channel speaks a line-oriented text protocol. Outbound commands are
//! framed as `P<correlation id> <command text>`. Inbound frames fall into
//! four categories: a one-time JSON init payload, two fixed connection
//! signals, correlated answers (`C<id> <body>` / `R<id> <body>`), and
//! space-separated event lines. Opcodes are a closed vocabulary owned by the
//! service and must match byte-for-byte.

use crate::channel_url::is_json_payload;
use crate::models::InitPayload;

/// Opcode vocabulary of the channel protocol.
pub mod opcodes {
    /// Successful answer to a pushed command.
    pub const COMPLETE: &str = "C";
    /// Failed answer to a pushed command.
    pub const ERROR: &str = "R";
    /// Incoming transfer notification.
    pub const INCOMING_TRANSFER: &str = "TR";
    /// Balance update following a transfer.
    pub const UPDATE_BALANCE: &str = "TZ";
    /// `type` tag of the JSON init payload.
    pub const INIT: &str = "INIT";
    /// Request a merchant key.
    pub const NEW_MERCHANT: &str = "NM";
    /// Outbound transfer command.
    pub const TRANSACTION: &str = "T";
    /// Prefix for every framed outbound command.
    pub const PUSH: &str = "P";
    /// Another client took over this channel slot.
    pub const ALREADY_CONNECTED: &str = "ALREADY_CONNECTED";
    /// The entry URL is no longer valid.
    pub const BROKEN: &str = "BROKEN";
    /// Leaderboard query.
    pub const TOP: &str = "P";
    /// Group info query.
    pub const LOAD_GROUP: &str = "G";
    /// Transaction lookup by id.
    pub const GET_TRANSACTIONS: &str = "TX";
    /// User balance query.
    pub const GET_SCORE: &str = "GS";
    /// Own ranking position query.
    pub const GET_MY_PLACE: &str = "X";
    /// History sync.
    pub const SYNC_TX_LIST: &str = "SY";
}

/// A correlated answer frame, success or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerKind {
    Complete,
    Error,
}

/// Unsolicited event lines the client understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// `TR <amount> <from_id> <tx_id>` — someone sent coins to this user.
    Transfer {
        amount: i64,
        from_id: i64,
        tx_id: i64,
    },
    /// `TZ <amount> <from_id> <tx_id> <balance>` — authoritative balance
    /// after a transfer settled.
    BalanceUpdate {
        amount: i64,
        from_id: i64,
        tx_id: i64,
        balance: i64,
    },
}

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    /// The one-time JSON initialization payload.
    Init(Box<InitPayload>),
    /// Answer to the command with the given correlation id.
    Answer {
        id: u64,
        kind: AnswerKind,
        body: String,
    },
    /// Connection-level signal: another client claimed this slot.
    AlreadyConnected,
    /// Connection-level signal: the entry URL is invalid.
    Broken,
    /// A recognized unsolicited event.
    Event(ChannelEvent),
    /// Anything the closed vocabulary does not cover. Ignored, never fatal.
    Unknown(String),
}

/// Frame an outbound command with its correlation id.
pub fn encode_push(id: u64, command: &str) -> String {
    format!("{}{} {}", opcodes::PUSH, id, command)
}

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> ServerFrame {
    if is_json_payload(text) {
        return decode_json_frame(text);
    }

    if text == opcodes::ALREADY_CONNECTED {
        return ServerFrame::AlreadyConnected;
    }
    if text == opcodes::BROKEN {
        return ServerFrame::Broken;
    }

    if let Some(frame) = decode_answer(text) {
        return frame;
    }

    if let Some(event) = decode_event(text) {
        return ServerFrame::Event(event);
    }

    ServerFrame::Unknown(text.to_string())
}

fn decode_json_frame(text: &str) -> ServerFrame {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return ServerFrame::Unknown(text.to_string()),
    };

    if value.get("type").and_then(|t| t.as_str()) == Some(opcodes::INIT) {
        match serde_json::from_value::<InitPayload>(value) {
            Ok(payload) => return ServerFrame::Init(Box::new(payload)),
            Err(e) => {
                log::warn!("[coin-link] Malformed init payload: {}", e);
                return ServerFrame::Unknown(text.to_string());
            }
        }
    }

    ServerFrame::Unknown(text.to_string())
}

/// Parse `C<id> <body>` / `R<id> <body>` answer frames.
fn decode_answer(text: &str) -> Option<ServerFrame> {
    let kind = if text.starts_with(opcodes::COMPLETE) {
        AnswerKind::Complete
    } else if text.starts_with(opcodes::ERROR) {
        AnswerKind::Error
    } else {
        return None;
    };

    let rest = &text[1..];
    let (id_part, body) = match rest.split_once(' ') {
        Some((id, body)) => (id, body),
        None => (rest, ""),
    };
    let id = id_part.parse::<u64>().ok()?;

    Some(ServerFrame::Answer {
        id,
        kind,
        body: body.to_string(),
    })
}

/// Parse space-separated unsolicited event lines by leading opcode.
fn decode_event(text: &str) -> Option<ChannelEvent> {
    let mut parts = text.split_whitespace();
    let opcode = parts.next()?;

    match opcode {
        opcodes::INCOMING_TRANSFER => {
            let amount = parts.next()?.parse().ok()?;
            let from_id = parts.next()?.parse().ok()?;
            let tx_id = parts.next()?.parse().ok()?;
            Some(ChannelEvent::Transfer {
                amount,
                from_id,
                tx_id,
            })
        }
        opcodes::UPDATE_BALANCE => {
            let amount = parts.next()?.parse().ok()?;
            let from_id = parts.next()?.parse().ok()?;
            let tx_id = parts.next()?.parse().ok()?;
            let balance = parts.next()?.parse().ok()?;
            Some(ChannelEvent::BalanceUpdate {
                amount,
                from_id,
                tx_id,
                balance,
            })
        }
        _ => None,
    }
}
