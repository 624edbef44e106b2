//! Client library for the VK Coin realtime service.
//!
//! The service exposes two transports: a persistent WebSocket channel with a
//! tiny line-oriented protocol (correlated commands, push events, balance
//! updates) and a plain merchant REST endpoint. This crate covers both, plus
//! the glue a real application needs: identity bootstrap from an access
//! token, automatic reconnection, and a transfer queue that respects the
//! service's rate limits across transports.
//!
//! # Examples
//!
//! ```rust,no_run
//! use coin_link::CoinLinkClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CoinLinkClient::builder()
//!     .token("vk1.a.…")
//!     .connect()
//!     .await?;
//!
//! client.channel().handlers().on_transfer(|transfer| {
//!     println!("received {} from {}", transfer.amount, transfer.from_id);
//! });
//!
//! let receipt = client.transfer(290331922, 1000, false, false).await?;
//! println!("sent, balance is now {}", receipt.current);
//! # Ok(())
//! # }
//! ```
//!
//! For lower-level control, [`ChannelConnection`] drives the WebSocket
//! channel alone and [`MerchantApi`] the REST endpoint alone.

pub mod bootstrap;
pub mod channel_url;
pub mod connection;
pub mod error;
pub mod event_handlers;
pub mod merchant;
pub mod models;
pub mod ops;
pub mod protocol;
pub mod queue;
pub mod timeouts;

mod client;

pub use client::{CoinLinkClient, CoinLinkClientBuilder};
pub use connection::ChannelConnection;
pub use error::{CoinLinkError, Result};
pub use event_handlers::{
    AnswerNotification, ConnectionErrorInfo, DisconnectReason, EventHandlers, HandlerId,
    TransferNotification,
};
pub use merchant::{format_coins, payment_link, MerchantApi};
pub use models::{
    ConnectionOptions, GroupInfo, InitPayload, SendReceipt, TopSnapshot, TransferRecord,
};
pub use queue::TransferQueue;
pub use timeouts::CoinLinkTimeouts;
