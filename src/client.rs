//! High-level client facade.
//!
//! [`CoinLinkClient`] wires the whole stack together: it resolves the
//! account identity from an access token, opens the realtime channel,
//! obtains the merchant key over it, and sets up the rate-limited transfer
//! queue with one worker per transport. Most applications only ever need
//! this type; the parts remain reachable through [`CoinLinkClient::channel`]
//! and [`CoinLinkClient::merchant`] for finer control.

use crate::bootstrap;
use crate::channel_url::user_id_from_entry_url;
use crate::connection::ChannelConnection;
use crate::error::{CoinLinkError, Result};
use crate::event_handlers::EventHandlers;
use crate::merchant::MerchantApi;
use crate::models::{ConnectionOptions, InitPayload, SendReceipt};
use crate::queue::TransferQueue;
use crate::timeouts::CoinLinkTimeouts;
use std::sync::Arc;
use std::time::Duration;

/// Cooldown the service enforces between transfers on one realtime channel.
const WS_TRANSFER_COOLDOWN: Duration = Duration::from_millis(3000);

/// Builder for [`CoinLinkClient`]. Exactly one identity source is required:
/// an access token (everything else is resolved automatically), an explicit
/// entry URL, or an already-formatted channel URL plus a user id.
pub struct CoinLinkClientBuilder {
    token: Option<String>,
    entry_url: Option<String>,
    channel_url: Option<String>,
    user_id: Option<i64>,
    merchant_key: Option<String>,
    timeouts: CoinLinkTimeouts,
    options: ConnectionOptions,
    handlers: EventHandlers,
}

impl CoinLinkClientBuilder {
    fn new() -> Self {
        Self {
            token: None,
            entry_url: None,
            channel_url: None,
            user_id: None,
            merchant_key: None,
            timeouts: CoinLinkTimeouts::default(),
            options: ConnectionOptions::default(),
            handlers: EventHandlers::new(),
        }
    }

    /// VK access token to bootstrap the identity and entry URL from.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Skip the identity bootstrap and connect through this app entry URL.
    /// The user id is taken from its query string.
    pub fn entry_url(mut self, url: impl Into<String>) -> Self {
        self.entry_url = Some(url.into());
        self
    }

    /// Connect to an already-formatted `ws(s)://` channel URL. Requires
    /// [`user_id`](Self::user_id), since no entry URL is available to read
    /// it from.
    pub fn channel_url(mut self, url: impl Into<String>) -> Self {
        self.channel_url = Some(url.into());
        self
    }

    /// User id to pair with [`channel_url`](Self::channel_url).
    pub fn user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Use a known merchant key instead of requesting one over the channel.
    pub fn merchant_key(mut self, key: impl Into<String>) -> Self {
        self.merchant_key = Some(key.into());
        self
    }

    /// Override the default timeouts.
    pub fn timeouts(mut self, timeouts: CoinLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the default reconnect behavior.
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a pre-populated handler registry. Handlers registered here see
    /// the initial connect and init events, which handlers registered after
    /// [`connect`](Self::connect) would miss.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Resolve the identity, open the channel, and assemble the client.
    pub async fn connect(self) -> Result<CoinLinkClient> {
        let http = reqwest::Client::builder()
            .timeout(self.timeouts.http_timeout)
            .build()?;

        let channel = ChannelConnection::new(self.options, self.timeouts.clone(), self.handlers);

        let (user_id, init) = if let Some(url) = self.channel_url {
            let user_id = self.user_id.ok_or_else(|| {
                CoinLinkError::ConfigurationError(
                    "a user id is required alongside a channel URL".to_string(),
                )
            })?;
            channel.set_channel_url(url);
            (user_id, channel.start(None).await?)
        } else {
            let entry_url = match (self.entry_url, self.token.as_deref()) {
                (Some(url), _) => url,
                (None, Some(token)) => {
                    let (user_id, url) = bootstrap::resolve_identity(&http, token).await?;
                    log::info!("[CLIENT] Identity resolved: user_id={}", user_id);
                    url
                }
                (None, None) => {
                    return Err(CoinLinkError::ConfigurationError(
                        "an access token, entry URL, or channel URL is required".to_string(),
                    ));
                }
            };
            let user_id = user_id_from_entry_url(&entry_url)?;
            (user_id, channel.start(Some(&entry_url)).await?)
        };
        log::info!(
            "[CLIENT] Channel open: user_id={} balance={}",
            user_id,
            init.score
        );

        let merchant_key = match self.merchant_key {
            Some(key) => key,
            None => channel.get_merchant_key().await?,
        };
        let merchant = MerchantApi::new(user_id, merchant_key, &self.timeouts)?;

        // One worker per transport. The channel worker carries the service's
        // per-channel cooldown; the REST worker has none, so it soaks up the
        // overflow while the channel worker cools down.
        let queue = TransferQueue::new();
        {
            let channel = channel.clone();
            queue.add_worker(
                Arc::new(move |to_id, amount, from_shop| {
                    let channel = channel.clone();
                    Box::pin(async move {
                        channel.transfer(to_id, amount, from_shop, None, None).await
                    })
                }),
                Some(WS_TRANSFER_COOLDOWN),
            );
        }
        {
            let merchant = merchant.clone();
            queue.add_worker(
                Arc::new(move |to_id, amount, from_shop| {
                    let merchant = merchant.clone();
                    Box::pin(async move { merchant.send_coins(to_id, amount, from_shop).await })
                }),
                None,
            );
        }

        Ok(CoinLinkClient {
            user_id,
            init,
            channel,
            merchant,
            queue,
        })
    }
}

/// A fully assembled client: realtime channel, merchant REST client, and
/// the transfer queue feeding both.
pub struct CoinLinkClient {
    user_id: i64,
    init: InitPayload,
    channel: ChannelConnection,
    merchant: MerchantApi,
    queue: TransferQueue,
}

impl std::fmt::Debug for CoinLinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinLinkClient")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl CoinLinkClient {
    /// Start building a client.
    pub fn builder() -> CoinLinkClientBuilder {
        CoinLinkClientBuilder::new()
    }

    /// Transfer `amount` thousandths to `to_id` through the queue.
    ///
    /// Unlike calling the channel or the merchant API directly, queued
    /// transfers never collide with each other, so the service's
    /// one-transfer-at-a-time rule cannot be tripped. With `bypass` the
    /// task jumps ahead of everything still queued.
    pub async fn transfer(
        &self,
        to_id: i64,
        amount: i64,
        from_shop: bool,
        bypass: bool,
    ) -> Result<SendReceipt> {
        self.queue.add_task(to_id, amount, from_shop, bypass).await
    }

    /// The authenticated user's id.
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// The init payload received when the channel opened.
    pub fn init(&self) -> &InitPayload {
        &self.init
    }

    /// Latest balance observed on the channel, in coin thousandths.
    pub fn balance(&self) -> Option<i64> {
        self.channel.balance()
    }

    /// The realtime channel, for commands and event handler registration.
    pub fn channel(&self) -> &ChannelConnection {
        &self.channel
    }

    /// The merchant REST client.
    pub fn merchant(&self) -> &MerchantApi {
        &self.merchant
    }

    /// The transfer queue, for registering extra workers.
    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    /// Close the realtime channel. Queued transfers already dispatched to
    /// the channel worker fail; the REST worker keeps functioning.
    pub fn disconnect(&self) -> Result<()> {
        self.channel.disconnect()
    }
}
