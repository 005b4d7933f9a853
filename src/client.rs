//! Root client: lifecycle state machine and the single event surface.
//!
//! A [`Client`] owns one REST dispatcher, one gateway connection, one cache,
//! and the packet dispatcher task wiring them together. Hosts drive it with
//! `login` / `logout` and consume everything through [`Client::recv`].

use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::cache::Cache;
use crate::dispatch::{PacketDispatcher, VoiceEndpoint};
use crate::events::Event;
use crate::gateway::socket::{Gateway, GatewayConfig, GatewayError, GatewaySender};
use crate::model::{Message, Snowflake};
use crate::rest::dispatcher::{
    Method, RequestDispatcher, RequestDispatcherOptions, RequestOptions, RestError,
    DEFAULT_API_VERSION, DEFAULT_BASE_URL,
};
use crate::retry::with_timeout;

const VOICE_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client lifecycle state.
///
/// Transitions run strictly forward, except that a resumed session jumps
/// straight back to `Ready` without a full state replay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    LoggingIn,
    LoggedIn,
    Ready,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("operation is invalid in state {state:?}")]
    InvalidState { state: ConnectionState },

    #[error(transparent)]
    Rest(#[from] RestError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("timed out waiting for the voice endpoint")]
    VoiceEndpointTimeout,
}

/// Connection parameters for a [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    token: SecretString,
    bot: bool,
    shard: [u16; 2],
    api_version: u8,
    base_url: String,
    gateway_url: Option<String>,
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
            bot: false,
            shard: [0, 1],
            api_version: DEFAULT_API_VERSION,
            base_url: DEFAULT_BASE_URL.to_string(),
            gateway_url: None,
        }
    }

    /// Marks the token as a bot token; changes the Authorization scheme and
    /// skips per-guild sync requests on login.
    pub fn bot(mut self, bot: bool) -> Self {
        self.bot = bot;
        self
    }

    pub fn with_shard(mut self, id: u16, count: u16) -> Self {
        self.shard = [id, count.max(1)];
        self
    }

    pub fn with_api_version(mut self, version: u8) -> Self {
        self.api_version = version;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Skips gateway discovery and connects straight to this URL.
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }
}

pub struct Client {
    config: ClientConfig,
    rest: RequestDispatcher,
    cache: Cache,
    state: ConnectionState,
    gateway: Option<GatewaySender>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    voice: Option<watch::Receiver<Option<VoiceEndpoint>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let rest = RequestDispatcher::with_options(
            Some(config.token.clone()),
            config.bot,
            RequestDispatcherOptions {
                base_url: config.base_url.clone(),
                api_version: config.api_version,
                shard: config.shard[0],
                ..RequestDispatcherOptions::default()
            },
        )?;
        Ok(Self {
            config,
            rest,
            cache: Cache::new(),
            state: ConnectionState::Idle,
            gateway: None,
            events: None,
            voice: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Rate-limited HTTP channel. Together with [`Client::cache`] this is the
    /// whole contract exposed to higher layers.
    pub fn rest(&self) -> &RequestDispatcher {
        &self.rest
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Discovers the gateway, connects, and starts the packet dispatcher.
    ///
    /// Valid from `Idle` or `Disconnected` only. Resolves once the socket is
    /// up; readiness arrives later as [`Event::Ready`].
    pub async fn login(&mut self) -> Result<(), ClientError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected => {}
            state => return Err(ClientError::InvalidState { state }),
        }
        self.state = ConnectionState::LoggingIn;

        match self.connect_gateway().await {
            Ok(()) => {
                self.state = ConnectionState::LoggedIn;
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    async fn connect_gateway(&mut self) -> Result<(), ClientError> {
        let url = match &self.config.gateway_url {
            Some(url) => url.clone(),
            None => self.rest.get_gateway().await?,
        };
        debug!(event = "login", %url, shard = self.config.shard[0]);

        let mut gateway_config = GatewayConfig::new(url, self.config.token.clone());
        gateway_config.api_version = self.config.api_version;
        gateway_config.shard = self.config.shard;

        let connection = Gateway::connect(gateway_config).await?;
        let (sender, notices) = connection.split();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let dispatcher = PacketDispatcher::new(
            self.cache.clone(),
            sender.clone(),
            event_tx,
            self.config.bot,
        );
        self.voice = Some(dispatcher.voice_endpoints());
        tokio::spawn(dispatcher.run(notices));

        self.gateway = Some(sender);
        self.events = Some(event_rx);
        Ok(())
    }

    /// Closes the gateway and destroys the session. No reconnect follows.
    /// Outstanding REST calls keep running to completion.
    pub fn logout(&mut self) -> Result<(), ClientError> {
        if self.state == ConnectionState::Idle {
            return Err(ClientError::InvalidState {
                state: ConnectionState::Idle,
            });
        }
        if let Some(gateway) = self.gateway.take() {
            gateway.shutdown();
        }
        self.voice = None;
        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Next client event. Returns `None` before login and after the event
    /// stream ends.
    pub async fn recv(&mut self) -> Option<Event> {
        let events = self.events.as_mut()?;
        let event = events.recv().await?;
        debug!(event = "client_event", kind = event.kind());
        match &event {
            Event::Ready | Event::Resumed => self.state = ConnectionState::Ready,
            Event::Disconnected if self.state != ConnectionState::Idle => {
                self.state = ConnectionState::Disconnected;
            }
            Event::Error(_) => self.state = ConnectionState::Disconnected,
            _ => {}
        }
        Some(event)
    }

    /// Sends a text message to a channel through the bucketed REST channel.
    pub async fn send_message(
        &self,
        channel_id: Snowflake,
        content: &str,
    ) -> Result<Message, ClientError> {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::LoggingIn
        ) {
            return Err(ClientError::InvalidState { state: self.state });
        }
        let value = self
            .rest
            .request(
                Method::Post,
                &format!("/channels/{channel_id}/messages"),
                RequestOptions::authenticated().with_body(json!({ "content": content })),
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| ClientError::Rest(RestError::Parse(err.to_string())))
    }

    /// Waits for the server to announce the voice endpoint for a guild.
    ///
    /// The announcement follows a voice-state change sent by the host; this
    /// call only waits, it does not initiate the join.
    pub async fn await_voice_endpoint(
        &mut self,
        guild_id: Snowflake,
    ) -> Result<VoiceEndpoint, ClientError> {
        let rx = match self.voice.as_mut() {
            Some(rx) => rx,
            None => return Err(ClientError::InvalidState { state: self.state }),
        };

        let wait = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(endpoint) = current {
                    if endpoint.guild_id == guild_id {
                        return Ok(endpoint);
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::Gateway(GatewayError::ChannelClosed));
                }
            }
        };

        match with_timeout(VOICE_ENDPOINT_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::VoiceEndpointTimeout),
        }
    }
}
