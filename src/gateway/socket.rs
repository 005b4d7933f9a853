//! Websocket connection worker and reconnect supervisor.
//!
//! [`Gateway::connect`] spawns a background task that owns the socket for its
//! whole life. Callers talk to it through a command channel and consume
//! decoded packets from a notice channel. When a session drops, the worker
//! reconnects on its own with growing jittered delays; only an explicit
//! shutdown or a fatal close code stops it.

use std::collections::VecDeque;
use std::io::Read;
use std::time::Duration;

use flate2::read::ZlibDecoder;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use secrecy::SecretString;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::gateway::proto::{
    self, classify_close, CloseAction, Hello, Packet, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK,
    OP_HELLO, OP_INVALID_SESSION, OP_RECONNECT,
};
use crate::model::Snowflake;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_CEILING: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket failure: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server never sent HELLO")]
    HelloTimeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("gateway closed with fatal code {code}")]
    Fatal { code: u16 },

    #[error("gateway worker is gone")]
    ChannelClosed,
}

/// Connection parameters for one shard.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Base websocket URL as returned by the gateway-discovery endpoint.
    pub url: String,
    pub api_version: u8,
    pub token: SecretString,
    /// `[shard id, shard count]` echoed in IDENTIFY.
    pub shard: [u16; 2],
    pub hello_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>, token: SecretString) -> Self {
        Self {
            url: url.into(),
            api_version: crate::rest::dispatcher::DEFAULT_API_VERSION,
            token,
            shard: [0, 1],
            hello_timeout: Duration::from_secs(30),
        }
    }

    fn socket_url(&self) -> String {
        format!(
            "{}/?encoding=json&v={}",
            self.url.trim_end_matches('/'),
            self.api_version
        )
    }
}

/// Commands accepted by the connection worker.
#[derive(Debug)]
pub enum GatewayCommand {
    /// Send a packet. Queued and replayed after reconnect if the socket is
    /// currently down.
    Send(Packet),
    /// Close the socket and stop. No reconnect follows.
    Shutdown,
}

/// Decoded inbound traffic and connection-state notices.
#[derive(Debug)]
pub enum GatewayNotice {
    /// A dispatch packet (op 0) with its event name and payload.
    Dispatch { kind: String, payload: Value },
    /// The connection dropped. The worker reconnects on its own unless this
    /// followed a shutdown command.
    Disconnected,
    /// Non-fatal anomaly; the connection stays up or will be retried.
    Warn(String),
    /// Unrecoverable failure. The worker has stopped.
    Fatal(String),
}

/// Cloneable handle for sending commands to the connection worker.
#[derive(Clone)]
pub struct GatewaySender {
    tx: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewaySender {
    pub fn send(&self, packet: Packet) -> Result<(), GatewayError> {
        self.tx
            .send(GatewayCommand::Send(packet))
            .map_err(|_| GatewayError::ChannelClosed)
    }

    pub fn request_guild_members(&self, guild_id: Snowflake) -> Result<(), GatewayError> {
        self.send(proto::request_guild_members(guild_id))
    }

    pub fn guild_sync(&self, guild_ids: &[Snowflake]) -> Result<(), GatewayError> {
        self.send(proto::guild_sync(guild_ids))
    }

    /// Requests a clean close. Idempotent; safe after the worker has exited.
    pub fn shutdown(&self) {
        let _ = self.tx.send(GatewayCommand::Shutdown);
    }

    /// Sender backed by a bare channel, for exercising consumers without a
    /// socket.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<GatewayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Live gateway connection handle returned by [`Gateway::connect`].
pub struct GatewayConnection {
    sender: GatewaySender,
    notices: mpsc::UnboundedReceiver<GatewayNotice>,
}

impl GatewayConnection {
    pub fn sender(&self) -> GatewaySender {
        self.sender.clone()
    }

    pub fn split(self) -> (GatewaySender, mpsc::UnboundedReceiver<GatewayNotice>) {
        (self.sender, self.notices)
    }
}

pub struct Gateway;

impl Gateway {
    /// Opens the gateway connection and spawns its worker.
    ///
    /// Resolves once the first socket is established; later drops are handled
    /// by the worker's reconnect loop and reported through notices.
    pub async fn connect(config: GatewayConfig) -> Result<GatewayConnection, GatewayError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(gateway_worker(config, command_rx, notice_tx, ready_tx));

        ready_rx.await.map_err(|_| GatewayError::ChannelClosed)??;
        Ok(GatewayConnection {
            sender: GatewaySender { tx: command_tx },
            notices: notice_rx,
        })
    }
}

/// Session identity that survives socket drops.
#[derive(Debug, Default)]
struct SessionState {
    id: Option<String>,
    sequence: Option<u64>,
}

impl SessionState {
    fn clear(&mut self) {
        self.id = None;
        self.sequence = None;
    }
}

/// Ack-tracking for the heartbeat ticker.
///
/// A tick that arrives while the previous beat is still unacked means the
/// connection is dead in one direction and must be torn down.
#[derive(Debug)]
struct Heartbeat {
    acked: bool,
}

impl Heartbeat {
    fn new() -> Self {
        Self { acked: true }
    }

    /// Returns false when the previous beat was never acknowledged.
    fn beat(&mut self) -> bool {
        if !self.acked {
            return false;
        }
        self.acked = false;
        true
    }

    fn ack(&mut self) {
        self.acked = true;
    }
}

/// Delay schedule for reconnect attempts.
///
/// Each attempt sleeps the current delay, then grows it by a random factor in
/// [1.0, 2.0] up to the ceiling. Reaching READY resets to the floor.
#[derive(Debug)]
struct ReconnectBackoff {
    delay: Duration,
}

impl ReconnectBackoff {
    fn new() -> Self {
        Self {
            delay: RECONNECT_FLOOR,
        }
    }

    fn next(&mut self) -> Duration {
        self.next_with(rand::thread_rng().gen::<f64>())
    }

    fn next_with(&mut self, unit: f64) -> Duration {
        let delay = self.delay;
        let grown = delay.mul_f64(1.0 + unit.clamp(0.0, 1.0));
        self.delay = grown.min(RECONNECT_CEILING);
        delay
    }

    fn reset(&mut self) {
        self.delay = RECONNECT_FLOOR;
    }
}

enum SessionEnd {
    /// Shutdown command or command channel gone; do not reconnect.
    Shutdown,
    /// Fatal close code; do not reconnect.
    Fatal(u16),
    /// Recoverable drop; supervisor reconnects after backoff.
    Retry { reached_ready: bool },
}

async fn gateway_worker(
    config: GatewayConfig,
    mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
    notices: mpsc::UnboundedSender<GatewayNotice>,
    ready: oneshot::Sender<Result<(), GatewayError>>,
) {
    let mut session = SessionState::default();
    let mut backoff = ReconnectBackoff::new();
    let mut pending: VecDeque<Packet> = VecDeque::new();
    let mut ready = Some(ready);

    loop {
        match connect_async(config.socket_url()).await {
            Ok((socket, _response)) => {
                if let Some(tx) = ready.take() {
                    if tx.send(Ok(())).is_err() {
                        return;
                    }
                }
                let end = run_session(
                    socket,
                    &config,
                    &mut session,
                    &mut commands,
                    &notices,
                    &mut pending,
                )
                .await;
                match end {
                    SessionEnd::Shutdown => {
                        let _ = notices.send(GatewayNotice::Disconnected);
                        return;
                    }
                    SessionEnd::Fatal(code) => {
                        let _ = notices.send(GatewayNotice::Fatal(format!(
                            "gateway closed with fatal code {code}"
                        )));
                        return;
                    }
                    SessionEnd::Retry { reached_ready } => {
                        if reached_ready {
                            backoff.reset();
                        }
                        let _ = notices.send(GatewayNotice::Disconnected);
                    }
                }
            }
            Err(err) => {
                // First-connect failures are the caller's problem; later ones
                // feed the retry loop.
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(GatewayError::Socket(err)));
                    return;
                }
                let _ = notices.send(GatewayNotice::Warn(format!(
                    "gateway connect failed: {err}"
                )));
            }
        }

        let delay = backoff.next();
        debug!(event = "gateway_reconnect_wait", delay_ms = delay.as_millis() as u64);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(GatewayCommand::Send(packet)) => pending.push_back(packet),
                    Some(GatewayCommand::Shutdown) | None => return,
                },
            }
        }
    }
}

async fn run_session(
    mut socket: WsStream,
    config: &GatewayConfig,
    session: &mut SessionState,
    commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
    notices: &mpsc::UnboundedSender<GatewayNotice>,
    pending: &mut VecDeque<Packet>,
) -> SessionEnd {
    let hello = match await_hello(&mut socket, config.hello_timeout).await {
        Ok(hello) => hello,
        Err(err) => {
            let _ = notices.send(GatewayNotice::Warn(format!("handshake failed: {err}")));
            return SessionEnd::Retry {
                reached_ready: false,
            };
        }
    };

    let handshake = handshake_packet(config, session);
    debug!(
        event = "gateway_handshake",
        resuming = handshake.op == proto::OP_RESUME,
        heartbeat_interval_ms = hello.heartbeat_interval,
    );
    if send_packet(&mut socket, &handshake).await.is_err() {
        return SessionEnd::Retry {
            reached_ready: false,
        };
    }

    // Replay commands that arrived while the socket was down, in order.
    while let Some(packet) = pending.pop_front() {
        if send_packet(&mut socket, &packet).await.is_err() {
            pending.push_front(packet);
            return SessionEnd::Retry {
                reached_ready: false,
            };
        }
    }

    let interval = Duration::from_millis(hello.heartbeat_interval);
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = Heartbeat::new();
    let mut reached_ready = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !heartbeat.beat() {
                    warn!(event = "gateway_heartbeat_missed_ack");
                    let _ = notices.send(GatewayNotice::Warn(
                        "heartbeat ack missed, reconnecting".to_string(),
                    ));
                    let _ = socket.close(None).await;
                    return SessionEnd::Retry { reached_ready };
                }
                if send_packet(&mut socket, &proto::heartbeat(session.sequence))
                    .await
                    .is_err()
                {
                    return SessionEnd::Retry { reached_ready };
                }
            }

            command = commands.recv() => match command {
                Some(GatewayCommand::Send(packet)) => {
                    if send_packet(&mut socket, &packet).await.is_err() {
                        pending.push_back(packet);
                        return SessionEnd::Retry { reached_ready };
                    }
                }
                Some(GatewayCommand::Shutdown) | None => {
                    let _ = socket.close(None).await;
                    return SessionEnd::Shutdown;
                }
            },

            frame = socket.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        let _ = notices.send(GatewayNotice::Warn(format!(
                            "gateway read failed: {err}"
                        )));
                        return SessionEnd::Retry { reached_ready };
                    }
                    None => return SessionEnd::Retry { reached_ready },
                };

                if let Message::Close(close) = &message {
                    let code = close
                        .as_ref()
                        .map(|frame| u16::from(frame.code))
                        .unwrap_or(1005);
                    match classify_close(code) {
                        CloseAction::Fatal => return SessionEnd::Fatal(code),
                        CloseAction::Identify => {
                            session.clear();
                            return SessionEnd::Retry { reached_ready };
                        }
                        CloseAction::Resume => return SessionEnd::Retry { reached_ready },
                    }
                }

                let packet = match decode_frame(&message) {
                    Ok(Some(packet)) => packet,
                    // Ping/pong traffic; tungstenite answers pings itself.
                    Ok(None) => continue,
                    Err(err) => {
                        // A malformed frame is dropped, the connection stays up.
                        warn!(event = "gateway_decode_failed", error = %err);
                        let _ = notices.send(GatewayNotice::Warn(format!(
                            "dropped malformed gateway frame: {err}"
                        )));
                        continue;
                    }
                };

                match packet.op {
                    OP_DISPATCH => {
                        if let Some(seq) = packet.s {
                            session.sequence = Some(seq);
                        }
                        let kind = packet.t.unwrap_or_default();
                        if kind == "READY" {
                            if let Some(id) =
                                packet.d.get("session_id").and_then(Value::as_str)
                            {
                                session.id = Some(id.to_string());
                            }
                            reached_ready = true;
                        } else if kind == "RESUMED" {
                            reached_ready = true;
                        }
                        let _ = notices.send(GatewayNotice::Dispatch {
                            kind,
                            payload: packet.d,
                        });
                    }
                    // The server may ask for an immediate beat.
                    OP_HEARTBEAT => {
                        if send_packet(&mut socket, &proto::heartbeat(session.sequence))
                            .await
                            .is_err()
                        {
                            return SessionEnd::Retry { reached_ready };
                        }
                    }
                    OP_HEARTBEAT_ACK => heartbeat.ack(),
                    OP_RECONNECT => {
                        let _ = socket.close(None).await;
                        return SessionEnd::Retry { reached_ready };
                    }
                    OP_INVALID_SESSION => {
                        // Session is gone; identify fresh on the same socket.
                        session.clear();
                        let fresh = proto::identify(&config.token, config.shard);
                        if send_packet(&mut socket, &fresh).await.is_err() {
                            return SessionEnd::Retry { reached_ready };
                        }
                    }
                    OP_HELLO => {
                        let _ = notices.send(GatewayNotice::Warn(
                            "unexpected HELLO mid-session, dropped".to_string(),
                        ));
                    }
                    other => {
                        debug!(event = "gateway_unknown_opcode", op = other);
                    }
                }
            }
        }
    }
}

async fn await_hello(socket: &mut WsStream, timeout: Duration) -> Result<Hello, GatewayError> {
    let deadline = Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, socket.next())
            .await
            .map_err(|_| GatewayError::HelloTimeout)?;
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => return Err(GatewayError::Socket(err)),
            None => {
                return Err(GatewayError::Handshake(
                    "socket closed before HELLO".to_string(),
                ))
            }
        };
        match decode_frame(&message) {
            Ok(Some(packet)) if packet.op == OP_HELLO => {
                return serde_json::from_value(packet.d)
                    .map_err(|err| GatewayError::Handshake(err.to_string()));
            }
            Ok(Some(packet)) => {
                return Err(GatewayError::Handshake(format!(
                    "expected HELLO, got op {}",
                    packet.op
                )))
            }
            Ok(None) => continue,
            Err(err) => return Err(GatewayError::Handshake(err)),
        }
    }
}

/// RESUME when a session identity survives, IDENTIFY otherwise.
fn handshake_packet(config: &GatewayConfig, session: &SessionState) -> Packet {
    match (&session.id, session.sequence) {
        (Some(id), Some(sequence)) => proto::resume(&config.token, id, sequence),
        _ => proto::identify(&config.token, config.shard),
    }
}

async fn send_packet(
    socket: &mut WsStream,
    packet: &Packet,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = serde_json::to_string(packet).unwrap_or_default();
    socket.send(Message::Text(text)).await
}

/// Decodes one inbound frame. Binary frames are zlib-compressed JSON.
/// Returns `Ok(None)` for control frames that carry no packet.
fn decode_frame(message: &Message) -> Result<Option<Packet>, String> {
    match message {
        Message::Text(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|err| err.to_string()),
        Message::Binary(bytes) => {
            let mut decoder = ZlibDecoder::new(bytes.as_slice());
            let mut text = String::new();
            decoder
                .read_to_string(&mut text)
                .map_err(|err| format!("zlib inflate failed: {err}"))?;
            serde_json::from_str(&text)
                .map(Some)
                .map_err(|err| err.to_string())
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig::new("wss://gateway.test", SecretString::new("tok".to_string()))
    }

    #[test]
    fn heartbeat_dies_on_missed_ack() {
        let mut heartbeat = Heartbeat::new();
        assert!(heartbeat.beat());
        // No ack arrived before the next tick.
        assert!(!heartbeat.beat());

        heartbeat.ack();
        assert!(heartbeat.beat());
    }

    #[test]
    fn backoff_grows_monotonically_to_the_ceiling() {
        let mut backoff = ReconnectBackoff::new();
        let mut previous = Duration::ZERO;
        for _ in 0..12 {
            let delay = backoff.next_with(1.0);
            assert!(delay >= previous);
            assert!(delay <= RECONNECT_CEILING);
            previous = delay;
        }
        assert_eq!(previous, RECONNECT_CEILING);
    }

    #[test]
    fn backoff_resets_to_the_floor_after_ready() {
        let mut backoff = ReconnectBackoff::new();
        backoff.next_with(1.0);
        backoff.next_with(1.0);
        assert!(backoff.next_with(0.0) > RECONNECT_FLOOR);

        backoff.reset();
        assert_eq!(backoff.next_with(0.0), RECONNECT_FLOOR);
    }

    #[test]
    fn handshake_resumes_only_with_a_full_session() {
        let config = config();
        let mut session = SessionState::default();
        assert_eq!(handshake_packet(&config, &session).op, proto::OP_IDENTIFY);

        session.id = Some("sess".to_string());
        session.sequence = Some(41);
        assert_eq!(handshake_packet(&config, &session).op, proto::OP_RESUME);

        // INVALID_SESSION clears both fields; the next handshake identifies.
        session.clear();
        assert_eq!(handshake_packet(&config, &session).op, proto::OP_IDENTIFY);
    }

    #[test]
    fn decode_frame_inflates_zlib_binary() {
        let raw = r#"{"op":0,"d":{"content":"hi"},"s":3,"t":"MESSAGE_CREATE"}"#;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw.as_bytes()).expect("compress");
        let compressed = encoder.finish().expect("finish");

        let packet = decode_frame(&Message::Binary(compressed))
            .expect("decode")
            .expect("packet");
        assert_eq!(packet.op, OP_DISPATCH);
        assert_eq!(packet.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn malformed_frames_error_without_panicking() {
        assert!(decode_frame(&Message::Text("{not json".to_string())).is_err());
        assert!(decode_frame(&Message::Binary(vec![1, 2, 3])).is_err());
        assert!(decode_frame(&Message::Pong(Vec::new()))
            .expect("control frame")
            .is_none());
    }
}
