//! The relay — a blind WebSocket router.
//!
//! The relay authenticates the transport layer (RSA identity + ECDH-P384 →
//! per-session AES-256-CBC), tracks channel membership, and forwards opaque
//! peer ciphertexts. It decrypts only the *outer* layer of each frame — just
//! enough to read the action tag and routing fields — then re-encrypts the
//! inner envelope under each recipient's own session key. Chat plaintext
//! never exists on the relay.
//!
//! Concurrency model: one reader task per connection; all routing state
//! (sessions + channels) lives behind a single mutex, so membership updates
//! and fan-outs are linearized in arrival order exactly like the
//! single-threaded original. Outbound frames go through per-session FIFO
//! queues drained by a writer task, which preserves sender order per
//! recipient.

pub mod channels;
pub mod keystore;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::codec::{self, ClientId, Envelope, Member};
use crate::config::RelayConfig;
use crate::errors::ProtocolError;
use channels::ChannelRegistry;
use keystore::RelayKeyStore;
use session::{ClientSession, Phase};

// ─── Shared state ────────────────────────────────────────────────────────────

/// Everything a connection handler needs, passed explicitly.
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub keystore: Mutex<RelayKeyStore>,
    pub state: Mutex<RelayState>,
}

impl RelayContext {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let keystore = RelayKeyStore::open(&config.data_dir, config.rsa_rotation_interval)?;
        Ok(Self {
            config: Arc::new(config),
            keystore: Mutex::new(keystore),
            state: Mutex::new(RelayState::new()),
        })
    }
}

/// Session map + channel registry. Handlers lock this, run to completion,
/// and release — the membership invariants need no finer locking.
#[derive(Default)]
pub struct RelayState {
    pub(crate) sessions: HashMap<ClientId, ClientSession>,
    channels: ChannelRegistry,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, session: ClientSession) {
        self.sessions.insert(session.id, session);
    }

    /// Route one decrypted inner envelope from `sender`.
    fn handle_inner(&mut self, sender: ClientId, inner: Envelope) -> Result<(), ProtocolError> {
        match inner {
            Envelope::Join { user_name, channel } => self.handle_join(sender, user_name, channel),
            Envelope::Direct { target, data, .. } => self.forward_unicast(sender, target, data),
            Envelope::Broadcast { data, .. } => self.forward_broadcast(sender, data),
            _ => Err(ProtocolError::ProtocolViolation("unexpected inner envelope")),
        }
    }

    fn handle_join(
        &mut self,
        sender: ClientId,
        user_name: String,
        channel: String,
    ) -> Result<(), ProtocolError> {
        let session = self
            .sessions
            .get_mut(&sender)
            .ok_or(ProtocolError::ProtocolViolation("unknown session"))?;
        // A repeated join is a violation — membership is never duplicated.
        if session.phase != Phase::Secured {
            return Err(ProtocolError::ProtocolViolation("join out of order"));
        }
        session.phase = Phase::Joined;
        session.channel = Some(channel.clone());
        session.user_name = Some(user_name);
        session.joined_at = Some(Instant::now());
        self.channels.add(&channel, sender);

        // The joiner gets its individual list first (self-id + existing
        // members before any message can arrive), then the channel-wide
        // refresh reaches every member including the joiner.
        let list = self.list_envelope(&channel);
        if let Some(session) = self.sessions.get(&sender) {
            match session.seal(&list) {
                Ok(msg) => session.send(msg),
                Err(e) => warn!(client = %sender, err = %e, "cannot seal joiner list"),
            }
        }
        self.broadcast_list(&channel);
        info!(client = %sender, channel = %channel, "client joined");
        Ok(())
    }

    /// Remove a session entirely (close, error, or idle) and tell the
    /// channel. The only cancellation path in the protocol.
    pub(crate) fn remove_session(&mut self, id: &ClientId) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        if let (Phase::Joined, Some(channel)) = (session.phase, session.channel) {
            self.channels.remove(&channel, id);
            self.broadcast_list(&channel);
            info!(client = %id, channel = %channel, "client left");
        }
    }

    fn list_envelope(&self, channel: &str) -> Envelope {
        let mut clients: Vec<Member> = self
            .channels
            .members(channel)
            .filter_map(|id| self.sessions.get(id))
            .map(|s| Member {
                client_id: s.id,
                user_name: s.user_name.clone().unwrap_or_default(),
            })
            .collect();
        clients.sort_by_key(|m| m.client_id);
        Envelope::List { clients }
    }

    fn broadcast_list(&self, channel: &str) {
        let list = self.list_envelope(channel);
        for id in self.channels.members(channel) {
            let Some(session) = self.sessions.get(id) else {
                continue;
            };
            match session.seal(&list) {
                Ok(msg) => session.send(msg),
                Err(e) => warn!(client = %id, err = %e, "cannot seal list broadcast"),
            }
        }
    }

    /// Re-encrypt the broadcast under every other member's key. The
    /// per-recipient ciphertext map is copied verbatim; only the sender
    /// identity fields are filled in. The sender is never echoed.
    fn forward_broadcast(
        &self,
        sender: ClientId,
        data: HashMap<ClientId, String>,
    ) -> Result<(), ProtocolError> {
        let (channel, user_name) = self.joined_channel(sender)?;
        let inner = Envelope::Broadcast {
            client_id: Some(sender),
            user_name: Some(user_name),
            data,
        };
        for id in self.channels.members(&channel) {
            if *id == sender {
                continue;
            }
            let Some(session) = self.sessions.get(id) else {
                continue;
            };
            match session.seal(&inner) {
                Ok(msg) => session.send(msg),
                Err(e) => warn!(client = %id, err = %e, "cannot seal broadcast"),
            }
        }
        Ok(())
    }

    /// Re-encrypt a peer-addressed payload under the target's key only.
    /// A target outside the sender's channel is a silent drop — the inner
    /// layer is opaque, so no meaningful error can be signalled.
    fn forward_unicast(
        &self,
        sender: ClientId,
        target: ClientId,
        data: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        let (channel, user_name) = self.joined_channel(sender)?;
        if !self.channels.contains(&channel, &target) {
            debug!(client = %sender, target = %target, "unicast to unknown target dropped");
            return Ok(());
        }
        let Some(session) = self.sessions.get(&target) else {
            return Ok(());
        };
        let inner = Envelope::Direct {
            target,
            client_id: Some(sender),
            user_name: Some(user_name),
            data,
        };
        match session.seal(&inner) {
            Ok(msg) => session.send(msg),
            Err(e) => warn!(client = %target, err = %e, "cannot seal unicast"),
        }
        Ok(())
    }

    fn joined_channel(&self, sender: ClientId) -> Result<(String, String), ProtocolError> {
        let session = self
            .sessions
            .get(&sender)
            .ok_or(ProtocolError::ProtocolViolation("unknown session"))?;
        if session.phase != Phase::Joined {
            return Err(ProtocolError::ProtocolViolation("chat before join"));
        }
        Ok((
            session.channel.clone().unwrap_or_default(),
            session.user_name.clone().unwrap_or_default(),
        ))
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<RelayContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind, ctx.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(addr = %addr, "relay listening");

    // Periodic rotation check; new connections also check on accept.
    let rotate_ctx = ctx.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        tick.tick().await; // immediate first tick
        loop {
            tick.tick().await;
            if let Err(e) = rotate_ctx.keystore.lock().await.rotate_if_due(chrono::Utc::now()) {
                warn!(err = %e, "relay identity rotation failed");
            }
        }
    });

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping relay");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        debug!(peer = %peer, "connection ended: {e:#}");
                    }
                });
            }
        }
    }

    info!("relay stopped");
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C; elsewhere Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
) -> Result<()> {
    let max_bytes = ctx.config.max_envelope_bytes;
    let ws_config = WebSocketConfig {
        // Outer frames carry base64 of an inner envelope plus AES overhead.
        max_message_size: Some(max_bytes * 2),
        max_frame_size: Some(max_bytes * 2),
        ..Default::default()
    };
    let ws = accept_async_with_config(stream, Some(ws_config)).await?;
    let (sink, mut stream) = ws.split();

    let (out_tx, out_rx) = mpsc::channel::<Message>(128);
    tokio::spawn(write_outbound(out_rx, sink));

    let identity = ctx.keystore.lock().await.current()?;
    let id = ClientId::random();
    let mut session = ClientSession::new(id, identity, out_tx.clone());

    out_tx
        .send(Message::Text(codec::encode(&session.hello())?))
        .await
        .context("send server hello")?;
    debug!(peer = %peer, client = %id, "server hello sent");

    // The one permitted pre-AES frame: the client's key exchange.
    let idle = ctx.config.idle_timeout;
    let reply = match next_text(&mut stream, idle).await {
        FrameRead::Text(text) => {
            let exchanged = codec::decode(text.as_bytes(), max_bytes).and_then(|env| match env {
                Envelope::KeyExchange { rsa, key } => {
                    session.accept_key_exchange(rsa.as_deref(), &key)
                }
                _ => Err(ProtocolError::ProtocolViolation("expected key exchange")),
            });
            match exchanged {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(peer = %peer, client = %id, err = %e, "handshake failed");
                    return Ok(());
                }
            }
        }
        _ => {
            debug!(peer = %peer, client = %id, "transport closed during handshake");
            return Ok(());
        }
    };
    out_tx
        .send(Message::Text(codec::encode(&reply)?))
        .await
        .context("send key exchange reply")?;
    info!(peer = %peer, client = %id, "session secured");

    ctx.state.lock().await.insert(session);
    let result = read_loop(&mut stream, id, &ctx).await;
    ctx.state.lock().await.remove_session(&id);

    if let Err(e) = result {
        warn!(client = %id, err = %e, "session closed");
    }
    Ok(())
}

enum FrameRead {
    Text(String),
    Closed,
    IdleTimeout,
}

/// Next text frame, or why there won't be one. Any inbound frame counts as
/// liveness for the idle deadline.
async fn next_text(stream: &mut WsStream, idle: std::time::Duration) -> FrameRead {
    loop {
        match timeout(idle, stream.next()).await {
            Err(_) => return FrameRead::IdleTimeout,
            Ok(None) => return FrameRead::Closed,
            Ok(Some(Err(_))) => return FrameRead::Closed,
            Ok(Some(Ok(Message::Text(t)))) => return FrameRead::Text(t),
            Ok(Some(Ok(Message::Close(_)))) => return FrameRead::Closed,
            Ok(Some(Ok(_))) => continue, // ping/pong/binary
        }
    }
}

/// Post-handshake frame pump: outer decrypt, route, repeat until the
/// transport closes, the idle deadline passes, or the session misbehaves.
async fn read_loop(
    stream: &mut WsStream,
    id: ClientId,
    ctx: &Arc<RelayContext>,
) -> Result<(), ProtocolError> {
    let idle = ctx.config.idle_timeout;
    let max_bytes = ctx.config.max_envelope_bytes;
    loop {
        let text = match next_text(stream, idle).await {
            FrameRead::Text(t) => t,
            FrameRead::Closed => return Ok(()),
            FrameRead::IdleTimeout => {
                info!(client = %id, "idle timeout");
                return Ok(());
            }
        };

        let Envelope::Cipher { data } = codec::decode(text.as_bytes(), max_bytes * 2)? else {
            return Err(ProtocolError::ProtocolViolation("expected cipher frame"));
        };

        let mut state = ctx.state.lock().await;
        let inner = {
            let Some(session) = state.sessions.get_mut(&id) else {
                return Ok(());
            };
            session.touch();
            session.open(&data, max_bytes)?
        };
        state.handle_inner(id, inner)?;
    }
}

/// Drain the outbound queue into the socket; FIFO per recipient.
async fn write_outbound(mut rx: mpsc::Receiver<Message>, mut sink: WsSink) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
