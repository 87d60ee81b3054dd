//! The chat client — outer handshake, channel membership, two-stage chat.
//!
//! `ChatClient::connect` drives the mirror image of the relay's session
//! state machine: receive the server hello, RSA-OAEP-wrap a fresh P-384
//! point under the relay key (sending our own throwaway RSA key so the
//! relay can wrap its reply), derive the session AES key, and send the
//! join envelope. After that a background task owns the socket: inbound
//! frames update peer sessions and surface `ClientEvent`s; outbound chat
//! commands are ChaCha20-encrypted per peer and AES-wrapped for the relay.

pub mod events;
pub mod peer;

use std::collections::HashMap;

use anyhow::{bail, Context as _, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rsa::RsaPublicKey;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::codec::{self, ChatPayload, ClientId, Envelope, PayloadKind};
use crate::crypto::{curve, ecdh, rsa as rsa_kem};
use crate::errors::ProtocolError;
use events::ClientEvent;
use peer::PeerSession;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const DEFAULT_MAX_ENVELOPE_BYTES: usize = 512 * 1024;

// ─── Options and handle ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub user_name: String,
    pub channel: String,
    pub password: String,
    pub max_envelope_bytes: usize,
}

impl ClientOptions {
    pub fn new(
        url: impl Into<String>,
        user_name: impl Into<String>,
        channel: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            user_name: user_name.into(),
            channel: channel.into(),
            password: password.into(),
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
        }
    }
}

enum Command {
    Send {
        kind: PayloadKind,
        data: String,
        target: Option<ClientId>,
    },
    Close,
}

/// Handle to a connected client. Events arrive on the receiver returned by
/// [`ChatClient::connect`]; dropping the handle closes the connection.
pub struct ChatClient {
    client_id: ClientId,
    cmd_tx: mpsc::Sender<Command>,
}

impl ChatClient {
    /// Connect, complete the outer handshake, and join the channel.
    pub async fn connect(opts: ClientOptions) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let (ws, _) = connect_async(&opts.url)
            .await
            .with_context(|| format!("cannot connect to {}", opts.url))?;
        let (mut sink, mut stream) = ws.split();
        let max_bytes = opts.max_envelope_bytes;

        // ── Server hello ─────────────────────────────────────────────────
        let (client_id, server_rsa) = match next_envelope(&mut stream, max_bytes).await? {
            Envelope::ServerHello { client_id, key } => {
                let der = BASE64.decode(key).context("bad server key encoding")?;
                (client_id, rsa_kem::public_key_from_der(&der)?)
            }
            _ => bail!("expected server hello"),
        };

        // ── Key exchange ─────────────────────────────────────────────────
        // Throwaway RSA keypair so the relay can wrap its reply; its public
        // half travels in the clear — session secrecy rests on the ECDH.
        let rsa_priv = rsa_kem::generate_keypair()?;
        let rsa_pub_der = rsa_kem::public_key_der(&RsaPublicKey::from(&rsa_priv))?;
        let (ecdh_secret, ecdh_point) = ecdh::generate_keypair();
        let wrapped_point = rsa_kem::oaep_encrypt(&server_rsa, &ecdh_point)?;

        sink.send(Message::Text(codec::encode(&Envelope::KeyExchange {
            rsa: Some(BASE64.encode(rsa_pub_der)),
            key: BASE64.encode(wrapped_point),
        })?))
        .await
        .context("send key exchange")?;

        let aes_key = match next_envelope(&mut stream, max_bytes).await? {
            Envelope::KeyExchange { key, .. } => {
                let wrapped = BASE64.decode(key).context("bad key exchange encoding")?;
                let server_point = rsa_kem::oaep_decrypt(&rsa_priv, &wrapped)?;
                ecdh::derive_session_key(&ecdh_secret, &server_point)?
            }
            _ => bail!("expected key exchange reply"),
        };
        debug!(client = %client_id, "session secured");

        // ── Join ─────────────────────────────────────────────────────────
        let join = Envelope::Join {
            user_name: opts.user_name.clone(),
            channel: opts.channel.clone(),
        };
        sink.send(seal_text(&aes_key, &join)?).await.context("send join")?;

        // ── Background task ──────────────────────────────────────────────
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let (curve_secret, curve_pub) = curve::generate_keypair();
        let inner = ClientInner {
            client_id,
            user_name: opts.user_name,
            password: opts.password,
            max_bytes,
            aes_key,
            curve_secret,
            curve_pub_b64: BASE64.encode(curve_pub.as_bytes()),
            peers: HashMap::new(),
            list_frames: 0,
            events: event_tx.clone(),
        };

        let _ = event_tx.send(ClientEvent::Secured { client_id }).await;
        tokio::spawn(client_loop(inner, sink, stream, cmd_rx));

        Ok((Self { client_id, cmd_tx }, event_rx))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Broadcast a text message to every established peer in the channel.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_payload(PayloadKind::Text, text.into(), None).await
    }

    /// Send a private text message to a single peer.
    pub async fn send_private_text(&self, to: ClientId, text: impl Into<String>) -> Result<()> {
        self.send_payload(PayloadKind::Text, text.into(), Some(to)).await
    }

    /// Send an arbitrary payload (image or file chunk data is opaque here).
    pub async fn send_payload(
        &self,
        kind: PayloadKind,
        data: String,
        target: Option<ClientId>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::Send { kind, data, target })
            .await
            .map_err(|_| anyhow::anyhow!("client task is gone"))
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

// ─── Internal state ──────────────────────────────────────────────────────────

struct ClientInner {
    client_id: ClientId,
    user_name: String,
    password: String,
    max_bytes: usize,
    aes_key: [u8; 32],
    curve_secret: x25519_dalek::StaticSecret,
    curve_pub_b64: String,
    peers: HashMap<ClientId, PeerSession>,
    /// List frames seen so far — join/leave events are suppressed for the
    /// first two (the warmup pair every joiner receives at its own join).
    list_frames: u32,
    events: mpsc::Sender<ClientEvent>,
}

async fn client_loop(
    mut inner: ClientInner,
    mut sink: WsSink,
    mut stream: WsStream,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(Command::Close) => break,
                Some(Command::Send { kind, data, target }) => {
                    if let Err(e) = inner.send_chat(&mut sink, kind, data, target).await {
                        warn!(err = %e, "send failed — closing");
                        break;
                    }
                }
            },
            frame = stream.next() => match frame {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = inner.handle_frame(&mut sink, &text).await {
                        warn!(err = %e, "protocol error — closing");
                        break;
                    }
                }
                Some(Ok(_)) => {} // ping/pong/binary
            },
        }
    }
    let _ = inner.events.send(ClientEvent::Closed).await;
}

impl ClientInner {
    async fn handle_frame(&mut self, sink: &mut WsSink, text: &str) -> Result<(), ProtocolError> {
        let Envelope::Cipher { data } = codec::decode(text.as_bytes(), self.max_bytes * 2)? else {
            return Err(ProtocolError::ProtocolViolation("expected cipher frame"));
        };
        match codec::open(&self.aes_key, &data, self.max_bytes)? {
            Envelope::List { clients } => self.handle_list(sink, clients).await,
            Envelope::Direct {
                client_id: Some(sender),
                user_name,
                data,
                ..
            } => self.handle_direct(sink, sender, user_name, data).await,
            Envelope::Broadcast {
                client_id: Some(sender),
                data,
                ..
            } => {
                self.handle_broadcast(sender, data).await;
                Ok(())
            }
            _ => Err(ProtocolError::ProtocolViolation("unexpected inner envelope")),
        }
    }

    /// Diff the membership list against our peer map: new peers get our
    /// X25519 public key, departed peers are torn down. UI events only
    /// after the warmup pair.
    async fn handle_list(
        &mut self,
        sink: &mut WsSink,
        clients: Vec<codec::Member>,
    ) -> Result<(), ProtocolError> {
        self.list_frames += 1;
        let announce = self.list_frames > 2;

        let listed: HashMap<ClientId, String> = clients
            .into_iter()
            .filter(|m| m.client_id != self.client_id)
            .map(|m| (m.client_id, m.user_name))
            .collect();

        let departed: Vec<ClientId> = self
            .peers
            .keys()
            .filter(|id| !listed.contains_key(id))
            .copied()
            .collect();
        for id in departed {
            if let Some(peer) = self.peers.remove(&id) {
                debug!(peer = %id, "peer left — session torn down");
                if announce {
                    let _ = self
                        .events
                        .send(ClientEvent::PeerLeft {
                            id,
                            user_name: peer.user_name,
                        })
                        .await;
                }
            }
        }

        for (id, user_name) in listed {
            if self.peers.contains_key(&id) {
                continue;
            }
            let mut peer = PeerSession::new(id, user_name.clone());
            self.send_peer_key(sink, id).await?;
            peer.mark_key_sent();
            self.peers.insert(id, peer);
            if announce {
                let _ = self
                    .events
                    .send(ClientEvent::PeerJoined { id, user_name })
                    .await;
            }
        }
        Ok(())
    }

    /// A `c` envelope: either the peer's X25519 public key or a private
    /// chat ciphertext.
    async fn handle_direct(
        &mut self,
        sink: &mut WsSink,
        sender: ClientId,
        user_name: Option<String>,
        data: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        if let Some(peer_pub_b64) = data.get("pub").and_then(|v| v.as_str()) {
            let peer_pub = match BASE64.decode(peer_pub_b64) {
                Ok(raw) => raw,
                Err(_) => {
                    warn!(peer = %sender, "undecodable peer key dropped");
                    return Ok(());
                }
            };

            // The key may race ahead of the list frame that announces the
            // peer; create the session on first contact either way.
            let peer = self
                .peers
                .entry(sender)
                .or_insert_with(|| PeerSession::new(sender, user_name.unwrap_or_default()));
            let must_reply = peer.state() == peer::PeerState::Announced;
            let established = peer.establish(&self.curve_secret, &peer_pub, &self.password);
            match established {
                Ok(drained) => {
                    debug!(peer = %sender, "peer session established");
                    if must_reply {
                        self.send_peer_key(sink, sender).await?;
                        if let Some(p) = self.peers.get_mut(&sender) {
                            p.mark_key_sent();
                        }
                    }
                    for ciphertext in drained {
                        self.deliver(sender, &ciphertext).await;
                    }
                }
                Err(e) => warn!(peer = %sender, err = %e, "peer key rejected"),
            }
            return Ok(());
        }

        if let Some(msg_b64) = data.get("msg").and_then(|v| v.as_str()) {
            match BASE64.decode(msg_b64) {
                Ok(ciphertext) => self.receive_ciphertext(sender, ciphertext).await,
                Err(_) => warn!(peer = %sender, "undecodable private frame dropped"),
            }
            return Ok(());
        }

        debug!(peer = %sender, "unrecognized peer payload dropped");
        Ok(())
    }

    async fn handle_broadcast(&mut self, sender: ClientId, data: HashMap<ClientId, String>) {
        let Some(entry) = data.get(&self.client_id) else {
            // Not addressed to us — nothing we could decrypt anyway.
            return;
        };
        match BASE64.decode(entry) {
            Ok(ciphertext) => self.receive_ciphertext(sender, ciphertext).await,
            Err(_) => warn!(peer = %sender, "undecodable broadcast entry dropped"),
        }
    }

    /// Decrypt-or-buffer for an inbound chat ciphertext.
    async fn receive_ciphertext(&mut self, sender: ClientId, ciphertext: Vec<u8>) {
        match self.peers.get_mut(&sender) {
            None => {
                // Ciphertext from a peer we have not even listed yet —
                // park it until the key exchange catches up.
                let mut peer = PeerSession::new(sender, String::new());
                peer.buffer(ciphertext);
                self.peers.insert(sender, peer);
                return;
            }
            Some(peer) if !peer.is_established() => {
                peer.buffer(ciphertext);
                return;
            }
            Some(_) => {}
        }
        self.deliver(sender, &ciphertext).await;
    }

    /// Decrypt, parse, and surface one chat payload. Failures are logged
    /// and dropped — a wrong-password peer produces these persistently and
    /// must never take the session down.
    async fn deliver(&mut self, sender: ClientId, ciphertext: &[u8]) {
        let Some(peer) = self.peers.get(&sender) else {
            return;
        };
        let plaintext = match peer.decrypt(ciphertext) {
            Some(Ok(pt)) => pt,
            Some(Err(e)) => {
                warn!(peer = %sender, err = %e, "undecryptable message dropped");
                return;
            }
            None => return,
        };
        let payload: ChatPayload = match serde_json::from_slice(&plaintext) {
            Ok(p) => p,
            Err(_) => {
                warn!(peer = %sender, "undecryptable message dropped (wrong password?)");
                return;
            }
        };
        let _ = self
            .events
            .send(ClientEvent::Message {
                from: sender,
                from_name: peer.user_name.clone(),
                payload,
            })
            .await;
    }

    async fn send_peer_key(&self, sink: &mut WsSink, target: ClientId) -> Result<(), ProtocolError> {
        let env = Envelope::Direct {
            target,
            client_id: None,
            user_name: None,
            data: serde_json::json!({ "pub": self.curve_pub_b64 }),
        };
        self.send_sealed(sink, &env).await
    }

    async fn send_chat(
        &mut self,
        sink: &mut WsSink,
        kind: PayloadKind,
        data: String,
        target: Option<ClientId>,
    ) -> Result<(), ProtocolError> {
        match target {
            Some(target_id) => {
                let payload = ChatPayload::new(kind, true, data, self.user_name.clone());
                let plaintext = serde_json::to_vec(&payload)
                    .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
                let Some(ciphertext) =
                    self.peers.get(&target_id).and_then(|p| p.encrypt(&plaintext))
                else {
                    warn!(peer = %target_id, "private message to non-established peer dropped");
                    return Ok(());
                };
                let env = Envelope::Direct {
                    target: target_id,
                    client_id: None,
                    user_name: None,
                    data: serde_json::json!({ "msg": BASE64.encode(ciphertext) }),
                };
                self.send_sealed(sink, &env).await
            }
            None => {
                let payload = ChatPayload::new(kind, false, data, self.user_name.clone());
                let plaintext = serde_json::to_vec(&payload)
                    .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
                let mut per_recipient = HashMap::new();
                for (id, peer) in &self.peers {
                    if let Some(ciphertext) = peer.encrypt(&plaintext) {
                        per_recipient.insert(*id, BASE64.encode(ciphertext));
                    }
                }
                if per_recipient.is_empty() {
                    debug!("broadcast with no established peers — nothing sent");
                    return Ok(());
                }
                let env = Envelope::Broadcast {
                    client_id: None,
                    user_name: None,
                    data: per_recipient,
                };
                self.send_sealed(sink, &env).await
            }
        }
    }

    async fn send_sealed(&self, sink: &mut WsSink, inner: &Envelope) -> Result<(), ProtocolError> {
        let msg = seal_text(&self.aes_key, inner)?;
        sink.send(msg)
            .await
            .map_err(|_| ProtocolError::ProtocolViolation("transport closed"))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn seal_text(aes_key: &[u8; 32], inner: &Envelope) -> Result<Message, ProtocolError> {
    let outer = codec::seal(aes_key, inner)?;
    Ok(Message::Text(codec::encode(&outer)?))
}

async fn next_envelope(stream: &mut WsStream, max_bytes: usize) -> Result<Envelope> {
    loop {
        match stream.next().await {
            None => bail!("transport closed during handshake"),
            Some(Err(e)) => return Err(e).context("transport error during handshake"),
            Some(Ok(Message::Text(text))) => return Ok(codec::decode(text.as_bytes(), max_bytes)?),
            Some(Ok(Message::Close(_))) => bail!("relay closed the transport during handshake"),
            Some(Ok(_)) => continue,
        }
    }
}
