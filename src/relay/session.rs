//! Server-side per-connection state machine.
//!
//! ```text
//! Accepted ──send(server hello)──────────────────▶ RsaAnnounced
//! RsaAnnounced ──recv(e) derive+send(e)──────────▶ Secured
//! Secured ──recv(join)───────────────────────────▶ Joined
//! Joined ──recv(c | w)───────────────────────────▶ Joined (forward)
//! <any> ──transport close | idle timeout─────────▶ gone
//! ```
//!
//! Any envelope outside this order is a `ProtocolViolation`; any outer
//! decrypt failure is `BadCipher`. Both close the transport.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::codec::{self, ClientId, Envelope};
use crate::crypto::{ecdh, rsa as rsa_kem};
use crate::errors::ProtocolError;
use crate::relay::keystore::RelayIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RsaAnnounced,
    Secured,
    Joined,
}

pub struct ClientSession {
    pub id: ClientId,
    /// Identity captured at accept time — rotation never re-resolves it.
    identity: Arc<RelayIdentity>,
    pub phase: Phase,
    aes_key: Option<[u8; 32]>,
    pub channel: Option<String>,
    pub user_name: Option<String>,
    outbound: mpsc::Sender<Message>,
    pub joined_at: Option<Instant>,
    pub last_seen: Instant,
}

impl ClientSession {
    pub fn new(id: ClientId, identity: Arc<RelayIdentity>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            identity,
            phase: Phase::RsaAnnounced,
            aes_key: None,
            channel: None,
            user_name: None,
            outbound,
            joined_at: None,
            last_seen: Instant::now(),
        }
    }

    /// The `s` envelope announcing this session's id and the relay RSA key.
    pub fn hello(&self) -> Envelope {
        Envelope::ServerHello {
            client_id: self.id,
            key: BASE64.encode(self.identity.public_der()),
        }
    }

    /// Process the client's `e` envelope: unwrap its P-384 point, derive the
    /// session key, and build the reply point wrapped under the client's RSA
    /// key. Transitions RsaAnnounced → Secured.
    pub fn accept_key_exchange(
        &mut self,
        client_rsa_b64: Option<&str>,
        wrapped_point_b64: &str,
    ) -> Result<Envelope, ProtocolError> {
        if self.phase != Phase::RsaAnnounced {
            return Err(ProtocolError::ProtocolViolation("key exchange out of order"));
        }

        let wrapped = BASE64
            .decode(wrapped_point_b64)
            .map_err(|_| ProtocolError::MalformedFrame("bad base64 in key exchange".into()))?;
        let client_point = self.identity.unwrap_oaep(&wrapped)?;

        let client_rsa_der = client_rsa_b64
            .ok_or(ProtocolError::ProtocolViolation("key exchange without client RSA key"))?;
        let client_rsa_der = BASE64
            .decode(client_rsa_der)
            .map_err(|_| ProtocolError::MalformedFrame("bad base64 in client RSA key".into()))?;
        let client_rsa = rsa_kem::public_key_from_der(&client_rsa_der)?;

        let (secret, my_point) = ecdh::generate_keypair();
        self.aes_key = Some(ecdh::derive_session_key(&secret, &client_point)?);
        self.phase = Phase::Secured;

        let wrapped_reply = rsa_kem::oaep_encrypt(&client_rsa, &my_point)?;
        Ok(Envelope::KeyExchange {
            rsa: None,
            key: BASE64.encode(wrapped_reply),
        })
    }

    /// Decrypt the `data` field of an inbound `m` frame.
    pub fn open(&self, data_b64: &str, max_bytes: usize) -> Result<Envelope, ProtocolError> {
        let key = self
            .aes_key
            .as_ref()
            .ok_or(ProtocolError::ProtocolViolation("cipher frame before key exchange"))?;
        codec::open(key, data_b64, max_bytes)
    }

    /// Wrap an inner envelope under this session's key, ready to send.
    pub fn seal(&self, inner: &Envelope) -> Result<Message, ProtocolError> {
        let key = self
            .aes_key
            .as_ref()
            .ok_or(ProtocolError::ProtocolViolation("seal before key exchange"))?;
        let outer = codec::seal(key, inner)?;
        Ok(Message::Text(codec::encode(&outer)?))
    }

    /// Enqueue a frame on this session's outbound queue. A full or closed
    /// queue drops the frame — the writer task owns the socket.
    pub fn send(&self, msg: Message) {
        if let Err(e) = self.outbound.try_send(msg) {
            warn!(client = %self.id, err = %e, "outbound queue rejected frame");
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
