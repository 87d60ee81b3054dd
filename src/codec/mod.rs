//! Wire codec — envelopes exchanged between clients and the relay.
//!
//! Every frame on the transport is one JSON object with a single-letter
//! `action` tag. Binary fields (key material, ciphertexts) are standard
//! base64. Tags:
//!
//!   `s` — server hello (relay → client, clear): `client_id`, relay RSA
//!         public key (DER, base64).
//!   `e` — key exchange (both directions, clear): the client sends its own
//!         RSA public key in the clear plus its P-384 point OAEP-encrypted
//!         under the relay key; the relay answers with its P-384 point
//!         OAEP-encrypted under the client key.
//!   `m` — cipher frame: base64(IV ‖ AES-256-CBC ciphertext) of an inner
//!         envelope. Every post-handshake envelope rides inside one.
//!   `j` — join: `user_name`, `channel`.
//!   `c` — client-addressed payload with a `target` id (peer key exchange
//!         or private chat). The relay copies `data` verbatim.
//!   `w` — channel broadcast carrying a per-recipient ciphertext map.
//!   `l` — membership list (relay → client).
//!
//! Anything else — unknown tag, missing field, bad base64, or a frame over
//! the configured size cap — fails the envelope with `MalformedFrame` and
//! the receiver closes the transport.

use std::collections::HashMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::aes;
use crate::errors::ProtocolError;

// ─── Client identifiers ──────────────────────────────────────────────────────

/// Opaque 16-byte random identifier, hex-encoded (32 chars) on the wire.
/// Unique within a relay lifetime with overwhelming probability.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ClientId([u8; 16]);

impl ClientId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let raw = hex::decode(s)
            .map_err(|_| ProtocolError::MalformedFrame(format!("bad client id: {s:?}")))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| ProtocolError::MalformedFrame(format!("bad client id length: {s:?}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ClientId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─── Envelopes ───────────────────────────────────────────────────────────────

/// One entry of a membership list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub client_id: ClientId,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Envelope {
    /// Relay announces the session id and its RSA public key.
    #[serde(rename = "s")]
    ServerHello { client_id: ClientId, key: String },

    /// ECDH public point exchange. `rsa` is present only client → relay.
    #[serde(rename = "e")]
    KeyExchange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rsa: Option<String>,
        key: String,
    },

    /// AES-wrapped inner envelope: base64(IV ‖ ciphertext).
    #[serde(rename = "m")]
    Cipher { data: String },

    /// Join a channel. First inner envelope after the handshake.
    #[serde(rename = "j")]
    Join { user_name: String, channel: String },

    /// Peer-addressed payload. `client_id`/`user_name` are filled in by the
    /// relay from the sender's session; `data` is copied verbatim.
    #[serde(rename = "c")]
    Direct {
        target: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        data: serde_json::Value,
    },

    /// Channel broadcast. `data` maps recipient id → base64 ciphertext;
    /// each recipient selects its own entry. Copied verbatim by the relay.
    #[serde(rename = "w")]
    Broadcast {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        data: HashMap<ClientId, String>,
    },

    /// Current channel membership.
    #[serde(rename = "l")]
    List { clients: Vec<Member> },
}

pub fn encode(env: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(env).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

pub fn decode(raw: &[u8], max_bytes: usize) -> Result<Envelope, ProtocolError> {
    if raw.len() > max_bytes {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame of {} bytes exceeds cap of {max_bytes}",
            raw.len()
        )));
    }
    serde_json::from_slice(raw).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

// ─── Outer AES layer ─────────────────────────────────────────────────────────

/// Wrap an inner envelope for a `Secured` session: encode, AES-256-CBC under
/// the session key with a fresh IV, base64 into an `m` frame.
pub fn seal(aes_key: &[u8; 32], inner: &Envelope) -> Result<Envelope, ProtocolError> {
    let plaintext = encode(inner)?;
    let ciphertext = aes::encrypt(aes_key, plaintext.as_bytes());
    Ok(Envelope::Cipher {
        data: BASE64.encode(ciphertext),
    })
}

/// Unwrap the `data` field of an `m` frame back into the inner envelope.
pub fn open(aes_key: &[u8; 32], data_b64: &str, max_bytes: usize) -> Result<Envelope, ProtocolError> {
    let raw = BASE64
        .decode(data_b64)
        .map_err(|_| ProtocolError::MalformedFrame("bad base64 in cipher frame".into()))?;
    let plaintext = aes::decrypt(aes_key, &raw)?;
    decode(&plaintext, max_bytes)
}

// ─── Chat payloads (inner layer plaintext) ───────────────────────────────────

const PRIVATE_SUFFIX: &str = "_private";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Image,
    FileStart,
    FileVolume,
    FileEnd,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Text => "text",
            PayloadKind::Image => "image",
            PayloadKind::FileStart => "file_start",
            PayloadKind::FileVolume => "file_volume",
            PayloadKind::FileEnd => "file_end",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(PayloadKind::Text),
            "image" => Some(PayloadKind::Image),
            "file_start" => Some(PayloadKind::FileStart),
            "file_volume" => Some(PayloadKind::FileVolume),
            "file_end" => Some(PayloadKind::FileEnd),
            _ => None,
        }
    }
}

/// The plaintext a client ChaCha20-encrypts for each peer. `data` is opaque
/// to everything below the chat layer: UTF-8 text, a base64 chunk, or a file
/// descriptor — the codec never parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ChatPayload {
    pub fn new(kind: PayloadKind, private: bool, data: String, user_name: String) -> Self {
        let kind = if private {
            format!("{}{PRIVATE_SUFFIX}", kind.as_str())
        } else {
            kind.as_str().to_string()
        };
        Self {
            kind,
            data,
            user_name: Some(user_name),
            client_id: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis() as u64),
        }
    }

    /// Split the wire `type` into its base kind and the `_private` marker.
    pub fn split_kind(&self) -> Option<(PayloadKind, bool)> {
        match self.kind.strip_suffix(PRIVATE_SUFFIX) {
            Some(base) => PayloadKind::from_str(base).map(|k| (k, true)),
            None => PayloadKind::from_str(&self.kind).map(|k| (k, false)),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 512 * 1024;

    #[test]
    fn client_id_hex_round_trip() {
        let id = ClientId::random();
        let parsed = ClientId::from_hex(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), 32);
    }

    #[test]
    fn client_id_rejects_bad_hex() {
        assert!(ClientId::from_hex("zz").is_err());
        assert!(ClientId::from_hex("aabb").is_err()); // wrong length
    }

    #[test]
    fn envelope_round_trip_all_tags() {
        let id = ClientId::random();
        let envs = vec![
            Envelope::ServerHello {
                client_id: id,
                key: "AAEC".into(),
            },
            Envelope::KeyExchange {
                rsa: Some("cg==".into()),
                key: "aw==".into(),
            },
            Envelope::Cipher { data: "bQ==".into() },
            Envelope::Join {
                user_name: "alice".into(),
                channel: "#test".into(),
            },
            Envelope::Direct {
                target: id,
                client_id: None,
                user_name: None,
                data: serde_json::json!({"pub": "cA=="}),
            },
            Envelope::Broadcast {
                client_id: Some(id),
                user_name: Some("alice".into()),
                data: HashMap::from([(id, "Y3Q=".to_string())]),
            },
            Envelope::List {
                clients: vec![Member {
                    client_id: id,
                    user_name: "alice".into(),
                }],
            },
        ];
        for env in envs {
            let text = encode(&env).unwrap();
            let back = decode(text.as_bytes(), MAX).unwrap();
            assert_eq!(encode(&back).unwrap(), text);
        }
    }

    #[test]
    fn unknown_action_is_malformed() {
        let err = decode(br#"{"action":"z"}"#, MAX).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = decode(br#"{"action":"j","user_name":"alice"}"#, MAX).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let big = format!(
            r##"{{"action":"j","user_name":"{}","channel":"#t"}}"##,
            "x".repeat(128)
        );
        let err = decode(big.as_bytes(), 64).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame(_)));
    }

    #[test]
    fn seal_open_round_trip() {
        let key = [7u8; 32];
        let inner = Envelope::Join {
            user_name: "alice".into(),
            channel: "#test".into(),
        };
        let sealed = seal(&key, &inner).unwrap();
        let Envelope::Cipher { data } = &sealed else {
            panic!("seal must produce a cipher frame");
        };
        let opened = open(&key, data, MAX).unwrap();
        assert_eq!(encode(&opened).unwrap(), encode(&inner).unwrap());
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let inner = Envelope::Join {
            user_name: "alice".into(),
            channel: "#test".into(),
        };
        let sealed = seal(&[7u8; 32], &inner).unwrap();
        let Envelope::Cipher { data } = sealed else {
            unreachable!()
        };
        assert!(open(&[8u8; 32], &data, MAX).is_err());
    }

    #[test]
    fn payload_private_suffix() {
        let p = ChatPayload::new(PayloadKind::Text, true, "hi".into(), "alice".into());
        assert_eq!(p.kind, "text_private");
        assert_eq!(p.split_kind(), Some((PayloadKind::Text, true)));

        let p = ChatPayload::new(PayloadKind::FileVolume, false, "AAA=".into(), "bob".into());
        assert_eq!(p.split_kind(), Some((PayloadKind::FileVolume, false)));

        let unknown = ChatPayload {
            kind: "sticker".into(),
            data: String::new(),
            user_name: None,
            client_id: None,
            timestamp: None,
        };
        assert_eq!(unknown.split_kind(), None);
    }

    proptest::proptest! {
        #[test]
        fn join_round_trips(user in "\\PC{0,40}", channel in "\\PC{0,40}") {
            let env = Envelope::Join { user_name: user, channel };
            let text = encode(&env).unwrap();
            let back = decode(text.as_bytes(), MAX).unwrap();
            proptest::prop_assert_eq!(encode(&back).unwrap(), text);
        }
    }
}
