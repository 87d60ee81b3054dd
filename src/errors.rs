//! Protocol error taxonomy.
//!
//! Every variant except the client-side ChaCha20 drop case is fatal to the
//! session: the transport is closed and the peer must reconnect and
//! re-handshake. Dispositions:
//!
//!   `MalformedFrame`    — bad JSON, bad base64, missing field, oversized
//!                         frame: close transport.
//!   `ProtocolViolation` — envelope out of sequence for the session state:
//!                         close transport.
//!   `BadCipher`         — AES or RSA decryption failure on the relay: close
//!                         transport. (ChaCha20 failures on the client never
//!                         surface as this — a wrong-password peer produces
//!                         garbage plaintext, which is logged and dropped.)
//!
//! Unknown unicast targets are a silent drop, not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("cipher failure: {0}")]
    BadCipher(&'static str),
}
