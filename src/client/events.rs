//! The client's event stream.
//!
//! One sum type delivered on an mpsc channel replaces the callback set of
//! the original (`onServerSecured`, `onClientList`, `onClientLeft`,
//! `onClientMessage`) — the consumer matches exhaustively, and the
//! two-frame list warmup is an explicit state inside `ChatClient` rather
//! than a convention every callback must remember.

use crate::codec::{ChatPayload, ClientId};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Outer handshake complete; the relay assigned us `client_id`.
    Secured { client_id: ClientId },

    /// A peer appeared in the channel list (suppressed during warmup).
    PeerJoined { id: ClientId, user_name: String },

    /// A peer disappeared from the channel list (suppressed during warmup).
    PeerLeft { id: ClientId, user_name: String },

    /// A decrypted chat payload from an established peer.
    Message {
        from: ClientId,
        from_name: String,
        payload: ChatPayload,
    },

    /// The transport closed; reconnecting is the consumer's call.
    Closed,
}
