//! Channel membership — channel name → set of joined client ids.
//!
//! Names are free-form UTF-8 treated as opaque bytes; matching is exact.
//! Channels are created lazily on first join and destroyed when the last
//! member leaves. Fan-out (re-encrypting per recipient) lives in
//! `RelayState`, which owns both this registry and the session map.

use std::collections::{HashMap, HashSet};

use crate::codec::ClientId;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, HashSet<ClientId>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the client was already a member.
    pub fn add(&mut self, channel: &str, id: ClientId) -> bool {
        self.channels.entry(channel.to_string()).or_default().insert(id)
    }

    /// Removes the member, dropping the channel when it empties.
    pub fn remove(&mut self, channel: &str, id: &ClientId) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    pub fn members(&self, channel: &str) -> impl Iterator<Item = &ClientId> {
        self.channels.get(channel).into_iter().flatten()
    }

    pub fn contains(&self, channel: &str, id: &ClientId) -> bool {
        self.channels.get(channel).is_some_and(|m| m.contains(id))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
