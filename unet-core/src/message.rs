//! NetworkMessage: an owned payload plus where it came from.

use crate::service::ServiceId;

/// Logical destination of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Internal lobby protocol traffic, consumed by the lobby state machine.
    Lobby,
    /// Application channel (0-based, before the physical offset).
    App(u8),
}

/// A complete message handed to application code or to the lobby handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub peer: ServiceId,
    pub channel: Channel,
    pub data: Vec<u8>,
}

impl NetworkMessage {
    pub fn new(peer: ServiceId, channel: Channel, data: Vec<u8>) -> Self {
        Self {
            peer,
            channel,
            data,
        }
    }

    pub fn app_channel(&self) -> Option<u8> {
        match self.channel {
            Channel::App(ch) => Some(ch),
            Channel::Lobby => None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
