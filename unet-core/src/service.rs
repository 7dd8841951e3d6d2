//! Transport Service boundary: the interface every matchmaking/transport backend implements.
//!
//! Backends are poll-driven. Requests (`create_lobby`, `join_lobby`, ...) return immediately;
//! their completions come back as [`ServiceEvent`]s from [`Service::run_callbacks`], which
//! the `Context` calls once per tick. Nothing here blocks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::LobbyData;
use crate::lobby::LobbyPrivacy;

/// Which backend a `ServiceId` belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    Steam,
    Galaxy,
    Enet,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Steam, ServiceKind::Galaxy, ServiceKind::Enet];

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Steam => "steam",
            ServiceKind::Galaxy => "galaxy",
            ServiceKind::Enet => "enet",
        }
    }

    /// Look up a kind by its lowercase name. Returns None for unknown names.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque backend identifier scoped to one transport: a lobby, a user or a host.
/// Absence is expressed as `Option<ServiceId>`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub kind: ServiceKind,
    pub id: u64,
}

impl ServiceId {
    pub fn new(kind: ServiceKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.kind, self.id)
    }
}

/// Delivery class for a packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Reliable,
    Unreliable,
}

impl PacketType {
    pub fn to_byte(self) -> u8 {
        match self {
            PacketType::Reliable => 0,
            PacketType::Unreliable => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::Reliable),
            1 => Some(PacketType::Unreliable),
            _ => None,
        }
    }
}

/// Failure reported by a backend for one request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("service is unavailable")]
    Unavailable,
    #[error("lobby not found")]
    LobbyNotFound,
    #[error("lobby is full")]
    LobbyFull,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Completion or notification raised by a backend during `run_callbacks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// `create_lobby` finished; Ok carries the new lobby's entry point.
    LobbyCreated(Result<ServiceId, ServiceError>),
    /// `get_lobby_list` finished; Ok carries the lobby ids this backend knows.
    LobbyList(Result<Vec<ServiceId>, ServiceError>),
    /// `join_lobby` finished; Ok carries the joined lobby's entry point.
    LobbyJoined(Result<ServiceId, ServiceError>),
    /// `leave_lobby` finished.
    LobbyLeft(Result<(), ServiceError>),
    /// A remote member's identity on this transport disconnected from the lobby.
    PeerLeft(ServiceId),
    /// The lobby is no longer reachable through this transport.
    LobbyLost,
}

/// One matchmaking/transport backend.
///
/// Channel numbers passed to `send_packet`/`read_packet` are physical: the
/// `Context` reserves 0 for the lobby protocol and 1 for relay traffic and
/// offsets application channels by 2.
pub trait Service {
    fn kind(&self) -> ServiceKind;

    /// This process's identity on the backend.
    fn user_id(&self) -> ServiceId;
    fn user_name(&self) -> String;

    /// Largest reliable packet the backend carries in one unit; 0 means unlimited.
    fn reliable_packet_limit(&self) -> usize;

    /// Pump the backend and return everything that completed since the last call.
    fn run_callbacks(&mut self) -> Vec<ServiceEvent>;

    fn create_lobby(&mut self, privacy: LobbyPrivacy, max_players: u32);
    fn get_lobby_list(&mut self);
    fn join_lobby(&mut self, lobby: ServiceId);
    fn leave_lobby(&mut self);

    fn lobby_max_players(&self, lobby: ServiceId) -> u32;
    fn lobby_host(&self, lobby: ServiceId) -> Option<ServiceId>;

    fn lobby_data(&self, lobby: ServiceId, name: &str) -> Option<String>;
    fn lobby_data_count(&self, lobby: ServiceId) -> usize;
    fn lobby_data_at(&self, lobby: ServiceId, index: usize) -> Option<LobbyData>;
    fn set_lobby_data(&mut self, lobby: ServiceId, name: &str, value: &str);
    fn remove_lobby_data(&mut self, lobby: ServiceId, name: &str);

    fn send_packet(&mut self, peer: ServiceId, data: &[u8], packet_type: PacketType, channel: u8);
    /// Pop the next packet waiting on `channel`, with its sender.
    fn read_packet(&mut self, channel: u8) -> Option<(ServiceId, Vec<u8>)>;
    /// Size of the next packet waiting on `channel`, if any.
    fn is_packet_available(&self, channel: u8) -> Option<usize>;

    /// Drop this backend's connectivity as if the platform went down. Test hook.
    fn simulate_outage(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_roundtrip() {
        for kind in ServiceKind::ALL {
            assert_eq!(ServiceKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ServiceKind::from_name("none"), None);
    }

    #[test]
    fn service_id_equality_is_pairwise() {
        let a = ServiceId::new(ServiceKind::Steam, 7);
        assert_eq!(a, ServiceId::new(ServiceKind::Steam, 7));
        assert_ne!(a, ServiceId::new(ServiceKind::Galaxy, 7));
        assert_ne!(a, ServiceId::new(ServiceKind::Steam, 8));
    }

    #[test]
    fn packet_type_byte_roundtrip() {
        assert_eq!(PacketType::from_byte(PacketType::Reliable.to_byte()), Some(PacketType::Reliable));
        assert_eq!(PacketType::from_byte(PacketType::Unreliable.to_byte()), Some(PacketType::Unreliable));
        assert_eq!(PacketType::from_byte(9), None);
    }
}
