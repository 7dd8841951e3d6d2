//! Lobby wire protocol: internal packet types and channel layout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::Guid;
use crate::integrity::FileHash;
use crate::service::{ServiceId, ServiceKind};

/// Physical channel carrying internal lobby protocol packets.
pub const LOBBY_CHANNEL: u8 = 0;
/// Physical channel carrying relay traffic through the host.
pub const RELAY_CHANNEL: u8 = 1;
/// Application channel `n` travels on physical channel `n + APP_CHANNEL_OFFSET`.
pub const APP_CHANNEL_OFFSET: u8 = 2;
/// Channel byte inside a relay frame marking an internal lobby packet.
pub const RELAY_INTERNAL_CHANNEL: u8 = 0xff;

/// Largest usable application channel count.
pub const MAX_APP_CHANNELS: u8 = RELAY_INTERNAL_CHANNEL - APP_CHANNEL_OFFSET;

/// Lobby data keys the library itself reads and writes.
pub const KEY_GUID: &str = "unet-guid";
pub const KEY_NAME: &str = "unet-name";
pub const KEY_MAX_PLAYERS: &str = "unet-maxplayers";

pub fn app_to_physical(channel: u8) -> u8 {
    channel.saturating_add(APP_CHANNEL_OFFSET)
}

/// Application channel for a physical channel, None for the reserved ones.
pub fn physical_to_app(channel: u8) -> Option<u8> {
    channel.checked_sub(APP_CHANNEL_OFFSET)
}

/// Advertised file, as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    pub hash: FileHash,
}

/// Serialized member, as carried in snapshots and `MemberInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub guid: Guid,
    pub peer: u8,
    pub primary: Option<ServiceKind>,
    pub name: String,
    pub ids: Vec<ServiceId>,
    pub data: BTreeMap<String, String>,
    pub files: Vec<FileRecord>,
}

/// Every packet exchanged on the lobby channel.
///
/// `guid: None` on member-scoped packets means "the sender itself"; the host
/// fills it in before rebroadcasting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyPacket {
    /// Sent once per transport on join so the host can tie the transport id to a member.
    Handshake { guid: Guid },
    /// Sent once over the joining member's primary transport after the handshakes.
    Hello { name: String },
    /// Full snapshot sent by the host to a member that just completed Hello.
    LobbyInfo {
        data: BTreeMap<String, String>,
        members: Vec<MemberRecord>,
    },
    MemberInfo { member: MemberRecord },
    MemberLeft { guid: Guid },
    MemberKick { reason: String },
    MemberNewService { guid: Guid, id: ServiceId },
    LobbyData { name: String, value: String },
    LobbyDataRemoved { name: String },
    LobbyMemberData {
        guid: Option<Guid>,
        name: String,
        value: String,
    },
    LobbyMemberDataRemoved { guid: Option<Guid>, name: String },
    LobbyFileAdded {
        guid: Option<Guid>,
        filename: String,
        size: u64,
        hash: FileHash,
    },
    LobbyFileRemoved { guid: Option<Guid>, filename: String },
    LobbyFileRequested { filename: String },
    LobbyFileData {
        filename: String,
        offset: u64,
        data: Vec<u8>,
    },
    LobbyChat { guid: Option<Guid>, text: String },
}

impl LobbyPacket {
    /// Short tag for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            LobbyPacket::Handshake { .. } => "handshake",
            LobbyPacket::Hello { .. } => "hello",
            LobbyPacket::LobbyInfo { .. } => "lobby-info",
            LobbyPacket::MemberInfo { .. } => "member-info",
            LobbyPacket::MemberLeft { .. } => "member-left",
            LobbyPacket::MemberKick { .. } => "member-kick",
            LobbyPacket::MemberNewService { .. } => "member-new-service",
            LobbyPacket::LobbyData { .. } => "lobby-data",
            LobbyPacket::LobbyDataRemoved { .. } => "lobby-data-removed",
            LobbyPacket::LobbyMemberData { .. } => "lobby-member-data",
            LobbyPacket::LobbyMemberDataRemoved { .. } => "lobby-member-data-removed",
            LobbyPacket::LobbyFileAdded { .. } => "lobby-file-added",
            LobbyPacket::LobbyFileRemoved { .. } => "lobby-file-removed",
            LobbyPacket::LobbyFileRequested { .. } => "lobby-file-requested",
            LobbyPacket::LobbyFileData { .. } => "lobby-file-data",
            LobbyPacket::LobbyChat { .. } => "lobby-chat",
        }
    }
}
