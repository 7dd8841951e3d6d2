//! Lobby: roster, lobby data and the host-authoritative replication protocol.
//!
//! The lobby never touches a transport. Every mutation and every inbound packet returns
//! the [`LobbyAction`]s the caller must carry out (sends, service data publishes, events).

use std::mem;

use tracing::{debug, info, trace, warn};

use crate::data::LobbyDataContainer;
use crate::event::Event;
use crate::file::{LobbyFile, OutgoingFileTransfer};
use crate::identity::Guid;
use crate::member::LobbyMember;
use crate::protocol::{LobbyPacket, MemberRecord, KEY_MAX_PLAYERS, KEY_NAME};
use crate::service::{ServiceId, ServiceKind};
use crate::wire;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LobbyPrivacy {
    #[default]
    Public,
    Private,
}

/// Descriptor of a lobby, as listed or as joined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LobbyInfo {
    pub is_hosting: bool,
    pub privacy: LobbyPrivacy,
    pub max_players: u32,
    pub guid: Guid,
    pub name: String,
    /// At most one per transport kind.
    pub entry_points: Vec<ServiceId>,
}

impl LobbyInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_point(&self, kind: ServiceKind) -> Option<ServiceId> {
        self.entry_points.iter().copied().find(|id| id.kind == kind)
    }

    /// Add or replace the entry point for `id.kind`.
    pub fn add_entry_point(&mut self, id: ServiceId) {
        self.entry_points.retain(|e| e.kind != id.kind);
        self.entry_points.push(id);
    }

    pub fn remove_entry_point(&mut self, kind: ServiceKind) -> bool {
        let before = self.entry_points.len();
        self.entry_points.retain(|e| e.kind != kind);
        self.entry_points.len() != before
    }
}

/// Who a lobby packet goes to. Resolved to transports by the `Context` at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Peer(u8),
    /// The host member, or the lobby host reported by the primary entry point before
    /// the roster is known.
    Host,
    /// Every valid member except ourselves and `except`.
    AllValid { except: Option<u8> },
}

/// Side effect requested by the lobby state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyAction {
    Send { to: Recipient, packet: LobbyPacket },
    /// Mirror a lobby data change into every transport's own key/value store.
    Publish { name: String, value: Option<String> },
    Notify(Event),
    /// The snapshot arrived and the local peer index is known.
    JoinCompleted,
    Kicked { reason: String },
    StartFileTransfer { receiver: u8, filename: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("only the host can do this")]
    NotHost,
    #[error("no member with peer index {0}")]
    UnknownPeer(u8),
    #[error("operation cannot target the local member")]
    LocalPeer,
    #[error("peer {peer} has no file named {filename}")]
    UnknownFile { peer: u8, filename: String },
    #[error("local member is not in the roster yet")]
    NotJoined,
}

pub struct Lobby {
    info: LobbyInfo,
    data: LobbyDataContainer,
    members: Vec<LobbyMember>,
    local_guid: Guid,
    local_peer: Option<u8>,
}

impl Lobby {
    pub fn new(info: LobbyInfo, local_guid: Guid) -> Self {
        Self {
            info,
            data: LobbyDataContainer::new(),
            members: Vec::new(),
            local_guid,
            local_peer: None,
        }
    }

    pub fn info(&self) -> &LobbyInfo {
        &self.info
    }

    pub fn is_hosting(&self) -> bool {
        self.info.is_hosting
    }

    /// A lobby with no entry points left is unreachable.
    pub fn is_connected(&self) -> bool {
        !self.info.entry_points.is_empty()
    }

    pub fn add_entry_point(&mut self, id: ServiceId) {
        self.info.add_entry_point(id);
    }

    pub fn local_guid(&self) -> Guid {
        self.local_guid
    }

    pub fn local_peer(&self) -> Option<u8> {
        self.local_peer
    }

    pub fn data(&self) -> &LobbyDataContainer {
        &self.data
    }

    pub fn members(&self) -> &[LobbyMember] {
        &self.members
    }

    pub fn member(&self, peer: u8) -> Option<&LobbyMember> {
        self.members.iter().find(|m| m.peer == peer)
    }

    fn member_mut(&mut self, peer: u8) -> Option<&mut LobbyMember> {
        self.members.iter_mut().find(|m| m.peer == peer)
    }

    pub fn member_by_guid(&self, guid: Guid) -> Option<&LobbyMember> {
        self.members.iter().find(|m| m.guid == guid)
    }

    pub fn member_by_service_id(&self, id: ServiceId) -> Option<&LobbyMember> {
        self.members.iter().find(|m| m.ids.contains(&id))
    }

    pub fn host_member(&self) -> Option<&LobbyMember> {
        self.member(0)
    }

    pub fn local_member(&self) -> Option<&LobbyMember> {
        self.local_peer.and_then(|peer| self.member(peer))
    }

    /// Smallest peer index not held by any member.
    pub fn next_available_peer(&self) -> Option<u8> {
        (0..=u8::MAX).find(|peer| self.member(*peer).is_none())
    }

    /// Register the hosting process itself. It always lands on peer 0 of a fresh lobby.
    pub fn add_local_member(
        &mut self,
        name: &str,
        primary: Option<ServiceKind>,
        ids: Vec<ServiceId>,
    ) -> Option<u8> {
        let peer = self.next_available_peer()?;
        let mut member = LobbyMember::new(self.local_guid, peer);
        member.valid = true;
        member.name = name.to_string();
        member.primary = primary;
        for id in ids {
            member.add_service_id(id);
        }
        self.members.push(member);
        self.local_peer = Some(peer);
        Some(peer)
    }

    /// Tie transport `id` to the member with `guid`, creating the member if needed.
    pub fn add_member_service(&mut self, guid: Guid, id: ServiceId) -> Vec<LobbyAction> {
        self.register_service(guid, id, None)
    }

    fn register_service(&mut self, guid: Guid, id: ServiceId, peer: Option<u8>) -> Vec<LobbyAction> {
        let mut actions = Vec::new();

        let stale = self
            .members
            .iter()
            .find(|m| m.guid != guid && m.ids.contains(&id))
            .map(|m| m.peer);
        if let Some(stale) = stale {
            warn!(%id, %guid, stale, "service id already belongs to another member, evicting it");
            actions.extend(self.remove_member(stale));
        }

        if let Some(member) = self.members.iter_mut().find(|m| m.guid == guid) {
            if member.add_service_id(id) {
                debug!(peer = member.peer, %id, "member reachable through another service");
                if self.info.is_hosting && member.valid {
                    actions.push(LobbyAction::Send {
                        to: Recipient::AllValid {
                            except: Some(member.peer),
                        },
                        packet: LobbyPacket::MemberNewService { guid, id },
                    });
                }
            }
            return actions;
        }

        let peer = match peer.or_else(|| self.next_available_peer()) {
            Some(peer) => peer,
            None => {
                warn!(%guid, "no free peer index left, ignoring member");
                return actions;
            }
        };
        debug!(peer, %guid, %id, "new member");
        let mut member = LobbyMember::new(guid, peer);
        member.add_service_id(id);
        self.members.push(member);
        actions
    }

    /// A transport reported that `id` left the lobby.
    pub fn remove_member_service(&mut self, id: ServiceId) -> Vec<LobbyAction> {
        let local_peer = self.local_peer;
        let Some(member) = self.members.iter_mut().find(|m| m.ids.contains(&id)) else {
            return Vec::new();
        };
        if Some(member.peer) == local_peer {
            return Vec::new();
        }
        member.remove_service_kind(id.kind);
        if member.ids.is_empty() {
            let peer = member.peer;
            return self.remove_member(peer);
        }
        Vec::new()
    }

    /// Drop a member from the roster. Announced only if it had completed its Hello.
    pub fn remove_member(&mut self, peer: u8) -> Vec<LobbyAction> {
        if Some(peer) == self.local_peer {
            warn!(peer, "refusing to remove the local member");
            return Vec::new();
        }
        let Some(index) = self.members.iter().position(|m| m.peer == peer) else {
            return Vec::new();
        };
        let member = self.members.remove(index);
        if !member.valid {
            return Vec::new();
        }
        info!(peer, name = %member.name, "player left");

        let mut actions = Vec::new();
        if self.info.is_hosting {
            actions.push(LobbyAction::Send {
                to: Recipient::AllValid { except: None },
                packet: LobbyPacket::MemberLeft { guid: member.guid },
            });
        }
        actions.push(LobbyAction::Notify(Event::PlayerLeft {
            peer,
            name: member.name,
        }));
        actions
    }

    /// Forget everything reachable only through `kind`.
    pub fn service_disconnected(&mut self, kind: ServiceKind) -> Vec<LobbyAction> {
        if self.info.remove_entry_point(kind) {
            if self.is_connected() {
                warn!(service = %kind, remaining = self.info.entry_points.len(), "lost connection to entry point");
            } else {
                warn!(service = %kind, "lost connection to all entry points");
            }
        }

        let mut emptied = Vec::new();
        for member in &mut self.members {
            if member.remove_service_kind(kind)
                && member.ids.is_empty()
                && Some(member.peer) != self.local_peer
            {
                emptied.push(member.peer);
            }
        }

        let mut actions = Vec::new();
        for peer in emptied {
            actions.extend(self.remove_member(peer));
        }
        actions
    }

    pub fn set_data(&mut self, name: &str, value: &str) -> Result<Vec<LobbyAction>, LobbyError> {
        if !self.info.is_hosting {
            return Err(LobbyError::NotHost);
        }
        if !self.data.set_data(name, value) {
            return Ok(Vec::new());
        }
        Ok(vec![
            LobbyAction::Publish {
                name: name.to_string(),
                value: Some(value.to_string()),
            },
            LobbyAction::Send {
                to: Recipient::AllValid { except: None },
                packet: LobbyPacket::LobbyData {
                    name: name.to_string(),
                    value: value.to_string(),
                },
            },
        ])
    }

    pub fn remove_data(&mut self, name: &str) -> Result<Vec<LobbyAction>, LobbyError> {
        if !self.info.is_hosting {
            return Err(LobbyError::NotHost);
        }
        if !self.data.remove_data(name) {
            return Ok(Vec::new());
        }
        Ok(vec![
            LobbyAction::Publish {
                name: name.to_string(),
                value: None,
            },
            LobbyAction::Send {
                to: Recipient::AllValid { except: None },
                packet: LobbyPacket::LobbyDataRemoved {
                    name: name.to_string(),
                },
            },
        ])
    }

    pub fn set_name(&mut self, name: &str) -> Result<Vec<LobbyAction>, LobbyError> {
        if !self.info.is_hosting {
            return Err(LobbyError::NotHost);
        }
        self.info.name = name.to_string();
        self.set_data(KEY_NAME, name)
    }

    pub fn set_max_players(&mut self, max_players: u32) -> Result<Vec<LobbyAction>, LobbyError> {
        if !self.info.is_hosting {
            return Err(LobbyError::NotHost);
        }
        self.info.max_players = max_players;
        self.set_data(KEY_MAX_PLAYERS, &max_players.to_string())
    }

    /// Host may change anyone's data; a client only its own, which goes to the host.
    pub fn set_member_data(
        &mut self,
        peer: u8,
        name: &str,
        value: &str,
    ) -> Result<Vec<LobbyAction>, LobbyError> {
        let guid = self.writable_member(peer)?;
        let member = self.member_mut(peer).ok_or(LobbyError::UnknownPeer(peer))?;
        if !member.data.set_data(name, value) {
            return Ok(Vec::new());
        }
        Ok(vec![self.replicate(guid, |guid| LobbyPacket::LobbyMemberData {
            guid,
            name: name.to_string(),
            value: value.to_string(),
        })])
    }

    pub fn remove_member_data(&mut self, peer: u8, name: &str) -> Result<Vec<LobbyAction>, LobbyError> {
        let guid = self.writable_member(peer)?;
        let member = self.member_mut(peer).ok_or(LobbyError::UnknownPeer(peer))?;
        if !member.data.remove_data(name) {
            return Ok(Vec::new());
        }
        Ok(vec![self.replicate(guid, |guid| LobbyPacket::LobbyMemberDataRemoved {
            guid,
            name: name.to_string(),
        })])
    }

    fn writable_member(&self, peer: u8) -> Result<Guid, LobbyError> {
        let local = self.local_peer.ok_or(LobbyError::NotJoined)?;
        if !self.info.is_hosting && peer != local {
            return Err(LobbyError::NotHost);
        }
        self.member(peer)
            .map(|m| m.guid)
            .ok_or(LobbyError::UnknownPeer(peer))
    }

    /// Host broadcasts naming the member; a client sends its own change to the host.
    fn replicate(&self, guid: Guid, packet: impl FnOnce(Option<Guid>) -> LobbyPacket) -> LobbyAction {
        if self.info.is_hosting {
            LobbyAction::Send {
                to: Recipient::AllValid { except: None },
                packet: packet(Some(guid)),
            }
        } else {
            LobbyAction::Send {
                to: Recipient::Host,
                packet: packet(None),
            }
        }
    }

    /// Advertise one of our files to the lobby.
    pub fn add_file(&mut self, file: LobbyFile) -> Result<Vec<LobbyAction>, LobbyError> {
        let local = self.local_peer.ok_or(LobbyError::NotJoined)?;
        let (filename, size, hash) = (file.filename.clone(), file.size, file.hash);
        let member = self.member_mut(local).ok_or(LobbyError::NotJoined)?;
        member.add_file(file);
        Ok(vec![self.replicate(self.local_guid, |guid| LobbyPacket::LobbyFileAdded {
            guid,
            filename,
            size,
            hash,
        })])
    }

    pub fn remove_file(&mut self, filename: &str) -> Result<Vec<LobbyAction>, LobbyError> {
        let local = self.local_peer.ok_or(LobbyError::NotJoined)?;
        let member = self.member_mut(local).ok_or(LobbyError::NotJoined)?;
        if !member.remove_file(filename) {
            return Err(LobbyError::UnknownFile {
                peer: local,
                filename: filename.to_string(),
            });
        }
        Ok(vec![self.replicate(self.local_guid, |guid| LobbyPacket::LobbyFileRemoved {
            guid,
            filename: filename.to_string(),
        })])
    }

    /// Ask `peer` for a file it advertised. Any partial local copy is discarded.
    pub fn request_file(&mut self, peer: u8, filename: &str) -> Result<Vec<LobbyAction>, LobbyError> {
        if Some(peer) == self.local_peer {
            return Err(LobbyError::LocalPeer);
        }
        let member = self.member_mut(peer).ok_or(LobbyError::UnknownPeer(peer))?;
        let file = member.file_mut(filename).ok_or_else(|| LobbyError::UnknownFile {
            peer,
            filename: filename.to_string(),
        })?;
        file.reset();
        Ok(vec![LobbyAction::Send {
            to: Recipient::Peer(peer),
            packet: LobbyPacket::LobbyFileRequested {
                filename: filename.to_string(),
            },
        }])
    }

    /// Push the next chunk of an upload. The transfer is done once `is_finished` holds.
    pub fn advance_transfer(
        &self,
        transfer: &mut OutgoingFileTransfer,
        chunk_size: usize,
    ) -> Result<Vec<LobbyAction>, LobbyError> {
        let local = self.local_member().ok_or(LobbyError::NotJoined)?;
        let file = local.file(&transfer.filename).ok_or_else(|| LobbyError::UnknownFile {
            peer: local.peer,
            filename: transfer.filename.clone(),
        })?;
        if self.member(transfer.receiver).is_none() {
            return Err(LobbyError::UnknownPeer(transfer.receiver));
        }

        let content = file.data();
        let start = (transfer.sent as usize).min(content.len());
        let end = start.saturating_add(chunk_size.max(1)).min(content.len());
        transfer.sent = end as u64;
        transfer.size = file.size;

        let mut actions = vec![
            LobbyAction::Send {
                to: Recipient::Peer(transfer.receiver),
                packet: LobbyPacket::LobbyFileData {
                    filename: transfer.filename.clone(),
                    offset: start as u64,
                    data: content[start..end].to_vec(),
                },
            },
            LobbyAction::Notify(Event::FileSendProgress {
                receiver: transfer.receiver,
                filename: transfer.filename.clone(),
                sent: transfer.sent,
                size: transfer.size,
            }),
        ];
        if transfer.is_finished() {
            actions.push(LobbyAction::Notify(Event::FileSendFinished {
                receiver: transfer.receiver,
                filename: transfer.filename.clone(),
            }));
        }
        Ok(actions)
    }

    pub fn chat(&self, text: &str) -> Vec<LobbyAction> {
        vec![self.replicate(self.local_guid, |guid| LobbyPacket::LobbyChat {
            guid,
            text: text.to_string(),
        })]
    }

    pub fn kick(&self, peer: u8, reason: &str) -> Result<Vec<LobbyAction>, LobbyError> {
        if !self.info.is_hosting {
            return Err(LobbyError::NotHost);
        }
        if Some(peer) == self.local_peer {
            return Err(LobbyError::LocalPeer);
        }
        self.member(peer).ok_or(LobbyError::UnknownPeer(peer))?;
        Ok(vec![LobbyAction::Send {
            to: Recipient::Peer(peer),
            packet: LobbyPacket::MemberKick {
                reason: reason.to_string(),
            },
        }])
    }

    /// Decode and process one packet from the lobby channel. Undecodable input is dropped.
    pub fn handle_message(&mut self, from: ServiceId, bytes: &[u8]) -> Vec<LobbyAction> {
        match wire::decode_packet(bytes) {
            Ok(packet) => self.handle_packet(from, packet),
            Err(e) => {
                warn!(%from, error = %e, "dropping undecodable lobby packet");
                Vec::new()
            }
        }
    }

    pub fn handle_packet(&mut self, from: ServiceId, packet: LobbyPacket) -> Vec<LobbyAction> {
        trace!(%from, packet = packet.name(), "lobby packet");

        let packet = match packet {
            LobbyPacket::Handshake { guid } => {
                if !self.info.is_hosting {
                    warn!(%from, "handshake received while not hosting");
                    return Vec::new();
                }
                return self.add_member_service(guid, from);
            }
            LobbyPacket::LobbyInfo { data, members } => {
                if self.info.is_hosting {
                    warn!(%from, "lobby snapshot received while hosting");
                    return Vec::new();
                }
                return self.apply_snapshot(&data, &members);
            }
            other => other,
        };

        let Some(sender) = self.member_by_service_id(from).map(|m| m.peer) else {
            warn!(%from, packet = packet.name(), "lobby packet from unknown peer");
            return Vec::new();
        };

        match packet {
            LobbyPacket::Hello { name } => self.on_hello(sender, from.kind, name),
            LobbyPacket::MemberInfo { member } => {
                if !self.from_host(sender, "member-info") {
                    return Vec::new();
                }
                self.apply_member_record(&member, true)
            }
            LobbyPacket::MemberLeft { guid } => {
                if !self.from_host(sender, "member-left") || guid == self.local_guid {
                    return Vec::new();
                }
                match self.member_by_guid(guid).map(|m| m.peer) {
                    Some(peer) => self.remove_member(peer),
                    None => Vec::new(),
                }
            }
            LobbyPacket::MemberKick { reason } => {
                if !self.from_host(sender, "member-kick") {
                    return Vec::new();
                }
                info!(%reason, "kicked from lobby");
                vec![LobbyAction::Kicked { reason }]
            }
            LobbyPacket::MemberNewService { guid, id } => {
                if !self.from_host(sender, "member-new-service") {
                    return Vec::new();
                }
                if let Some(member) = self.members.iter_mut().find(|m| m.guid == guid) {
                    member.add_service_id(id);
                }
                Vec::new()
            }
            LobbyPacket::LobbyData { name, value } => {
                if !self.from_host(sender, "lobby-data") {
                    return Vec::new();
                }
                self.apply_lobby_data(name, value)
            }
            LobbyPacket::LobbyDataRemoved { name } => {
                if !self.from_host(sender, "lobby-data-removed") || !self.data.remove_data(&name) {
                    return Vec::new();
                }
                vec![LobbyAction::Notify(Event::LobbyDataChanged { name })]
            }
            LobbyPacket::LobbyMemberData { guid, name, value } => {
                let Some(target) = self.resolve_target(sender, guid) else {
                    return Vec::new();
                };
                let Some(member) = self.member_mut(target) else {
                    return Vec::new();
                };
                if !member.data.set_data(&name, &value) {
                    return Vec::new();
                }
                let guid = member.guid;
                let mut actions = self.rebroadcast(sender, LobbyPacket::LobbyMemberData {
                    guid: Some(guid),
                    name: name.clone(),
                    value,
                });
                actions.push(LobbyAction::Notify(Event::MemberDataChanged { peer: target, name }));
                actions
            }
            LobbyPacket::LobbyMemberDataRemoved { guid, name } => {
                let Some(target) = self.resolve_target(sender, guid) else {
                    return Vec::new();
                };
                let Some(member) = self.member_mut(target) else {
                    return Vec::new();
                };
                if !member.data.remove_data(&name) {
                    return Vec::new();
                }
                let guid = member.guid;
                let mut actions = self.rebroadcast(sender, LobbyPacket::LobbyMemberDataRemoved {
                    guid: Some(guid),
                    name: name.clone(),
                });
                actions.push(LobbyAction::Notify(Event::MemberDataChanged { peer: target, name }));
                actions
            }
            LobbyPacket::LobbyFileAdded {
                guid,
                filename,
                size,
                hash,
            } => {
                let Some(target) = self.resolve_target(sender, guid) else {
                    return Vec::new();
                };
                let Some(member) = self.member_mut(target) else {
                    return Vec::new();
                };
                member.add_file(LobbyFile::advertised(filename.clone(), size, hash));
                let guid = member.guid;
                let mut actions = self.rebroadcast(sender, LobbyPacket::LobbyFileAdded {
                    guid: Some(guid),
                    filename: filename.clone(),
                    size,
                    hash,
                });
                actions.push(LobbyAction::Notify(Event::FileAdded { peer: target, filename }));
                actions
            }
            LobbyPacket::LobbyFileRemoved { guid, filename } => {
                let Some(target) = self.resolve_target(sender, guid) else {
                    return Vec::new();
                };
                let Some(member) = self.member_mut(target) else {
                    return Vec::new();
                };
                if !member.remove_file(&filename) {
                    return Vec::new();
                }
                let guid = member.guid;
                let mut actions = self.rebroadcast(sender, LobbyPacket::LobbyFileRemoved {
                    guid: Some(guid),
                    filename: filename.clone(),
                });
                actions.push(LobbyAction::Notify(Event::FileRemoved { peer: target, filename }));
                actions
            }
            LobbyPacket::LobbyFileRequested { filename } => {
                let owned = self
                    .local_member()
                    .and_then(|m| m.file(&filename))
                    .is_some();
                if !owned {
                    warn!(sender, %filename, "request for a file we do not have");
                    return Vec::new();
                }
                vec![
                    LobbyAction::Notify(Event::FileRequested {
                        receiver: sender,
                        filename: filename.clone(),
                    }),
                    LobbyAction::StartFileTransfer {
                        receiver: sender,
                        filename,
                    },
                ]
            }
            LobbyPacket::LobbyFileData {
                filename,
                offset,
                data,
            } => self.on_file_data(sender, filename, offset, &data),
            LobbyPacket::LobbyChat { guid, text } => {
                let Some(target) = self.resolve_target(sender, guid) else {
                    return Vec::new();
                };
                let Some(member) = self.member(target) else {
                    return Vec::new();
                };
                let guid = member.guid;
                let mut actions = self.rebroadcast(sender, LobbyPacket::LobbyChat {
                    guid: Some(guid),
                    text: text.clone(),
                });
                actions.push(LobbyAction::Notify(Event::Chat { peer: target, text }));
                actions
            }
            LobbyPacket::Handshake { .. } | LobbyPacket::LobbyInfo { .. } => Vec::new(),
        }
    }

    fn on_hello(&mut self, sender: u8, via: ServiceKind, name: String) -> Vec<LobbyAction> {
        if !self.info.is_hosting {
            warn!(sender, "hello received while not hosting");
            return Vec::new();
        }
        let Some(member) = self.member_mut(sender) else {
            return Vec::new();
        };
        if member.valid {
            debug!(sender, "duplicate hello ignored");
            return Vec::new();
        }
        member.name = name.clone();
        member.primary = Some(via);
        member.valid = true;
        let record = member.to_record();
        info!(peer = sender, %name, service = %via, "player joined");

        let members = self
            .members
            .iter()
            .filter(|m| m.valid)
            .map(LobbyMember::to_record)
            .collect();
        vec![
            LobbyAction::Send {
                to: Recipient::Peer(sender),
                packet: LobbyPacket::LobbyInfo {
                    data: self.data.serialize_data(),
                    members,
                },
            },
            LobbyAction::Send {
                to: Recipient::AllValid {
                    except: Some(sender),
                },
                packet: LobbyPacket::MemberInfo { member: record },
            },
            LobbyAction::Notify(Event::PlayerJoined { peer: sender, name }),
        ]
    }

    fn on_file_data(&mut self, sender: u8, filename: String, offset: u64, data: &[u8]) -> Vec<LobbyAction> {
        let Some(file) = self
            .member_mut(sender)
            .and_then(|m| m.file_mut(&filename))
        else {
            warn!(sender, %filename, "file data for an unknown file");
            return Vec::new();
        };
        // Left over from an upload that was restarted.
        if offset != file.available() {
            debug!(sender, %filename, offset, have = file.available(), "dropping stale file data");
            return Vec::new();
        }
        if let Err(e) = file.append(data) {
            warn!(sender, error = %e, "dropping file data");
            return Vec::new();
        }
        let (received, size) = (file.available(), file.size);
        let mut actions = vec![LobbyAction::Notify(Event::FileReceiveProgress {
            sender,
            filename: filename.clone(),
            received,
            size,
        })];
        if file.is_complete() {
            let valid = file.is_valid();
            if !valid {
                warn!(sender, %filename, "received file does not match its digest");
            }
            actions.push(LobbyAction::Notify(Event::FileReceiveFinished {
                sender,
                filename,
                valid,
            }));
        }
        actions
    }

    /// Client-bound packets are only accepted from the host.
    fn from_host(&self, sender: u8, what: &str) -> bool {
        if self.info.is_hosting || sender != 0 {
            warn!(sender, packet = what, "ignoring host-only packet");
            return false;
        }
        true
    }

    /// Member a member-scoped packet applies to. The host only accepts a member's own
    /// changes; clients accept changes about anyone from the host.
    fn resolve_target(&self, sender: u8, guid: Option<Guid>) -> Option<u8> {
        let Some(guid) = guid else {
            return Some(sender);
        };
        let target = self.member_by_guid(guid)?.peer;
        if target != sender && (self.info.is_hosting || sender != 0) {
            warn!(sender, target, "member may only change its own state");
            return None;
        }
        Some(target)
    }

    /// Host forwards a member's change to everybody else. Clients do nothing.
    fn rebroadcast(&self, sender: u8, packet: LobbyPacket) -> Vec<LobbyAction> {
        if !self.info.is_hosting {
            return Vec::new();
        }
        vec![LobbyAction::Send {
            to: Recipient::AllValid {
                except: Some(sender),
            },
            packet,
        }]
    }

    fn apply_snapshot(
        &mut self,
        data: &std::collections::BTreeMap<String, String>,
        members: &[MemberRecord],
    ) -> Vec<LobbyAction> {
        self.data.deserialize_data(data);
        if let Some(name) = self.data.get_data(KEY_NAME) {
            self.info.name = name.to_string();
        }
        if let Some(max) = self.data.get_data(KEY_MAX_PLAYERS).and_then(|v| v.parse().ok()) {
            self.info.max_players = max;
        }

        let mut actions = Vec::new();
        for record in members {
            actions.extend(self.apply_member_record(record, false));
        }

        match self.member_by_guid(self.local_guid).map(|m| m.peer) {
            Some(peer) => {
                self.local_peer = Some(peer);
                debug!(peer, members = self.members.len(), "lobby snapshot applied");
                actions.push(LobbyAction::JoinCompleted);
            }
            None => warn!("lobby snapshot does not contain the local member"),
        }
        actions
    }

    /// Replay a member record: register its ids as if handshaken, then apply its fields.
    fn apply_member_record(&mut self, record: &MemberRecord, notify: bool) -> Vec<LobbyAction> {
        let mut actions = Vec::new();

        let squatter = self
            .member(record.peer)
            .filter(|m| m.guid != record.guid)
            .map(|m| m.peer);
        if let Some(squatter) = squatter {
            actions.extend(self.remove_member(squatter));
        }

        for id in &record.ids {
            actions.extend(self.register_service(record.guid, *id, Some(record.peer)));
        }
        if record.ids.is_empty() && self.member_by_guid(record.guid).is_none() {
            self.members.push(LobbyMember::new(record.guid, record.peer));
        }

        let local_guid = self.local_guid;
        let Some(member) = self.members.iter_mut().find(|m| m.guid == record.guid) else {
            return actions;
        };
        let was_valid = member.valid;
        member.apply_record(record);
        if notify && !was_valid && record.guid != local_guid {
            info!(peer = record.peer, name = %record.name, "player joined");
            actions.push(LobbyAction::Notify(Event::PlayerJoined {
                peer: record.peer,
                name: record.name.clone(),
            }));
        }
        actions
    }

    fn apply_lobby_data(&mut self, name: String, value: String) -> Vec<LobbyAction> {
        if !self.data.set_data(&name, &value) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        match name.as_str() {
            KEY_NAME => {
                let old = mem::replace(&mut self.info.name, value.clone());
                if old != value {
                    actions.push(LobbyAction::Notify(Event::LobbyNameChanged { old, new: value }));
                }
            }
            KEY_MAX_PLAYERS => match value.parse::<u32>() {
                Ok(new) => {
                    let old = mem::replace(&mut self.info.max_players, new);
                    if old != new {
                        actions.push(LobbyAction::Notify(Event::LobbyMaxPlayersChanged { old, new }));
                    }
                }
                Err(_) => warn!(%value, "invalid max players value"),
            },
            _ => {}
        }
        actions.insert(0, LobbyAction::Notify(Event::LobbyDataChanged { name }));
        actions
    }
}
