//! LobbyMember: one participant in a lobby, reachable through one or more transports.

use crate::data::LobbyDataContainer;
use crate::file::LobbyFile;
use crate::identity::Guid;
use crate::protocol::MemberRecord;
use crate::service::{ServiceId, ServiceKind};

#[derive(Debug, Clone, PartialEq)]
pub struct LobbyMember {
    pub guid: Guid,
    /// Dense per-lobby index; the host is always 0.
    pub peer: u8,
    /// False until the member's Hello arrived. Host-side only concern.
    pub valid: bool,
    /// Transport the member's Hello came through.
    pub primary: Option<ServiceKind>,
    pub name: String,
    /// One id per transport the member shares with the lobby.
    pub ids: Vec<ServiceId>,
    pub data: LobbyDataContainer,
    pub files: Vec<LobbyFile>,
}

impl LobbyMember {
    pub fn new(guid: Guid, peer: u8) -> Self {
        Self {
            guid,
            peer,
            valid: false,
            primary: None,
            name: String::new(),
            ids: Vec::new(),
            data: LobbyDataContainer::new(),
            files: Vec::new(),
        }
    }

    pub fn service_id(&self, kind: ServiceKind) -> Option<ServiceId> {
        self.ids.iter().copied().find(|id| id.kind == kind)
    }

    pub fn primary_service_id(&self) -> Option<ServiceId> {
        self.primary.and_then(|kind| self.service_id(kind))
    }

    /// Id to use when sending to this member: our primary transport if they have it, then
    /// their primary if we run it, then anything we share. None means relay.
    pub fn data_service_id(
        &self,
        our_primary: Option<ServiceKind>,
        enabled: &[ServiceKind],
    ) -> Option<ServiceId> {
        if let Some(id) = our_primary.and_then(|kind| self.service_id(kind)) {
            return Some(id);
        }
        if let Some(id) = self.primary_service_id() {
            if enabled.contains(&id.kind) {
                return Some(id);
            }
        }
        self.ids.iter().copied().find(|id| enabled.contains(&id.kind))
    }

    /// Adds `id`, replacing any id of the same transport. Returns false if it was already present.
    pub fn add_service_id(&mut self, id: ServiceId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.retain(|existing| existing.kind != id.kind);
        self.ids.push(id);
        true
    }

    pub fn remove_service_kind(&mut self, kind: ServiceKind) -> bool {
        let before = self.ids.len();
        self.ids.retain(|id| id.kind != kind);
        self.ids.len() != before
    }

    pub fn file(&self, filename: &str) -> Option<&LobbyFile> {
        self.files.iter().find(|f| f.filename == filename)
    }

    pub fn file_mut(&mut self, filename: &str) -> Option<&mut LobbyFile> {
        self.files.iter_mut().find(|f| f.filename == filename)
    }

    /// Insert or replace the file with this name.
    pub fn add_file(&mut self, file: LobbyFile) {
        self.files.retain(|f| f.filename != file.filename);
        self.files.push(file);
    }

    pub fn remove_file(&mut self, filename: &str) -> bool {
        let before = self.files.len();
        self.files.retain(|f| f.filename != filename);
        self.files.len() != before
    }

    pub fn to_record(&self) -> MemberRecord {
        MemberRecord {
            guid: self.guid,
            peer: self.peer,
            primary: self.primary,
            name: self.name.clone(),
            ids: self.ids.clone(),
            data: self.data.serialize_data(),
            files: self.files.iter().map(LobbyFile::to_record).collect(),
        }
    }

    /// Apply the descriptive fields of a record. Ids are registered separately.
    pub fn apply_record(&mut self, record: &MemberRecord) {
        self.peer = record.peer;
        self.primary = record.primary;
        self.name = record.name.clone();
        self.valid = true;
        self.data.deserialize_data(&record.data);
        for file in &record.files {
            if self.file(&file.filename).map(|f| f.hash) != Some(file.hash) {
                self.add_file(LobbyFile::from_record(file));
            }
        }
    }
}
