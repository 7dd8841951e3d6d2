//! Aggregated outcomes of the multi-service operations.

use crate::identity::Guid;
use crate::lobby::LobbyInfo;
use crate::service::ServiceId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    #[default]
    Error,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeaveReason {
    /// `leave_lobby` was called.
    #[default]
    UserLeave,
    /// Every entry point was lost.
    Disconnected,
    /// The host removed us.
    Kicked,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateLobbyResult {
    pub code: ResultCode,
    /// Descriptor of the created lobby, entry points included.
    pub lobby: Option<LobbyInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LobbyJoinResult {
    pub code: ResultCode,
    pub lobby: Option<LobbyInfo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LobbyLeftResult {
    pub code: ResultCode,
    pub reason: LeaveReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LobbyListResult {
    pub code: ResultCode,
    pub lobbies: Vec<LobbyInfo>,
}

impl LobbyListResult {
    /// Merge one service's listing into the lobby with the same GUID, or start a new
    /// entry. Returns None when that lobby already has an entry point on this transport.
    pub fn add_entry_point(&mut self, guid: Guid, id: ServiceId) -> Option<&mut LobbyInfo> {
        if let Some(index) = self.lobbies.iter().position(|l| l.guid == guid) {
            let info = &mut self.lobbies[index];
            if info.entry_point(id.kind).is_some() {
                tracing::warn!(%guid, service = %id.kind, "lobby listed twice on the same service");
                return None;
            }
            info.entry_points.push(id);
            return Some(info);
        }
        let mut info = LobbyInfo::new();
        info.guid = guid;
        info.entry_points.push(id);
        self.lobbies.push(info);
        self.lobbies.last_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;

    #[test]
    fn listings_merge_by_guid() {
        let mut result = LobbyListResult::default();
        let a = Guid::new();
        let b = Guid::new();
        result.add_entry_point(a, ServiceId::new(ServiceKind::Steam, 1)).unwrap();
        result.add_entry_point(b, ServiceId::new(ServiceKind::Steam, 2)).unwrap();
        result.add_entry_point(a, ServiceId::new(ServiceKind::Galaxy, 3)).unwrap();

        assert_eq!(result.lobbies.len(), 2);
        let merged = &result.lobbies[0];
        assert_eq!(merged.guid, a);
        assert_eq!(merged.entry_points.len(), 2);
        assert_eq!(
            merged.entry_point(ServiceKind::Galaxy),
            Some(ServiceId::new(ServiceKind::Galaxy, 3))
        );
    }

    #[test]
    fn duplicate_entry_point_kind_is_rejected() {
        let mut result = LobbyListResult::default();
        let a = Guid::new();
        result.add_entry_point(a, ServiceId::new(ServiceKind::Enet, 1)).unwrap();
        assert!(result.add_entry_point(a, ServiceId::new(ServiceKind::Enet, 9)).is_none());
        assert_eq!(result.lobbies[0].entry_points, vec![ServiceId::new(ServiceKind::Enet, 1)]);
    }
}
