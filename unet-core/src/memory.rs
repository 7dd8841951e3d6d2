//! In-process transport: a shared hub per service kind and a `Service` adapter per user.
//!
//! Completions are deferred to the next `run_callbacks`, like a real matchmaking SDK.
//! Packets are delivered in order. A nonzero reliable packet limit drops oversized
//! reliable packets, so callers have to fragment.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rand::Rng;
use tracing::{debug, warn};

use crate::data::LobbyData;
use crate::lobby::LobbyPrivacy;
use crate::service::{PacketType, Service, ServiceError, ServiceEvent, ServiceId, ServiceKind};

/// Request kinds that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateLobby,
    GetLobbyList,
    JoinLobby,
    LeaveLobby,
}

struct HubLobby {
    owner: u64,
    privacy: LobbyPrivacy,
    max_players: u32,
    members: Vec<u64>,
    data: Vec<LobbyData>,
}

#[derive(Default)]
struct Endpoint {
    name: String,
    online: bool,
    lobby: Option<u64>,
    inbox: HashMap<u8, VecDeque<(ServiceId, Vec<u8>)>>,
    notifications: Vec<ServiceEvent>,
}

struct Hub {
    kind: ServiceKind,
    packet_limit: usize,
    lobbies: HashMap<u64, HubLobby>,
    endpoints: HashMap<u64, Endpoint>,
    failures: Vec<Operation>,
    dropped: u64,
}

impl Hub {
    fn unused_id(&self) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u64 = rng.gen();
            if id != 0 && !self.lobbies.contains_key(&id) && !self.endpoints.contains_key(&id) {
                return id;
            }
        }
    }

    fn take_failure(&mut self, op: Operation) -> bool {
        match self.failures.iter().position(|f| *f == op) {
            Some(index) => {
                self.failures.remove(index);
                true
            }
            None => false,
        }
    }

    fn notify(&mut self, user: u64, event: ServiceEvent) {
        if let Some(endpoint) = self.endpoints.get_mut(&user) {
            if endpoint.online {
                endpoint.notifications.push(event);
            }
        }
    }

    /// Take `user` out of its lobby, telling the others.
    fn depart(&mut self, user: u64) {
        let Some(lobby_id) = self.endpoints.get_mut(&user).and_then(|e| e.lobby.take()) else {
            return;
        };
        let Some(lobby) = self.lobbies.get_mut(&lobby_id) else {
            return;
        };
        lobby.members.retain(|m| *m != user);

        if lobby.owner == user {
            let members = lobby.members.clone();
            self.lobbies.remove(&lobby_id);
            for member in members {
                if let Some(endpoint) = self.endpoints.get_mut(&member) {
                    endpoint.lobby = None;
                }
                self.notify(member, ServiceEvent::LobbyLost);
            }
        } else {
            let members = lobby.members.clone();
            let id = ServiceId::new(self.kind, user);
            for member in members {
                self.notify(member, ServiceEvent::PeerLeft(id));
            }
        }
    }
}

/// One simulated backend shared by every `MemoryService` of its kind.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl MemoryNetwork {
    pub fn new(kind: ServiceKind) -> Self {
        Self::with_packet_limit(kind, 0)
    }

    /// `packet_limit` is the largest reliable packet carried; 0 for unlimited.
    pub fn with_packet_limit(kind: ServiceKind, packet_limit: usize) -> Self {
        Self {
            hub: Rc::new(RefCell::new(Hub {
                kind,
                packet_limit,
                lobbies: HashMap::new(),
                endpoints: HashMap::new(),
                failures: Vec::new(),
                dropped: 0,
            })),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.hub.borrow().kind
    }

    /// Register a new user on this network and return its service adapter.
    pub fn connect(&self, name: &str) -> MemoryService {
        let mut hub = self.hub.borrow_mut();
        let user = hub.unused_id();
        hub.endpoints.insert(
            user,
            Endpoint {
                name: name.to_string(),
                online: true,
                ..Endpoint::default()
            },
        );
        MemoryService {
            hub: Rc::clone(&self.hub),
            kind: hub.kind,
            user,
            completions: Vec::new(),
        }
    }

    /// Make the next request of kind `op` on this network fail.
    pub fn fail_next(&self, op: Operation) {
        self.hub.borrow_mut().failures.push(op);
    }

    pub fn lobby_count(&self) -> usize {
        self.hub.borrow().lobbies.len()
    }

    /// Reliable packets discarded for exceeding the packet limit.
    pub fn dropped_packets(&self) -> u64 {
        self.hub.borrow().dropped
    }
}

/// `Service` adapter for one user of a `MemoryNetwork`.
pub struct MemoryService {
    hub: Rc<RefCell<Hub>>,
    kind: ServiceKind,
    user: u64,
    completions: Vec<ServiceEvent>,
}

impl MemoryService {
    fn online(&self) -> bool {
        self.hub
            .borrow()
            .endpoints
            .get(&self.user)
            .map(|e| e.online)
            .unwrap_or(false)
    }

    /// Common gate for requests: offline or injected failure.
    fn check(&self, op: Operation) -> Result<(), ServiceError> {
        if !self.online() {
            return Err(ServiceError::Unavailable);
        }
        if self.hub.borrow_mut().take_failure(op) {
            return Err(ServiceError::Backend(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn lobby_id(&self, lobby: ServiceId) -> Option<u64> {
        (lobby.kind == self.kind).then_some(lobby.id)
    }
}

impl Service for MemoryService {
    fn kind(&self) -> ServiceKind {
        self.kind
    }

    fn user_id(&self) -> ServiceId {
        ServiceId::new(self.kind, self.user)
    }

    fn user_name(&self) -> String {
        self.hub
            .borrow()
            .endpoints
            .get(&self.user)
            .map(|e| e.name.clone())
            .unwrap_or_default()
    }

    fn reliable_packet_limit(&self) -> usize {
        self.hub.borrow().packet_limit
    }

    fn run_callbacks(&mut self) -> Vec<ServiceEvent> {
        let mut events = std::mem::take(&mut self.completions);
        if let Some(endpoint) = self.hub.borrow_mut().endpoints.get_mut(&self.user) {
            events.append(&mut endpoint.notifications);
        }
        events
    }

    fn create_lobby(&mut self, privacy: LobbyPrivacy, max_players: u32) {
        let result = self.check(Operation::CreateLobby).map(|()| {
            let mut hub = self.hub.borrow_mut();
            hub.depart(self.user);
            let id = hub.unused_id();
            hub.lobbies.insert(
                id,
                HubLobby {
                    owner: self.user,
                    privacy,
                    max_players,
                    members: vec![self.user],
                    data: Vec::new(),
                },
            );
            if let Some(endpoint) = hub.endpoints.get_mut(&self.user) {
                endpoint.lobby = Some(id);
            }
            debug!(service = %self.kind, lobby = id, "memory lobby created");
            ServiceId::new(self.kind, id)
        });
        self.completions.push(ServiceEvent::LobbyCreated(result));
    }

    fn get_lobby_list(&mut self) {
        let result = self.check(Operation::GetLobbyList).map(|()| {
            let hub = self.hub.borrow();
            let mut ids: Vec<ServiceId> = hub
                .lobbies
                .iter()
                .filter(|(_, l)| l.privacy == LobbyPrivacy::Public)
                .map(|(id, _)| ServiceId::new(self.kind, *id))
                .collect();
            ids.sort();
            ids
        });
        self.completions.push(ServiceEvent::LobbyList(result));
    }

    fn join_lobby(&mut self, lobby: ServiceId) {
        let result = self.check(Operation::JoinLobby).and_then(|()| {
            let id = self.lobby_id(lobby).ok_or(ServiceError::LobbyNotFound)?;
            let mut hub = self.hub.borrow_mut();
            let target = hub.lobbies.get(&id).ok_or(ServiceError::LobbyNotFound)?;
            if target.max_players > 0 && target.members.len() as u32 >= target.max_players {
                return Err(ServiceError::LobbyFull);
            }
            hub.depart(self.user);
            let target = hub.lobbies.get_mut(&id).ok_or(ServiceError::LobbyNotFound)?;
            target.members.push(self.user);
            if let Some(endpoint) = hub.endpoints.get_mut(&self.user) {
                endpoint.lobby = Some(id);
            }
            Ok(lobby)
        });
        self.completions.push(ServiceEvent::LobbyJoined(result));
    }

    fn leave_lobby(&mut self) {
        let result = self.check(Operation::LeaveLobby).map(|()| {
            self.hub.borrow_mut().depart(self.user);
        });
        self.completions.push(ServiceEvent::LobbyLeft(result));
    }

    fn lobby_max_players(&self, lobby: ServiceId) -> u32 {
        let hub = self.hub.borrow();
        self.lobby_id(lobby)
            .and_then(|id| hub.lobbies.get(&id))
            .map(|l| l.max_players)
            .unwrap_or(0)
    }

    fn lobby_host(&self, lobby: ServiceId) -> Option<ServiceId> {
        let hub = self.hub.borrow();
        self.lobby_id(lobby)
            .and_then(|id| hub.lobbies.get(&id))
            .map(|l| ServiceId::new(self.kind, l.owner))
    }

    fn lobby_data(&self, lobby: ServiceId, name: &str) -> Option<String> {
        let hub = self.hub.borrow();
        self.lobby_id(lobby)
            .and_then(|id| hub.lobbies.get(&id))
            .and_then(|l| l.data.iter().find(|d| d.name == name))
            .map(|d| d.value.clone())
    }

    fn lobby_data_count(&self, lobby: ServiceId) -> usize {
        let hub = self.hub.borrow();
        self.lobby_id(lobby)
            .and_then(|id| hub.lobbies.get(&id))
            .map(|l| l.data.len())
            .unwrap_or(0)
    }

    fn lobby_data_at(&self, lobby: ServiceId, index: usize) -> Option<LobbyData> {
        let hub = self.hub.borrow();
        self.lobby_id(lobby)
            .and_then(|id| hub.lobbies.get(&id))
            .and_then(|l| l.data.get(index).cloned())
    }

    fn set_lobby_data(&mut self, lobby: ServiceId, name: &str, value: &str) {
        let Some(id) = self.lobby_id(lobby) else {
            return;
        };
        let mut hub = self.hub.borrow_mut();
        let Some(target) = hub.lobbies.get_mut(&id) else {
            return;
        };
        if target.owner != self.user {
            warn!(service = %self.kind, "only the lobby owner can set lobby data");
            return;
        }
        match target.data.iter_mut().find(|d| d.name == name) {
            Some(entry) => entry.value = value.to_string(),
            None => target.data.push(LobbyData::new(name, value)),
        }
    }

    fn remove_lobby_data(&mut self, lobby: ServiceId, name: &str) {
        let Some(id) = self.lobby_id(lobby) else {
            return;
        };
        let mut hub = self.hub.borrow_mut();
        let Some(target) = hub.lobbies.get_mut(&id) else {
            return;
        };
        if target.owner == self.user {
            target.data.retain(|d| d.name != name);
        }
    }

    fn send_packet(&mut self, peer: ServiceId, data: &[u8], packet_type: PacketType, channel: u8) {
        let mut hub = self.hub.borrow_mut();
        let online = hub.endpoints.get(&self.user).map(|e| e.online).unwrap_or(false);
        if !online || peer.kind != self.kind {
            return;
        }
        if packet_type == PacketType::Reliable && hub.packet_limit > 0 && data.len() > hub.packet_limit {
            warn!(service = %self.kind, size = data.len(), limit = hub.packet_limit, "reliable packet over limit dropped");
            hub.dropped += 1;
            return;
        }
        let from = ServiceId::new(self.kind, self.user);
        if let Some(endpoint) = hub.endpoints.get_mut(&peer.id) {
            if endpoint.online {
                endpoint
                    .inbox
                    .entry(channel)
                    .or_default()
                    .push_back((from, data.to_vec()));
            }
        }
    }

    fn read_packet(&mut self, channel: u8) -> Option<(ServiceId, Vec<u8>)> {
        self.hub
            .borrow_mut()
            .endpoints
            .get_mut(&self.user)?
            .inbox
            .get_mut(&channel)?
            .pop_front()
    }

    fn is_packet_available(&self, channel: u8) -> Option<usize> {
        self.hub
            .borrow()
            .endpoints
            .get(&self.user)?
            .inbox
            .get(&channel)?
            .front()
            .map(|(_, data)| data.len())
    }

    fn simulate_outage(&mut self) {
        let mut hub = self.hub.borrow_mut();
        hub.depart(self.user);
        if let Some(endpoint) = hub.endpoints.get_mut(&self.user) {
            endpoint.online = false;
            endpoint.inbox.clear();
            endpoint.notifications.clear();
        }
        warn!(service = %self.kind, user = self.user, "simulated outage");
    }
}
