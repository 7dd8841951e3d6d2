//! Context: the session coordinator. Drives lobby lifecycle across every enabled service,
//! routes application and lobby traffic, and turns lobby actions into transport calls.
//!
//! Single-threaded and poll-driven: requests return immediately, and everything happens
//! inside [`Context::run_callbacks`], which the embedding program calls once per tick.

use std::collections::VecDeque;
use std::mem;

use tracing::{debug, error, info, warn};

use crate::config::ContextConfig;
use crate::event::Event;
use crate::file::{LobbyFile, OutgoingFileTransfer};
use crate::identity::Guid;
use crate::lobby::{Lobby, LobbyAction, LobbyError, LobbyInfo, LobbyPrivacy, Recipient};
use crate::message::{Channel, NetworkMessage};
use crate::multi_callback::MultiCallback;
use crate::protocol::{
    app_to_physical, LobbyPacket, KEY_GUID, KEY_MAX_PLAYERS, KEY_NAME, LOBBY_CHANNEL,
    RELAY_CHANNEL, RELAY_INTERNAL_CHANNEL,
};
use crate::reassembly::{self, Reassembly, ReassemblyError};
use crate::results::{
    CreateLobbyResult, LeaveReason, LobbyJoinResult, LobbyLeftResult, LobbyListResult, ResultCode,
};
use crate::service::{PacketType, Service, ServiceEvent, ServiceId, ServiceKind};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context is busy ({0:?})")]
    Busy(ContextStatus),
    #[error("no services enabled")]
    NoServices,
    #[error("service {0} is already enabled")]
    ServiceAlreadyEnabled(ServiceKind),
    #[error("service {0} is not enabled")]
    ServiceNotEnabled(ServiceKind),
    #[error("lobby has no entry point on any enabled service")]
    NoEntryPoint,
    #[error("not in a lobby")]
    NotInLobby,
    #[error("cannot send to the local peer")]
    SendToSelf,
    #[error("no member with peer index {0}")]
    UnknownPeer(u8),
    #[error("channel {channel} out of range ({channels} channels)")]
    InvalidChannel { channel: u8, channels: u8 },
    #[error("peer {0} is unreachable")]
    Unreachable(u8),
    #[error("no file data fits a {limit}-byte route to peer {receiver}")]
    NoRoomForFileData { receiver: u8, limit: usize },
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error(transparent)]
    Lobby(#[from] LobbyError),
}

/// How a packet reaches a member: straight over a shared service, or through the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct { service: usize, id: ServiceId },
    Relay { service: usize, host: ServiceId },
}

fn code_of<T, E>(result: &Result<T, E>) -> ResultCode {
    if result.is_ok() {
        ResultCode::Ok
    } else {
        ResultCode::Error
    }
}

pub struct Context {
    config: ContextConfig,
    status: ContextStatus,
    persona: String,
    local_guid: Guid,
    services: Vec<Box<dyn Service>>,
    primary: Option<ServiceKind>,
    lobby: Option<Lobby>,
    queues: Vec<VecDeque<NetworkMessage>>,
    reassembly: Reassembly,
    create_callback: MultiCallback<CreateLobbyResult>,
    list_callback: MultiCallback<LobbyListResult>,
    join_callback: MultiCallback<LobbyJoinResult>,
    leave_callback: MultiCallback<LobbyLeftResult>,
    events: VecDeque<Event>,
    transfers: Vec<OutgoingFileTransfer>,
    pending_leave: Option<LeaveReason>,
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        let config = config.normalized();
        Self {
            persona: config.persona.clone().unwrap_or_default(),
            queues: (0..config.channels).map(|_| VecDeque::new()).collect(),
            config,
            status: ContextStatus::Idle,
            local_guid: Guid::nil(),
            services: Vec::new(),
            primary: None,
            lobby: None,
            reassembly: Reassembly::new(),
            create_callback: MultiCallback::new("create-lobby"),
            list_callback: MultiCallback::new("lobby-list"),
            join_callback: MultiCallback::new("join-lobby"),
            leave_callback: MultiCallback::new("leave-lobby"),
            events: VecDeque::new(),
            transfers: Vec::new(),
            pending_leave: None,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn status(&self) -> ContextStatus {
        self.status
    }

    pub fn persona_name(&self) -> &str {
        &self.persona
    }

    pub fn set_persona_name(&mut self, name: &str) {
        self.persona = name.to_string();
    }

    pub fn lobby(&self) -> Option<&Lobby> {
        self.lobby.as_ref()
    }

    pub fn local_peer(&self) -> Option<u8> {
        self.lobby.as_ref().and_then(Lobby::local_peer)
    }

    /// Fragmented messages whose hash did not match (still delivered).
    pub fn hash_mismatches(&self) -> u64 {
        self.reassembly.hash_mismatches()
    }

    /// Next domain event, oldest first.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Add a backend. The first one enabled becomes the primary service.
    pub fn enable_service(&mut self, service: Box<dyn Service>) -> Result<(), ContextError> {
        let kind = service.kind();
        if self.service_index(kind).is_some() {
            return Err(ContextError::ServiceAlreadyEnabled(kind));
        }
        info!(service = %kind, user = %service.user_id(), "service enabled");
        self.services.push(service);
        if self.primary.is_none() {
            self.set_primary_service(kind)?;
        }
        Ok(())
    }

    /// Prefer `kind` for lobby traffic. Also adopts its user name if no persona is set.
    pub fn set_primary_service(&mut self, kind: ServiceKind) -> Result<(), ContextError> {
        let index = self
            .service_index(kind)
            .ok_or(ContextError::ServiceNotEnabled(kind))?;
        self.primary = Some(kind);
        if self.persona.is_empty() {
            self.persona = self.services[index].user_name();
        }
        Ok(())
    }

    pub fn primary_service(&self) -> Option<ServiceKind> {
        self.primary
    }

    pub fn service(&self, kind: ServiceKind) -> Option<&dyn Service> {
        self.services
            .iter()
            .find(|s| s.kind() == kind)
            .map(|s| &**s)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    fn service_index(&self, kind: ServiceKind) -> Option<usize> {
        self.services.iter().position(|s| s.kind() == kind)
    }

    fn enabled_kinds(&self) -> Vec<ServiceKind> {
        self.services.iter().map(|s| s.kind()).collect()
    }

    /// Take `kind` down as if its platform failed, and forget what was reachable only through it.
    pub fn simulate_service_outage(&mut self, kind: ServiceKind) -> Result<(), ContextError> {
        let index = self
            .service_index(kind)
            .ok_or(ContextError::ServiceNotEnabled(kind))?;
        self.services[index].simulate_outage();
        if let Some(lobby) = self.lobby.as_mut() {
            let actions = lobby.service_disconnected(kind);
            self.execute(actions);
        }
        Ok(())
    }

    fn reset_session(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        self.reassembly.clear();
        self.transfers.clear();
        self.pending_leave = None;
    }

    pub fn create_lobby(
        &mut self,
        privacy: LobbyPrivacy,
        max_players: u32,
        name: Option<&str>,
    ) -> Result<(), ContextError> {
        if self.status != ContextStatus::Idle {
            error!(status = ?self.status, "can't create a lobby while not idle");
            return Err(ContextError::Busy(self.status));
        }
        if self.services.is_empty() {
            return Err(ContextError::NoServices);
        }

        self.reset_session();
        self.local_guid = Guid::new();

        let mut info = LobbyInfo::new();
        info.is_hosting = true;
        info.privacy = privacy;
        info.max_players = max_players;
        info.guid = Guid::new();
        info.name = name.unwrap_or_default().to_string();
        info!(lobby = %info.guid, name = %info.name, max_players, "creating lobby");
        self.lobby = Some(Lobby::new(info, self.local_guid));
        self.status = ContextStatus::Connecting;

        self.create_callback.begin();
        for service in &mut self.services {
            self.create_callback.add_request(service.kind());
            service.create_lobby(privacy, max_players);
        }
        Ok(())
    }

    pub fn get_lobby_list(&mut self) -> Result<(), ContextError> {
        if self.services.is_empty() {
            return Err(ContextError::NoServices);
        }
        self.list_callback.begin();
        for service in &mut self.services {
            self.list_callback.add_request(service.kind());
            service.get_lobby_list();
        }
        Ok(())
    }

    /// Join through every entry point of `info` that matches an enabled service.
    pub fn join_lobby(&mut self, info: &LobbyInfo) -> Result<(), ContextError> {
        if self.status != ContextStatus::Idle {
            warn!(status = ?self.status, "can't join a lobby while not idle");
            return Err(ContextError::Busy(self.status));
        }
        let targets: Vec<(usize, ServiceId)> = self
            .services
            .iter()
            .enumerate()
            .filter_map(|(index, s)| info.entry_point(s.kind()).map(|entry| (index, entry)))
            .collect();
        if targets.is_empty() {
            return Err(ContextError::NoEntryPoint);
        }
        self.begin_join(info.clone(), targets);
        Ok(())
    }

    /// Join through a single known lobby id.
    pub fn join_lobby_id(&mut self, id: ServiceId) -> Result<(), ContextError> {
        if self.status != ContextStatus::Idle {
            error!(status = ?self.status, "can't join a lobby while not idle");
            return Err(ContextError::Busy(self.status));
        }
        let index = self
            .service_index(id.kind)
            .ok_or(ContextError::ServiceNotEnabled(id.kind))?;
        self.begin_join(LobbyInfo::new(), vec![(index, id)]);
        Ok(())
    }

    fn begin_join(&mut self, mut info: LobbyInfo, targets: Vec<(usize, ServiceId)>) {
        self.reset_session();
        self.local_guid = Guid::new();

        info.is_hosting = false;
        info.entry_points.clear();
        info!(lobby = %info.guid, services = targets.len(), "joining lobby");
        self.lobby = Some(Lobby::new(info, self.local_guid));
        self.status = ContextStatus::Connecting;

        self.join_callback.begin();
        for (index, entry) in targets {
            self.join_callback.add_request(entry.kind);
            self.services[index].join_lobby(entry);
        }
    }

    /// Leave the current lobby. While a create or join is still in flight the request is
    /// queued and carried out as soon as it completes.
    pub fn leave_lobby(&mut self, reason: LeaveReason) {
        match self.status {
            ContextStatus::Connected => self.start_leave(reason),
            ContextStatus::Connecting => {
                if self.create_callback.is_active() || self.join_callback.is_active() {
                    info!(?reason, "leave requested while connecting, queued");
                    self.pending_leave = Some(reason);
                } else {
                    self.start_leave(reason);
                }
            }
            ContextStatus::Idle => {
                self.lobby = None;
            }
        }
    }

    fn start_leave(&mut self, reason: LeaveReason) {
        if self.leave_callback.is_active() {
            debug!("leave already in progress");
            return;
        }
        info!(?reason, "leaving lobby");
        self.leave_callback.begin();
        self.leave_callback.result_mut().reason = reason;
        for service in &mut self.services {
            self.leave_callback.add_request(service.kind());
            service.leave_lobby();
        }
        if !self.leave_callback.is_active() {
            self.finish_leave(ResultCode::Ok, reason);
        }
    }

    fn finish_leave(&mut self, code: ResultCode, reason: LeaveReason) {
        self.status = ContextStatus::Idle;
        self.lobby = None;
        self.leave_callback.begin();
        self.reset_session();
        info!(?reason, "left lobby");
        self.events
            .push_back(Event::LobbyLeft(LobbyLeftResult { code, reason }));
    }

    /// Pump every service, complete aggregated requests, move traffic. Call once per tick.
    pub fn run_callbacks(&mut self) {
        for index in 0..self.services.len() {
            let kind = self.services[index].kind();
            for event in self.services[index].run_callbacks() {
                self.on_service_event(index, kind, event);
            }
        }

        self.check_callbacks();

        let lost = self.lobby.as_ref().map_or(false, |l| !l.is_connected());
        if lost && self.status == ContextStatus::Connected && !self.leave_callback.is_active() {
            error!("connection to lobby was lost");
            self.finish_leave(ResultCode::Ok, LeaveReason::Disconnected);
        } else if lost && self.awaiting_snapshot() {
            error!("connection to lobby was lost before the join completed");
            self.fail_join();
        }

        if self.lobby.is_some() {
            for index in 0..self.services.len() {
                self.drain_service(index);
            }
        }

        self.drain_ready();
        self.advance_transfers();
    }

    /// Services joined, waiting for the host's snapshot.
    fn awaiting_snapshot(&self) -> bool {
        self.status == ContextStatus::Connecting
            && !self.create_callback.is_active()
            && !self.join_callback.is_active()
            && self.lobby.as_ref().map_or(false, |l| !l.is_hosting())
    }

    fn on_service_event(&mut self, index: usize, kind: ServiceKind, event: ServiceEvent) {
        match event {
            ServiceEvent::LobbyCreated(result) => {
                if !self.create_callback.complete(kind, code_of(&result)) {
                    debug!(service = %kind, "unexpected create completion");
                    return;
                }
                match result {
                    Ok(id) => {
                        if let Some(lobby) = self.lobby.as_mut() {
                            lobby.add_entry_point(id);
                        }
                    }
                    Err(e) => warn!(service = %kind, error = %e, "create lobby failed"),
                }
            }
            ServiceEvent::LobbyList(result) => {
                if !self.list_callback.complete(kind, code_of(&result)) {
                    debug!(service = %kind, "unexpected lobby list completion");
                    return;
                }
                match result {
                    Ok(ids) => {
                        let service = &self.services[index];
                        for id in ids {
                            let guid = service
                                .lobby_data(id, KEY_GUID)
                                .and_then(|g| g.parse::<Guid>().ok());
                            let Some(guid) = guid else {
                                debug!(%id, "skipping lobby without a guid");
                                continue;
                            };
                            if let Some(info) = self.list_callback.result_mut().add_entry_point(guid, id) {
                                info.name = service.lobby_data(id, KEY_NAME).unwrap_or_default();
                                info.max_players = service.lobby_max_players(id);
                            }
                        }
                    }
                    Err(e) => warn!(service = %kind, error = %e, "lobby list failed"),
                }
            }
            ServiceEvent::LobbyJoined(result) => {
                if !self.join_callback.complete(kind, code_of(&result)) {
                    debug!(service = %kind, "unexpected join completion");
                    return;
                }
                match result {
                    Ok(id) => {
                        if let Some(lobby) = self.lobby.as_mut() {
                            lobby.add_entry_point(id);
                        }
                    }
                    Err(e) => warn!(service = %kind, error = %e, "join lobby failed"),
                }
            }
            ServiceEvent::LobbyLeft(result) => {
                if let Err(e) = &result {
                    warn!(service = %kind, error = %e, "leave lobby failed");
                }
                if !self.leave_callback.complete(kind, code_of(&result)) {
                    debug!(service = %kind, "unexpected leave completion");
                }
            }
            ServiceEvent::PeerLeft(id) => {
                if let Some(lobby) = self.lobby.as_mut() {
                    let actions = lobby.remove_member_service(id);
                    self.execute(actions);
                }
            }
            ServiceEvent::LobbyLost => {
                if let Some(lobby) = self.lobby.as_mut() {
                    let actions = lobby.service_disconnected(kind);
                    self.execute(actions);
                }
            }
        }
    }

    fn check_callbacks(&mut self) {
        if let Some((code, result)) = self.create_callback.take() {
            self.on_lobby_created(code, result);
        }
        if let Some((code, mut result)) = self.list_callback.take() {
            result.code = code;
            debug!(lobbies = result.lobbies.len(), "lobby list complete");
            self.events.push_back(Event::LobbyList(result));
        }
        if let Some((code, result)) = self.join_callback.take() {
            self.on_lobby_joined(code, result);
        }
        if let Some((code, result)) = self.leave_callback.take() {
            self.finish_leave(code, result.reason);
        }
    }

    fn on_lobby_created(&mut self, code: ResultCode, mut result: CreateLobbyResult) {
        result.code = code;
        if !code.is_ok() {
            error!("lobby could not be created on any service");
            self.status = ContextStatus::Idle;
            self.lobby = None;
            self.pending_leave = None;
            self.events.push_back(Event::LobbyCreated(result));
            return;
        }

        self.status = ContextStatus::Connected;
        let primary = self.lobby_primary_kind();
        let Some(lobby) = self.lobby.as_mut() else {
            return;
        };
        let ids: Vec<ServiceId> = self
            .services
            .iter()
            .filter(|s| lobby.info().entry_point(s.kind()).is_some())
            .map(|s| s.user_id())
            .collect();
        lobby.add_local_member(&self.persona, primary, ids);

        let info = lobby.info().clone();
        let mut actions = Vec::new();
        for (name, value) in [
            (KEY_GUID, info.guid.to_string()),
            (KEY_NAME, info.name.clone()),
            (KEY_MAX_PLAYERS, info.max_players.to_string()),
        ] {
            match lobby.set_data(name, &value) {
                Ok(a) => actions.extend(a),
                Err(e) => warn!(key = name, error = %e, "could not set lobby data"),
            }
        }
        info!(lobby = %info.guid, entry_points = info.entry_points.len(), "lobby created");
        result.lobby = Some(info);
        self.events.push_back(Event::LobbyCreated(result));
        self.execute(actions);

        if let Some(reason) = self.pending_leave.take() {
            self.start_leave(reason);
        }
    }

    fn on_lobby_joined(&mut self, code: ResultCode, _result: LobbyJoinResult) {
        if !code.is_ok() {
            error!("lobby could not be joined on any service");
            self.fail_join();
            return;
        }
        if let Some(reason) = self.pending_leave.take() {
            self.start_leave(reason);
            return;
        }

        let Some(lobby) = self.lobby.as_ref() else {
            return;
        };
        let hosts: Vec<(usize, ServiceId)> = self
            .services
            .iter()
            .enumerate()
            .filter_map(|(index, s)| {
                let entry = lobby.info().entry_point(s.kind())?;
                s.lobby_host(entry).map(|host| (index, host))
            })
            .collect();

        let handshake = LobbyPacket::Handshake {
            guid: self.local_guid,
        };
        match wire::encode_packet(&handshake) {
            Ok(bytes) => {
                for (service, host) in hosts {
                    let route = Route::Direct { service, id: host };
                    if let Err(e) = self.transmit(route, 0, &bytes, PacketType::Reliable, Channel::Lobby) {
                        warn!(%host, error = %e, "handshake failed");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to encode handshake"),
        }

        let hello = LobbyPacket::Hello {
            name: self.persona.clone(),
        };
        self.send_lobby_packet(Recipient::Host, &hello);
        debug!("hello sent");
    }

    fn fail_join(&mut self) {
        self.status = ContextStatus::Idle;
        self.lobby = None;
        self.pending_leave = None;
        self.events.push_back(Event::LobbyJoined(LobbyJoinResult {
            code: ResultCode::Error,
            lobby: None,
        }));
    }

    fn on_join_completed(&mut self) {
        if self.status != ContextStatus::Connecting {
            return;
        }
        self.status = ContextStatus::Connected;
        let info = self.lobby.as_ref().map(|l| l.info().clone());
        info!(peer = ?self.local_peer(), "joined lobby");
        self.events.push_back(Event::LobbyJoined(LobbyJoinResult {
            code: ResultCode::Ok,
            lobby: info,
        }));
        if let Some(reason) = self.pending_leave.take() {
            self.start_leave(reason);
        }
    }

    /// Our primary service if the lobby is reachable through it, else the first entry point's.
    fn lobby_primary_kind(&self) -> Option<ServiceKind> {
        let lobby = self.lobby.as_ref()?;
        self.primary
            .filter(|kind| lobby.info().entry_point(*kind).is_some())
            .or_else(|| lobby.info().entry_points.first().map(|e| e.kind))
    }

    fn primary_entry(&self) -> Option<(usize, ServiceId)> {
        let kind = self.lobby_primary_kind()?;
        let entry = self.lobby.as_ref()?.info().entry_point(kind)?;
        Some((self.service_index(kind)?, entry))
    }

    fn drain_service(&mut self, index: usize) {
        let limit = self.services[index].reliable_packet_limit();

        if limit > 0 {
            while let Some((from, bytes)) = self.services[index].read_packet(LOBBY_CHANNEL) {
                self.feed(from, Channel::Lobby, &bytes);
            }
            for channel in 0..self.config.channels {
                let physical = app_to_physical(channel);
                while let Some((from, bytes)) = self.services[index].read_packet(physical) {
                    self.feed(from, Channel::App(channel), &bytes);
                }
            }
        }

        while let Some((from, bytes)) = self.services[index].read_packet(RELAY_CHANNEL) {
            self.on_relay_packet(from, &bytes);
        }

        if limit == 0 {
            while let Some((from, bytes)) = self.services[index].read_packet(LOBBY_CHANNEL) {
                self.handle_lobby_message(from, &bytes);
            }
        }
    }

    fn feed(&mut self, from: ServiceId, channel: Channel, bytes: &[u8]) {
        if let Err(e) = self.reassembly.handle_message(from, channel, bytes) {
            warn!(%from, error = %e, "dropping malformed packet");
        }
    }

    fn relay_channel(&self, channel: u8) -> Option<Channel> {
        if channel == RELAY_INTERNAL_CHANNEL {
            Some(Channel::Lobby)
        } else if channel < self.config.channels {
            Some(Channel::App(channel))
        } else {
            warn!(channel, "invalid channel index in relay packet");
            None
        }
    }

    fn on_relay_packet(&mut self, from: ServiceId, bytes: &[u8]) {
        let Some(lobby) = self.lobby.as_ref() else {
            return;
        };

        if !lobby.is_hosting() {
            let delivery = match wire::decode_relay_delivery(bytes) {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!(%from, error = %e, "dropping relay packet");
                    return;
                }
            };
            let sender = lobby
                .member(delivery.sender)
                .and_then(|m| m.primary_service_id().or_else(|| m.ids.first().copied()));
            let Some(sender) = sender else {
                error!(peer = delivery.sender, "received a relay packet from unknown peer");
                return;
            };
            if let Some(channel) = self.relay_channel(delivery.channel) {
                self.feed(sender, channel, delivery.payload);
            }
            return;
        }

        let request = match wire::decode_relay_request(bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(%from, error = %e, "dropping relay packet");
                return;
            }
        };
        let local_peer = lobby.local_peer();
        let Some(sender) = lobby.member_by_service_id(from).map(|m| m.peer) else {
            warn!(%from, "relay packet from unknown peer");
            return;
        };
        let Some(channel) = self.relay_channel(request.channel) else {
            return;
        };

        if Some(request.dest) == local_peer {
            self.feed(from, channel, request.payload);
            return;
        }

        match self.route(request.dest) {
            Ok(Route::Direct { service, id }) => {
                let frame = wire::encode_relay_delivery(sender, request.channel, request.payload);
                let target = &mut self.services[service];
                let limit = target.reliable_packet_limit();
                if request.packet_type == PacketType::Reliable && limit > 0 && frame.len() > limit {
                    // Fragments are sized for the sender's first hop only.
                    error!(dest = request.dest, size = frame.len(), limit, "relayed packet exceeds next hop limit");
                    return;
                }
                target.send_packet(id, &frame, request.packet_type, RELAY_CHANNEL);
            }
            Ok(Route::Relay { .. }) => {
                error!(dest = request.dest, "no direct route to relay target");
            }
            Err(e) => {
                error!(
                    dest = request.dest,
                    size = request.payload.len(),
                    error = %e,
                    "tried relaying packet to unreachable peer"
                );
            }
        }
    }

    fn handle_lobby_message(&mut self, from: ServiceId, bytes: &[u8]) {
        let actions = match self.lobby.as_mut() {
            Some(lobby) => lobby.handle_message(from, bytes),
            None => return,
        };
        self.execute(actions);
    }

    fn drain_ready(&mut self) {
        while let Some(message) = self.reassembly.pop_ready() {
            match message.channel {
                Channel::Lobby => self.handle_lobby_message(message.peer, &message.data),
                Channel::App(channel) => match self.queues.get_mut(channel as usize) {
                    Some(queue) => queue.push_back(message),
                    None => warn!(channel, "dropping message for unknown channel"),
                },
            }
        }
    }

    fn advance_transfers(&mut self) {
        if self.transfers.is_empty() {
            return;
        }
        let Some(lobby) = self.lobby.as_ref() else {
            self.transfers.clear();
            return;
        };
        let per_tick = self.config.file_chunks_per_tick;

        let mut transfers = mem::take(&mut self.transfers);
        let mut actions = Vec::new();
        transfers.retain_mut(|transfer| {
            for _ in 0..per_tick {
                let chunk_size = match self.file_chunk_size(transfer) {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(receiver = transfer.receiver, filename = %transfer.filename, error = %e, "file transfer aborted");
                        return false;
                    }
                };
                match lobby.advance_transfer(transfer, chunk_size) {
                    Ok(more) => actions.extend(more),
                    Err(e) => {
                        warn!(receiver = transfer.receiver, filename = %transfer.filename, error = %e, "file transfer aborted");
                        return false;
                    }
                }
                if transfer.is_finished() {
                    return false;
                }
            }
            true
        });
        self.transfers = transfers;
        self.execute(actions);
    }

    /// Configured chunk size, shrunk so one `LobbyFileData` packet stays within the
    /// fragment ceiling of the route to the receiver.
    fn file_chunk_size(&self, transfer: &OutgoingFileTransfer) -> Result<usize, ContextError> {
        let configured = self.config.file_chunk_size;
        let service = match self.route(transfer.receiver)? {
            Route::Direct { service, .. } | Route::Relay { service, .. } => service,
        };
        let limit = self.services[service].reliable_packet_limit();
        if limit == 0 {
            return Ok(configured);
        }
        let no_room = ContextError::NoRoomForFileData {
            receiver: transfer.receiver,
            limit,
        };
        let envelope = LobbyPacket::LobbyFileData {
            filename: transfer.filename.clone(),
            offset: transfer.sent,
            data: Vec::new(),
        };
        let Ok(overhead) = wire::encode_packet(&envelope).map(|bytes| bytes.len()) else {
            return Err(no_room);
        };
        let capacity = reassembly::max_message_size(limit)?.saturating_sub(overhead);
        if capacity == 0 {
            return Err(no_room);
        }
        Ok(configured.min(capacity))
    }

    fn execute(&mut self, actions: Vec<LobbyAction>) {
        for action in actions {
            match action {
                LobbyAction::Send { to, packet } => self.send_lobby_packet(to, &packet),
                LobbyAction::Publish { name, value } => self.publish(&name, value.as_deref()),
                LobbyAction::Notify(event) => self.events.push_back(event),
                LobbyAction::JoinCompleted => self.on_join_completed(),
                LobbyAction::Kicked { reason } => {
                    warn!(%reason, "kicked from lobby");
                    self.leave_lobby(LeaveReason::Kicked);
                }
                LobbyAction::StartFileTransfer { receiver, filename } => {
                    let size = self
                        .lobby
                        .as_ref()
                        .and_then(Lobby::local_member)
                        .and_then(|m| m.file(&filename))
                        .map(|f| f.size)
                        .unwrap_or(0);
                    let transfer = OutgoingFileTransfer::new(receiver, filename, size);
                    let running = self
                        .transfers
                        .iter()
                        .position(|t| t.receiver == transfer.receiver && t.filename == transfer.filename);
                    match running {
                        Some(index) => {
                            let sent = self.transfers[index].sent;
                            debug!(receiver, filename = %transfer.filename, sent, "restarting file transfer");
                            self.transfers[index] = transfer;
                        }
                        None => self.transfers.push(transfer),
                    }
                }
            }
        }
    }

    /// Mirror lobby data into each service's own store so listings can see it.
    fn publish(&mut self, name: &str, value: Option<&str>) {
        let Some(lobby) = self.lobby.as_ref() else {
            return;
        };
        for service in &mut self.services {
            let Some(entry) = lobby.info().entry_point(service.kind()) else {
                continue;
            };
            match value {
                Some(value) => service.set_lobby_data(entry, name, value),
                None => service.remove_lobby_data(entry, name),
            }
        }
    }

    fn send_lobby_packet(&mut self, to: Recipient, packet: &LobbyPacket) {
        let bytes = match wire::encode_packet(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(packet = packet.name(), error = %e, "failed to encode lobby packet");
                return;
            }
        };

        match to {
            Recipient::Peer(peer) => self.send_internal(peer, &bytes, packet.name()),
            Recipient::Host => {
                let host_known = self
                    .lobby
                    .as_ref()
                    .map_or(false, |l| l.host_member().is_some());
                if host_known {
                    self.send_internal(0, &bytes, packet.name());
                    return;
                }
                let Some((service, entry)) = self.primary_entry() else {
                    warn!(packet = packet.name(), "no entry point to reach the host");
                    return;
                };
                let Some(host) = self.services[service].lobby_host(entry) else {
                    warn!(packet = packet.name(), %entry, "lobby host unknown");
                    return;
                };
                let route = Route::Direct { service, id: host };
                let result = self.transmit(route, 0, &bytes, PacketType::Reliable, Channel::Lobby);
                log_undelivered(0, packet.name(), bytes.len(), result);
            }
            Recipient::AllValid { except } => {
                let peers: Vec<u8> = self
                    .lobby
                    .as_ref()
                    .map(|l| {
                        l.members()
                            .iter()
                            .filter(|m| m.valid && Some(m.peer) != l.local_peer() && Some(m.peer) != except)
                            .map(|m| m.peer)
                            .collect()
                    })
                    .unwrap_or_default();
                for peer in peers {
                    self.send_internal(peer, &bytes, packet.name());
                }
            }
        }
    }

    fn send_internal(&mut self, peer: u8, bytes: &[u8], what: &str) {
        let result = self
            .route(peer)
            .and_then(|route| self.transmit(route, peer, bytes, PacketType::Reliable, Channel::Lobby));
        log_undelivered(peer, what, bytes.len(), result);
    }

    fn route(&self, peer: u8) -> Result<Route, ContextError> {
        let lobby = self.lobby.as_ref().ok_or(ContextError::NotInLobby)?;
        if Some(peer) == lobby.local_peer() {
            return Err(ContextError::SendToSelf);
        }
        let member = lobby.member(peer).ok_or(ContextError::UnknownPeer(peer))?;
        let enabled = self.enabled_kinds();
        if let Some(id) = member.data_service_id(self.primary, &enabled) {
            if let Some(service) = self.service_index(id.kind) {
                return Ok(Route::Direct { service, id });
            }
        }

        if peer == 0 || lobby.is_hosting() {
            return Err(ContextError::Unreachable(peer));
        }
        let host = lobby
            .host_member()
            .and_then(|h| h.data_service_id(self.primary, &enabled))
            .ok_or(ContextError::Unreachable(peer))?;
        let service = self
            .service_index(host.kind)
            .ok_or(ContextError::Unreachable(peer))?;
        Ok(Route::Relay { service, host })
    }

    /// Send `data` along `route`, fragmenting for services with a reliable packet limit.
    /// Relayed traffic always carries reassembly framing.
    fn transmit(
        &mut self,
        route: Route,
        dest: u8,
        data: &[u8],
        packet_type: PacketType,
        channel: Channel,
    ) -> Result<(), ContextError> {
        match route {
            Route::Direct { service, id } => {
                let physical = match channel {
                    Channel::Lobby => LOBBY_CHANNEL,
                    Channel::App(ch) => app_to_physical(ch),
                };
                let target = &mut self.services[service];
                let limit = target.reliable_packet_limit();
                if limit == 0 {
                    target.send_packet(id, data, packet_type, physical);
                    return Ok(());
                }
                self.reassembly
                    .split_message(data, packet_type, limit, |fragment| {
                        target.send_packet(id, fragment, packet_type, physical)
                    })?;
            }
            Route::Relay { service, host } => {
                let relay_channel = match channel {
                    Channel::Lobby => RELAY_INTERNAL_CHANNEL,
                    Channel::App(ch) => ch,
                };
                let target = &mut self.services[service];
                let limit = target.reliable_packet_limit();
                if limit == 0 {
                    let framed = self.reassembly.frame_single(data);
                    let frame = wire::encode_relay_request(dest, relay_channel, packet_type, &framed);
                    target.send_packet(host, &frame, PacketType::Reliable, RELAY_CHANNEL);
                    return Ok(());
                }
                self.reassembly
                    .split_message(data, packet_type, limit, |fragment| {
                        let frame = wire::encode_relay_request(dest, relay_channel, packet_type, fragment);
                        target.send_packet(host, &frame, PacketType::Reliable, RELAY_CHANNEL)
                    })?;
            }
        }
        Ok(())
    }

    fn check_channel(&self, channel: u8) -> Result<(), ContextError> {
        if channel >= self.config.channels {
            return Err(ContextError::InvalidChannel {
                channel,
                channels: self.config.channels,
            });
        }
        Ok(())
    }

    /// Send to one member on application channel `channel`.
    pub fn send_to(
        &mut self,
        peer: u8,
        data: &[u8],
        packet_type: PacketType,
        channel: u8,
    ) -> Result<(), ContextError> {
        self.check_channel(channel)?;
        let route = self.route(peer)?;
        self.transmit(route, peer, data, packet_type, Channel::App(channel))
    }

    pub fn send_to_all(&mut self, data: &[u8], packet_type: PacketType, channel: u8) -> Result<(), ContextError> {
        self.broadcast(None, data, packet_type, channel)
    }

    pub fn send_to_all_except(
        &mut self,
        except: u8,
        data: &[u8],
        packet_type: PacketType,
        channel: u8,
    ) -> Result<(), ContextError> {
        self.broadcast(Some(except), data, packet_type, channel)
    }

    pub fn send_to_host(&mut self, data: &[u8], packet_type: PacketType, channel: u8) -> Result<(), ContextError> {
        self.send_to(0, data, packet_type, channel)
    }

    /// Sends to every valid member; keeps going past failures and reports the first.
    fn broadcast(
        &mut self,
        except: Option<u8>,
        data: &[u8],
        packet_type: PacketType,
        channel: u8,
    ) -> Result<(), ContextError> {
        self.check_channel(channel)?;
        let lobby = self.lobby.as_ref().ok_or(ContextError::NotInLobby)?;
        let local = lobby.local_peer();
        let peers: Vec<u8> = lobby
            .members()
            .iter()
            .filter(|m| m.valid && Some(m.peer) != local && Some(m.peer) != except)
            .map(|m| m.peer)
            .collect();

        let mut first_error = None;
        for peer in peers {
            if let Err(e) = self.send_to(peer, data, packet_type, channel) {
                warn!(peer, error = %e, "send failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queued messages first, then whatever unlimited services hold on the channel.
    pub fn is_message_available(&self, channel: u8) -> bool {
        let Some(queue) = self.queues.get(channel as usize) else {
            return false;
        };
        if !queue.is_empty() {
            return true;
        }
        let physical = app_to_physical(channel);
        self.services
            .iter()
            .filter(|s| s.reliable_packet_limit() == 0)
            .any(|s| s.is_packet_available(physical).is_some())
    }

    pub fn read_message(&mut self, channel: u8) -> Option<NetworkMessage> {
        let queue = self.queues.get_mut(channel as usize)?;
        if let Some(message) = queue.pop_front() {
            return Some(message);
        }
        let physical = app_to_physical(channel);
        self.services
            .iter_mut()
            .filter(|s| s.reliable_packet_limit() == 0)
            .find_map(|s| s.read_packet(physical))
            .map(|(peer, data)| NetworkMessage::new(peer, Channel::App(channel), data))
    }

    fn with_lobby(
        &mut self,
        f: impl FnOnce(&mut Lobby) -> Result<Vec<LobbyAction>, LobbyError>,
    ) -> Result<(), ContextError> {
        let lobby = self.lobby.as_mut().ok_or(ContextError::NotInLobby)?;
        let actions = f(lobby)?;
        self.execute(actions);
        Ok(())
    }

    pub fn kick_member(&mut self, peer: u8, reason: &str) -> Result<(), ContextError> {
        info!(peer, %reason, "kicking member");
        self.with_lobby(|lobby| lobby.kick(peer, reason))
    }

    pub fn set_lobby_data(&mut self, name: &str, value: &str) -> Result<(), ContextError> {
        self.with_lobby(|lobby| lobby.set_data(name, value))
    }

    pub fn remove_lobby_data(&mut self, name: &str) -> Result<(), ContextError> {
        self.with_lobby(|lobby| lobby.remove_data(name))
    }

    pub fn set_lobby_name(&mut self, name: &str) -> Result<(), ContextError> {
        self.with_lobby(|lobby| lobby.set_name(name))
    }

    pub fn set_lobby_max_players(&mut self, max_players: u32) -> Result<(), ContextError> {
        self.with_lobby(|lobby| lobby.set_max_players(max_players))
    }

    pub fn set_member_data(&mut self, peer: u8, name: &str, value: &str) -> Result<(), ContextError> {
        self.with_lobby(|lobby| lobby.set_member_data(peer, name, value))
    }

    pub fn remove_member_data(&mut self, peer: u8, name: &str) -> Result<(), ContextError> {
        self.with_lobby(|lobby| lobby.remove_member_data(peer, name))
    }

    pub fn send_chat(&mut self, text: &str) -> Result<(), ContextError> {
        self.with_lobby(|lobby| Ok(lobby.chat(text)))
    }

    pub fn add_file(&mut self, filename: &str, content: Vec<u8>) -> Result<(), ContextError> {
        let file = LobbyFile::from_bytes(filename, content);
        debug!(%filename, size = file.size, hash = %file.hash.short(), "adding file");
        self.with_lobby(|lobby| lobby.add_file(file))
    }

    pub fn remove_file(&mut self, filename: &str) -> Result<(), ContextError> {
        self.transfers.retain(|t| t.filename != filename);
        self.with_lobby(|lobby| lobby.remove_file(filename))
    }

    pub fn request_file(&mut self, peer: u8, filename: &str) -> Result<(), ContextError> {
        self.with_lobby(|lobby| lobby.request_file(peer, filename))
    }
}

/// Log a failed lobby send. Packets over the fragment ceiling leave the receiver waiting.
fn log_undelivered(peer: u8, what: &str, size: usize, result: Result<(), ContextError>) {
    match result {
        Ok(()) => {}
        Err(e @ ContextError::Reassembly(ReassemblyError::TooManyFragments { .. })) => {
            error!(peer, packet = what, size, error = %e, "lobby packet too large for the route");
        }
        Err(e) => warn!(peer, packet = what, error = %e, "cannot deliver lobby packet"),
    }
}
