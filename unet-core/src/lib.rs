//! unet core: a lobby and session layer over several matchmaking/transport backends at once.
//!
//! Poll-driven and single-threaded. The embedding program enables one or more
//! [`Service`] backends on a [`Context`], calls [`Context::run_callbacks`] every tick
//! and drains [`Context::poll_event`].

pub mod config;
pub mod context;
pub mod data;
pub mod event;
pub mod file;
pub mod identity;
pub mod integrity;
pub mod lobby;
pub mod member;
pub mod memory;
pub mod message;
pub mod multi_callback;
pub mod protocol;
pub mod reassembly;
pub mod results;
pub mod service;
pub mod wire;

pub use config::ContextConfig;
pub use context::{Context, ContextError, ContextStatus};
pub use data::{LobbyData, LobbyDataContainer};
pub use event::Event;
pub use identity::Guid;
pub use lobby::{Lobby, LobbyInfo, LobbyPrivacy};
pub use member::LobbyMember;
pub use memory::{MemoryNetwork, MemoryService, Operation};
pub use message::{Channel, NetworkMessage};
pub use results::{
    CreateLobbyResult, LeaveReason, LobbyJoinResult, LobbyLeftResult, LobbyListResult, ResultCode,
};
pub use service::{PacketType, Service, ServiceError, ServiceEvent, ServiceId, ServiceKind};
