//! Domain events the embedding application pulls from `Context::poll_event` each tick.

use crate::results::{CreateLobbyResult, LobbyJoinResult, LobbyLeftResult, LobbyListResult};

/// Members are referred to by peer index; look them up with `Context::lobby` if more is needed.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    LobbyCreated(CreateLobbyResult),
    LobbyList(LobbyListResult),
    LobbyJoined(LobbyJoinResult),
    LobbyLeft(LobbyLeftResult),

    LobbyNameChanged { old: String, new: String },
    LobbyMaxPlayersChanged { old: u32, new: u32 },

    PlayerJoined { peer: u8, name: String },
    PlayerLeft { peer: u8, name: String },

    LobbyDataChanged { name: String },
    MemberDataChanged { peer: u8, name: String },

    FileAdded { peer: u8, filename: String },
    FileRemoved { peer: u8, filename: String },
    /// `receiver` asked for one of our files; the upload starts on the next tick.
    FileRequested { receiver: u8, filename: String },
    FileSendProgress {
        receiver: u8,
        filename: String,
        sent: u64,
        size: u64,
    },
    FileSendFinished { receiver: u8, filename: String },
    FileReceiveProgress {
        sender: u8,
        filename: String,
        received: u64,
        size: u64,
    },
    FileReceiveFinished {
        sender: u8,
        filename: String,
        valid: bool,
    },

    Chat { peer: u8, text: String },
}
