//! Two-player lobbies and the participants who sit in them.
//!
//! A lobby moves `waiting -> active -> completed` and is dropped from the
//! registry as soon as it completes or empties. Disconnected players keep
//! their seat for a grace period tracked by [`GraceTimers`].

pub mod error;
pub mod registry;
pub mod timers;
pub mod types;

pub use error::{LobbyError, LobbyResult};
pub use registry::Registry;
pub use timers::{GraceTicket, GraceTimers};
pub use types::{
    AccountId, EndReason, GameId, GameResult, Lobby, LobbyStatus, MoveRecord, Outcome,
    Participant, ParticipantId,
};
