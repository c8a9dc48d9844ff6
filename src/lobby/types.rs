use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    chess::{GamePosition, Side, TerminalStatus},
    gateway::Connection,
};

pub type ParticipantId = String;
pub type GameId = String;
pub type AccountId = String;

/// Length of the shareable lobby code
pub const GAME_ID_LEN: usize = 6;

// =============================================================================
// Participants
// =============================================================================

/// A remote player, identified across reconnects by `id`
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: Option<String>,
    pub account_id: Option<AccountId>,
    /// Live connection; `None` while disconnected
    pub connection: Option<Connection>,
    pub game_id: Option<GameId>,
    pub side: Option<Side>,
    pub last_seen: Instant,
    /// Set when a ping went out and no pong has come back yet
    pub ping_sent_at: Option<Instant>,
    pub disconnected_at: Option<Instant>,
}

impl Participant {
    pub fn new(id: ParticipantId, connection: Connection, now: Instant) -> Self {
        Self {
            id,
            name: None,
            account_id: None,
            connection: Some(connection),
            game_id: None,
            side: None,
            last_seen: now,
            ping_sent_at: None,
            disconnected_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Drop the seat reference after a lobby ends or is abandoned
    pub fn clear_seat(&mut self) {
        self.game_id = None;
        self.side = None;
    }
}

// =============================================================================
// Lobbies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LobbyStatus {
    Waiting,
    Active,
    Completed,
}

/// Winner token on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    White,
    Black,
    Draw,
}

impl From<Side> for Outcome {
    fn from(side: Side) -> Self {
        match side {
            Side::White => Outcome::White,
            Side::Black => Outcome::Black,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Checkmate,
    Stalemate,
    ThreefoldRepetition,
    InsufficientMaterial,
    Draw,
    Resign,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameResult {
    pub result: Outcome,
    pub reason: EndReason,
}

impl GameResult {
    /// Result implied by a terminal position; `mover` made the last move
    pub fn from_terminal(status: TerminalStatus, mover: Side) -> Option<Self> {
        let (result, reason) = match status {
            TerminalStatus::None => return None,
            TerminalStatus::Checkmate => (mover.into(), EndReason::Checkmate),
            TerminalStatus::Stalemate => (Outcome::Draw, EndReason::Stalemate),
            TerminalStatus::ThreefoldRepetition => (Outcome::Draw, EndReason::ThreefoldRepetition),
            TerminalStatus::InsufficientMaterial => {
                (Outcome::Draw, EndReason::InsufficientMaterial)
            }
            TerminalStatus::OtherDraw => (Outcome::Draw, EndReason::Draw),
        };
        Some(Self { result, reason })
    }

    /// The side that did not give up wins
    pub fn forfeit(by: Side, reason: EndReason) -> Self {
        Self {
            result: by.opposite().into(),
            reason,
        }
    }
}

/// One applied move in a lobby's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRecord {
    pub mover: ParticipantId,
    pub side: Side,
    pub san: String,
    pub uci: String,
    /// Position after the move
    pub fen: String,
    pub at: DateTime<Utc>,
}

/// A two-seat game room
#[derive(Debug)]
pub struct Lobby {
    pub id: GameId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub host: ParticipantId,
    pub host_side: Side,
    pub guest: Option<ParticipantId>,
    pub position: GamePosition,
    pub moves: Vec<MoveRecord>,
    pub status: LobbyStatus,
    pub result: Option<GameResult>,
}

impl Lobby {
    pub fn new(id: GameId, host: ParticipantId, host_side: Side) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            host,
            host_side,
            guest: None,
            position: GamePosition::new(),
            moves: Vec::new(),
            status: LobbyStatus::Waiting,
            result: None,
        }
    }

    /// Seat the guest and start from the initial position
    pub fn activate(&mut self, guest: ParticipantId) {
        self.guest = Some(guest);
        self.position = GamePosition::new();
        self.moves.clear();
        self.result = None;
        self.status = LobbyStatus::Active;
        self.started_at = Some(Utc::now());
    }

    pub fn is_seated(&self, pid: &str) -> bool {
        self.host == pid || self.guest.as_deref() == Some(pid)
    }

    pub fn side_of(&self, pid: &str) -> Option<Side> {
        if self.host == pid {
            Some(self.host_side)
        } else if self.guest.as_deref() == Some(pid) {
            Some(self.host_side.opposite())
        } else {
            None
        }
    }

    pub fn seat(&self, side: Side) -> Option<&ParticipantId> {
        if side == self.host_side {
            Some(&self.host)
        } else {
            self.guest.as_ref()
        }
    }

    /// Occupied seats, host first
    pub fn seated(&self) -> Vec<ParticipantId> {
        std::iter::once(self.host.clone())
            .chain(self.guest.clone())
            .collect()
    }

    pub fn opponent_of(&self, pid: &str) -> Option<&ParticipantId> {
        if self.host == pid {
            self.guest.as_ref()
        } else if self.guest.as_deref() == Some(pid) {
            Some(&self.host)
        } else {
            None
        }
    }
}
