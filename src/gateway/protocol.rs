//! Wire format of the websocket channel.
//!
//! Every frame is a JSON object with a `type` tag; payload fields are
//! camelCase. Parsing is two-step so that an unknown tag and a bad payload
//! for a known tag produce different error codes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    chess::Side,
    lobby::{EndReason, GameId, LobbyStatus, MoveRecord, Outcome, ParticipantId},
};

// =============================================================================
// Error codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotIdentified,
    AlreadyInGame,
    GameNotFound,
    LobbyFull,
    GameNotActive,
    NotInGame,
    IllegalMove,
    NotYourTurn,
    InvalidPayload,
    UnknownType,
    RateLimited,
}

// =============================================================================
// Client -> server
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloRequest {
    /// Identity from an earlier connection, for reattachment
    pub player_id: Option<ParticipantId>,
    pub name: Option<String>,
    /// Bearer token linking the participant to an account
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateRequest {
    pub color: Option<Side>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub game_id: GameId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub game_id: GameId,
    #[serde(rename = "move")]
    pub mv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResignRequest {
    pub game_id: GameId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaveRequest {
    pub game_id: Option<GameId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello(HelloRequest),
    Create(CreateRequest),
    Join(JoinRequest),
    Move(MoveRequest),
    Resign(ResignRequest),
    Leave(LeaveRequest),
    Pong,
}

const CLIENT_TYPES: &[&str] = &["hello", "create", "join", "move", "resign", "leave", "pong"];

/// Why a frame could not be turned into a `ClientMessage`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ParseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ParseError::UnknownType(_) => ErrorCode::UnknownType,
            ParseError::InvalidPayload(_) => ErrorCode::InvalidPayload,
        }
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ParseError::InvalidPayload(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::InvalidPayload("missing type tag".to_string()))?;
        if !CLIENT_TYPES.contains(&kind) {
            return Err(ParseError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ParseError::InvalidPayload(e.to_string()))
    }
}

// =============================================================================
// Server -> client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub player_id: ParticipantId,
    pub name: Option<String>,
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPayload {
    pub game_id: GameId,
    pub color: Side,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub id: ParticipantId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub game_id: GameId,
    pub fen: String,
    pub turn: Side,
    /// Recipient's side
    pub color: Side,
    pub white: PlayerInfo,
    pub black: PlayerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePayload {
    pub game_id: GameId,
    pub fen: String,
    pub color: Side,
    pub turn: Side,
    pub moves: Vec<MoveRecord>,
    pub status: LobbyStatus,
    pub result: Option<Outcome>,
    pub reason: Option<EndReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    pub game_id: GameId,
    pub san: String,
    pub uci: String,
    pub by: Side,
    pub fen: String,
    pub turn: Side,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOverPayload {
    pub game_id: GameId,
    pub result: Outcome,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentDisconnectPayload {
    pub game_id: GameId,
    pub grace_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeftPayload {
    pub game_id: GameId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello(HelloPayload),
    Created(CreatedPayload),
    Start(StartPayload),
    Resume(ResumePayload),
    Move(MovePayload),
    GameOver(GameOverPayload),
    OpponentDisconnect(OpponentDisconnectPayload),
    Left(LeftPayload),
    Error(ErrorPayload),
    Ping,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
