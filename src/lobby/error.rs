use crate::{chess::RulesError, gateway::protocol::ErrorCode};

/// Guard and rules violations. None of them change registry state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("Send a hello message first")]
    NotIdentified,

    #[error("Already seated in game {0}")]
    AlreadyInGame(String),

    #[error("Game {0} not found")]
    GameNotFound(String),

    #[error("Game {0} is full")]
    LobbyFull(String),

    #[error("Game {0} is not in progress")]
    GameNotActive(String),

    #[error("Not seated in game {0}")]
    NotInGame(String),

    #[error("Not your turn")]
    NotYourTurn,

    #[error("Illegal move: {0}")]
    IllegalMove(#[from] RulesError),
}

impl LobbyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LobbyError::NotIdentified => ErrorCode::NotIdentified,
            LobbyError::AlreadyInGame(_) => ErrorCode::AlreadyInGame,
            LobbyError::GameNotFound(_) => ErrorCode::GameNotFound,
            LobbyError::LobbyFull(_) => ErrorCode::LobbyFull,
            LobbyError::GameNotActive(_) => ErrorCode::GameNotActive,
            LobbyError::NotInGame(_) => ErrorCode::NotInGame,
            LobbyError::NotYourTurn => ErrorCode::NotYourTurn,
            LobbyError::IllegalMove(_) => ErrorCode::IllegalMove,
        }
    }
}

pub type LobbyResult<T> = Result<T, LobbyError>;
