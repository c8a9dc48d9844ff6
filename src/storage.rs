//! Completed-game and puzzle-attempt records and the store they are
//! handed to.
//!
//! The lobby only produces records; where they end up is up to the
//! `GameStore` the server is built with. The in-memory store backs tests and
//! single-process deployments.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use serde::Serialize;
use uuid::Uuid;

use crate::lobby::{AccountId, EndReason, GameId, Outcome, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatRecord {
    pub participant_id: ParticipantId,
    pub account_id: Option<AccountId>,
    pub name: Option<String>,
}

/// A finished game as seen by the accounts that played it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedGame {
    pub id: GameId,
    pub white: SeatRecord,
    pub black: SeatRecord,
    /// Moves in SAN
    pub moves: Vec<String>,
    pub final_fen: String,
    pub result: Outcome,
    pub reason: EndReason,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

/// One try at a puzzle, recorded by whatever front end served it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PuzzleAttempt {
    pub id: String,
    pub puzzle_id: String,
    pub fen: String,
    /// Moves the player tried, coordinate notation
    pub moves: Vec<String>,
    pub solved: bool,
    pub time_ms: Option<u64>,
    pub attempted_at: DateTime<Utc>,
}

impl PuzzleAttempt {
    pub fn new(
        puzzle_id: impl Into<String>,
        fen: impl Into<String>,
        moves: Vec<String>,
        solved: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            puzzle_id: puzzle_id.into(),
            fen: fen.into(),
            moves,
            solved,
            time_ms: None,
            attempted_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Save/list/delete of completed games and puzzle attempts by account
pub trait GameStore: Send + Sync {
    fn save(&self, account_id: &str, game: &CompletedGame) -> Result<(), StorageError>;

    fn list(&self, account_id: &str) -> Result<Vec<CompletedGame>, StorageError>;

    /// Returns whether a record was removed
    fn delete(&self, account_id: &str, game_id: &str) -> Result<bool, StorageError>;

    fn save_attempt(&self, account_id: &str, attempt: &PuzzleAttempt) -> Result<(), StorageError>;

    fn list_attempts(&self, account_id: &str) -> Result<Vec<PuzzleAttempt>, StorageError>;

    fn delete_attempt(&self, account_id: &str, attempt_id: &str) -> Result<bool, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryGameStore {
    games: DashMap<AccountId, Vec<CompletedGame>>,
    attempts: DashMap<AccountId, Vec<PuzzleAttempt>>,
}

impl MemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GameStore for MemoryGameStore {
    fn save(&self, account_id: &str, game: &CompletedGame) -> Result<(), StorageError> {
        debug!("Storing game {} for account {}", game.id, account_id);
        self.games
            .entry(account_id.to_string())
            .or_default()
            .push(game.clone());
        Ok(())
    }

    fn list(&self, account_id: &str) -> Result<Vec<CompletedGame>, StorageError> {
        Ok(self
            .games
            .get(account_id)
            .map(|games| games.clone())
            .unwrap_or_default())
    }

    fn delete(&self, account_id: &str, game_id: &str) -> Result<bool, StorageError> {
        let Some(mut games) = self.games.get_mut(account_id) else {
            return Ok(false);
        };
        let before = games.len();
        games.retain(|g| g.id != game_id);
        Ok(games.len() != before)
    }

    fn save_attempt(&self, account_id: &str, attempt: &PuzzleAttempt) -> Result<(), StorageError> {
        debug!(
            "Storing attempt {} at puzzle {} for account {}",
            attempt.id, attempt.puzzle_id, account_id
        );
        self.attempts
            .entry(account_id.to_string())
            .or_default()
            .push(attempt.clone());
        Ok(())
    }

    fn list_attempts(&self, account_id: &str) -> Result<Vec<PuzzleAttempt>, StorageError> {
        Ok(self
            .attempts
            .get(account_id)
            .map(|attempts| attempts.clone())
            .unwrap_or_default())
    }

    fn delete_attempt(&self, account_id: &str, attempt_id: &str) -> Result<bool, StorageError> {
        let Some(mut attempts) = self.attempts.get_mut(account_id) else {
            return Ok(false);
        };
        let before = attempts.len();
        attempts.retain(|a| a.id != attempt_id);
        Ok(attempts.len() != before)
    }
}
