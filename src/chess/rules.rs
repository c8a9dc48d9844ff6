//! Rules engine adapter over shakmaty.
//!
//! `GamePosition` owns a shakmaty `Chess` position plus the repetition table
//! shakmaty does not keep, and exposes the narrow surface the lobby and the
//! analysis pipeline need: apply a move, report the side to move, report
//! terminal status and encode the position as FEN.

use std::collections::HashMap;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use shakmaty::{
    fen::Fen,
    san::{San, SanPlus},
    uci::UciMove,
    CastlingMode, Chess, Color, EnPassantMode, Move, Position,
};

/// FEN of the standard starting position.
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Errors reported by the rules adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RulesError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),

    #[error("illegal move: {0}")]
    IllegalMove(String),

    #[error("unreadable move notation: {0}")]
    BadNotation(String),

    #[error("invalid game record: {0}")]
    InvalidRecord(String),
}

/// One of the two sides of the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::White => write!(f, "white"),
            Side::Black => write!(f, "black"),
        }
    }
}

/// Terminal state of a position, evaluated after a move has been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    None,
    Checkmate,
    Stalemate,
    ThreefoldRepetition,
    InsufficientMaterial,
    /// Fifty-move rule and any other claimable draw
    OtherDraw,
}

impl TerminalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TerminalStatus::None)
    }
}

/// A move accepted by the rules engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMove {
    pub san: String,
    pub uci: String,
    pub mover: Side,
    pub fen_before: String,
    pub fen_after: String,
}

/// A playable position with repetition tracking
#[derive(Debug, Clone)]
pub struct GamePosition {
    position: Chess,
    repetitions: HashMap<String, u32>,
}

impl Default for GamePosition {
    fn default() -> Self {
        Self::new()
    }
}

impl GamePosition {
    /// Standard starting position
    pub fn new() -> Self {
        Self::with_position(Chess::default())
    }

    pub fn from_fen(fen: &str) -> Result<Self, RulesError> {
        let parsed: Fen = fen
            .trim()
            .parse()
            .map_err(|e| RulesError::InvalidFen(format!("{fen}: {e}")))?;
        let position: Chess = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|e| RulesError::InvalidFen(format!("{fen}: {e}")))?;
        Ok(Self::with_position(position))
    }

    fn with_position(position: Chess) -> Self {
        let mut repetitions = HashMap::new();
        repetitions.insert(repetition_key(&position), 1);
        Self {
            position,
            repetitions,
        }
    }

    pub fn side_to_move(&self) -> Side {
        self.position.turn().into()
    }

    pub fn fen(&self) -> String {
        Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string()
    }

    pub fn fullmove_number(&self) -> u32 {
        self.position.fullmoves().get()
    }

    pub fn legal_move_count(&self) -> usize {
        self.position.legal_moves().len()
    }

    pub fn chess(&self) -> &Chess {
        &self.position
    }

    /// Resolve a move in coordinate (`e2e4`, `e7e8q`) or standard algebraic
    /// (`Nf3`, `exd5`, `O-O`) notation against the current position.
    pub fn resolve(&self, notation: &str) -> Result<Move, RulesError> {
        let notation = notation.trim();
        if notation.is_empty() {
            return Err(RulesError::BadNotation(notation.to_string()));
        }

        if let Ok(uci) = UciMove::from_ascii(notation.as_bytes()) {
            if let Ok(m) = uci.to_move(&self.position) {
                return Ok(m);
            }
        }

        let san = SanPlus::from_ascii(notation.as_bytes())
            .map(|s| s.san)
            .or_else(|_| San::from_ascii(notation.as_bytes()))
            .map_err(|_| RulesError::IllegalMove(notation.to_string()))?;
        san.to_move(&self.position)
            .map_err(|_| RulesError::IllegalMove(notation.to_string()))
    }

    /// Apply a move. On rejection the position is left untouched.
    pub fn apply_move(&mut self, notation: &str) -> Result<AppliedMove, RulesError> {
        let m = self.resolve(notation)?;
        let mover = self.side_to_move();
        let fen_before = self.fen();
        let uci = m.to_uci(CastlingMode::Standard).to_string();
        let san = SanPlus::from_move_and_play_unchecked(&mut self.position, &m).to_string();

        *self
            .repetitions
            .entry(repetition_key(&self.position))
            .or_insert(0) += 1;

        let fen_after = self.fen();
        trace!("Applied {} ({}) for {}: {}", san, uci, mover, fen_after);

        Ok(AppliedMove {
            san,
            uci,
            mover,
            fen_before,
            fen_after,
        })
    }

    /// Terminal status of the current position. Checkmate is checked first,
    /// so a mating move that also repeats a position still counts as mate.
    pub fn terminal_status(&self) -> TerminalStatus {
        let pos = &self.position;
        let status = if pos.is_checkmate() {
            TerminalStatus::Checkmate
        } else if pos.is_stalemate() {
            TerminalStatus::Stalemate
        } else if self.repetition_count() >= 3 {
            TerminalStatus::ThreefoldRepetition
        } else if pos.is_insufficient_material() {
            TerminalStatus::InsufficientMaterial
        } else if pos.halfmoves() >= 100 {
            TerminalStatus::OtherDraw
        } else {
            TerminalStatus::None
        };
        if status.is_terminal() {
            debug!("Terminal status reached: {:?}", status);
        }
        status
    }

    /// How many times the current position has occurred
    pub fn repetition_count(&self) -> u32 {
        self.repetitions
            .get(&repetition_key(&self.position))
            .copied()
            .unwrap_or(0)
    }
}

/// Board, side to move, castling rights and en passant square; clocks excluded.
fn repetition_key(position: &Chess) -> String {
    let fen = Fen::from_position(position.clone(), EnPassantMode::Legal).to_string();
    fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_all(pos: &mut GamePosition, moves: &[&str]) {
        for m in moves {
            pos.apply_move(m).unwrap();
        }
    }

    #[test]
    fn start_position_is_white_to_move() {
        let pos = GamePosition::new();
        assert_eq!(pos.side_to_move(), Side::White);
        assert_eq!(pos.fen(), START_FEN);
        assert_eq!(pos.legal_move_count(), 20);
        assert_eq!(pos.terminal_status(), TerminalStatus::None);
    }

    #[test]
    fn accepts_coordinate_and_algebraic_notation() {
        let mut pos = GamePosition::new();
        let first = pos.apply_move("e2e4").unwrap();
        assert_eq!(first.san, "e4");
        assert_eq!(first.uci, "e2e4");
        assert_eq!(first.mover, Side::White);
        assert_eq!(pos.side_to_move(), Side::Black);

        let second = pos.apply_move("Nf6").unwrap();
        assert_eq!(second.uci, "g8f6");
        assert_eq!(second.mover, Side::Black);
        assert_eq!(second.fen_before, first.fen_after);
    }

    #[test]
    fn illegal_move_leaves_position_unchanged() {
        let mut pos = GamePosition::new();
        let before = pos.fen();
        assert!(matches!(pos.apply_move("e2e5"), Err(RulesError::IllegalMove(_))));
        assert!(matches!(pos.apply_move("Qh5"), Err(RulesError::IllegalMove(_))));
        assert!(pos.apply_move("").is_err());
        assert_eq!(pos.fen(), before);
        assert_eq!(pos.repetition_count(), 1);
    }

    #[test]
    fn detects_checkmate_after_mating_move() {
        let mut pos = GamePosition::new();
        play_all(&mut pos, &["f2f3", "e7e5", "g2g4"]);
        let mate = pos.apply_move("d8h4").unwrap();
        assert_eq!(mate.san, "Qh4#");
        assert_eq!(mate.mover, Side::Black);
        assert_eq!(pos.terminal_status(), TerminalStatus::Checkmate);
        // the mated side is to move after the mating ply
        assert_eq!(pos.side_to_move(), mate.mover.opposite());
    }

    #[test]
    fn detects_stalemate() {
        let mut pos = GamePosition::from_fen("7k/8/6Q1/8/8/8/8/K7 w - - 0 1").unwrap();
        pos.apply_move("Qf7").unwrap();
        assert_eq!(pos.terminal_status(), TerminalStatus::Stalemate);
    }

    #[test]
    fn detects_threefold_repetition() {
        let mut pos = GamePosition::new();
        play_all(
            &mut pos,
            &["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1"],
        );
        assert_eq!(pos.terminal_status(), TerminalStatus::None);
        pos.apply_move("f6g8").unwrap();
        assert_eq!(pos.repetition_count(), 3);
        assert_eq!(pos.terminal_status(), TerminalStatus::ThreefoldRepetition);
    }

    #[test]
    fn detects_insufficient_material() {
        let mut pos = GamePosition::from_fen("8/8/8/4k3/8/8/3nK3/8 w - - 0 1").unwrap();
        pos.apply_move("Kxd2").unwrap();
        assert_eq!(pos.terminal_status(), TerminalStatus::InsufficientMaterial);
    }

    #[test]
    fn fifty_move_rule_is_other_draw() {
        let pos = GamePosition::from_fen("8/8/8/4k3/8/8/2R1K3/8 w - - 100 80").unwrap();
        assert_eq!(pos.terminal_status(), TerminalStatus::OtherDraw);
    }

    #[test]
    fn rejects_bad_fen() {
        assert!(matches!(
            GamePosition::from_fen("not a fen"),
            Err(RulesError::InvalidFen(_))
        ));
    }
}
