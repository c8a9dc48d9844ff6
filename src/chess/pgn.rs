//! Recorded game loading.
//!
//! Reads the mainline of the first game in a PGN text and validates every
//! move against the rules engine, so callers get either a fully replayable
//! move list or a rejection.

use log::debug;
use pgn_reader::{BufferedReader, RawHeader, SanPlus, Skip, Visitor};
use serde::Serialize;

use super::rules::{GamePosition, RulesError, START_FEN};

/// A game ready to be replayed ply by ply
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedGame {
    pub start_fen: String,
    /// Mainline moves in coordinate notation
    pub uci_moves: Vec<String>,
    /// Mainline moves in standard algebraic notation
    pub san_moves: Vec<String>,
}

impl RecordedGame {
    pub fn len(&self) -> usize {
        self.uci_moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uci_moves.is_empty()
    }
}

#[derive(Default)]
struct MainlineCollector {
    fen: Option<String>,
    sans: Vec<String>,
}

impl Visitor for MainlineCollector {
    type Result = (Option<String>, Vec<String>);

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        if key == b"FEN" {
            self.fen = Some(String::from_utf8_lossy(value.0).into_owned());
        }
    }

    fn san(&mut self, san_plus: SanPlus) {
        self.sans.push(san_plus.to_string());
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn end_game(&mut self) -> Self::Result {
        (self.fen.take(), std::mem::take(&mut self.sans))
    }
}

/// Parse and validate a PGN text
pub fn load_recorded_game(text: &str) -> Result<RecordedGame, RulesError> {
    let mut reader = BufferedReader::new_cursor(text.as_bytes());
    let mut collector = MainlineCollector::default();

    let (fen, sans) = reader
        .read_game(&mut collector)
        .map_err(|e| RulesError::InvalidRecord(e.to_string()))?
        .ok_or_else(|| RulesError::InvalidRecord("no game found".to_string()))?;

    let start_fen = fen.unwrap_or_else(|| START_FEN.to_string());
    let mut position = GamePosition::from_fen(&start_fen)?;
    let mut uci_moves = Vec::with_capacity(sans.len());
    let mut san_moves = Vec::with_capacity(sans.len());

    for (i, san) in sans.iter().enumerate() {
        let applied = position.apply_move(san).map_err(|_| {
            RulesError::InvalidRecord(format!("illegal move {} at ply {}", san, i + 1))
        })?;
        uci_moves.push(applied.uci);
        san_moves.push(applied.san);
    }

    debug!("Loaded recorded game with {} plies", uci_moves.len());
    Ok(RecordedGame {
        start_fen,
        uci_moves,
        san_moves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_mainline_and_skips_variations() {
        let pgn = r#"[Event "Casual"]
[White "A"]
[Black "B"]
[Result "0-1"]

1. f3 e5 (1... d5 2. g4) 2. g4 {a blunder} Qh4# 0-1
"#;
        let game = load_recorded_game(pgn).unwrap();
        assert_eq!(game.start_fen, START_FEN);
        assert_eq!(game.uci_moves, vec!["f2f3", "e7e5", "g2g4", "d8h4"]);
        assert_eq!(game.san_moves.last().map(String::as_str), Some("Qh4#"));
        assert_eq!(game.len(), 4);
    }

    #[test]
    fn honours_fen_header() {
        let pgn = r#"[SetUp "1"]
[FEN "7k/8/6Q1/8/8/8/8/K7 w - - 0 1"]

1. Qf7 1/2-1/2
"#;
        let game = load_recorded_game(pgn).unwrap();
        assert_eq!(game.start_fen, "7k/8/6Q1/8/8/8/8/K7 w - - 0 1");
        assert_eq!(game.uci_moves, vec!["g6f7"]);
    }

    #[test]
    fn rejects_illegal_moves() {
        let err = load_recorded_game("1. e4 e5 2. Ke3 *").unwrap_err();
        assert!(matches!(err, RulesError::InvalidRecord(msg) if msg.contains("ply 3")));
    }
}
