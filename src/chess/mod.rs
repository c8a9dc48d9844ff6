//! Chess rules adapter and recorded-game loading.
//!
//! Everything that needs legal-move knowledge goes through this module; the
//! lobby uses it to validate live moves and the analysis pipeline uses it to
//! replay recorded games.

pub mod pgn;
pub mod rules;

pub use pgn::{load_recorded_game, RecordedGame};
pub use rules::{AppliedMove, GamePosition, RulesError, Side, TerminalStatus, START_FEN};
