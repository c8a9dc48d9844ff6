use std::{path::PathBuf, time::Duration};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::chess::{RulesError, START_FEN};

// =============================================================================
// Constants
// =============================================================================

/// Search time used when neither a depth nor a move time is requested
pub const DEFAULT_MOVETIME_MS: u64 = 1000;

/// Timeout for a whole search session when the caller supplies none
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `quit` is given before the process is killed
pub const ENGINE_QUIT_GRACE: Duration = Duration::from_millis(500);

/// Upper bound for parallel candidate lines
pub const MAX_MULTIPV: u16 = 5;

/// Upper bound for the engine strength setting
pub const MAX_SKILL_LEVEL: u8 = 20;

/// Scale used to place forced mates above any centipawn value
pub const MATE_SCORE_BASE: i32 = 100_000;

/// Score lost per move of mate distance
pub const MATE_SCORE_STEP: i32 = 1_000;

/// Mate distances beyond this are scored as if they were this far
pub const MATE_DISTANCE_CAP: i32 = 100;

/// Number of stderr lines kept for failure diagnostics
pub const STDERR_TAIL_LINES: usize = 20;

// =============================================================================
// Error Types
// =============================================================================

/// Failures of a single search session
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No engine binary configured")]
    NotConfigured,

    #[error("Failed to spawn engine {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No stdin handle available")]
    NoStdin,

    #[error("No stdout handle available")]
    NoStdout,

    #[error("Engine did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    #[error("Engine exited before reporting a best move: {diagnostics}")]
    PrematureExit { diagnostics: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid search position: {0}")]
    InvalidPosition(#[from] RulesError),
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Search Requests
// =============================================================================

/// How long the engine is allowed to think
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "t", content = "c")]
pub enum SearchBudget {
    Depth(u32),
    MoveTime(u64),
}

/// A single search: position, budget, strength and line count
#[derive(Deserialize, Serialize, Debug, Clone, Derivative, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[derivative(Default)]
pub struct SearchRequest {
    /// Base position; the standard start position when absent
    pub fen: Option<String>,
    /// Moves replayed onto the base position, coordinate notation
    #[serde(default)]
    pub moves: Vec<String>,
    pub depth: Option<u32>,
    pub movetime_ms: Option<u64>,
    pub skill_level: Option<u8>,
    pub multipv: Option<u16>,
    pub timeout_ms: Option<u64>,
}

impl SearchRequest {
    pub fn from_fen(fen: impl Into<String>) -> Self {
        Self {
            fen: Some(fen.into()),
            ..Self::default()
        }
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn multipv(mut self, lines: u16) -> Self {
        self.multipv = Some(lines);
        self
    }

    pub fn base_fen(&self) -> &str {
        self.fen.as_deref().unwrap_or(START_FEN)
    }

    /// Depth wins over move time when both are present
    pub fn budget(&self) -> SearchBudget {
        match (self.depth, self.movetime_ms) {
            (Some(depth), _) => SearchBudget::Depth(depth),
            (None, Some(ms)) => SearchBudget::MoveTime(ms),
            (None, None) => SearchBudget::MoveTime(DEFAULT_MOVETIME_MS),
        }
    }

    pub fn requested_lines(&self) -> u16 {
        self.multipv.unwrap_or(1).clamp(1, MAX_MULTIPV)
    }

    pub fn skill(&self, default: u8) -> u8 {
        self.skill_level.unwrap_or(default).min(MAX_SKILL_LEVEL)
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

// =============================================================================
// Search Results
// =============================================================================

/// Engine evaluation from the side to move's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Evaluation {
    Centipawns(i32),
    /// Forced mate in N moves; negative when the side to move gets mated
    Mate(i32),
}

impl Default for Evaluation {
    fn default() -> Self {
        Evaluation::Centipawns(0)
    }
}

impl Evaluation {
    /// Common centipawn scale. A mate in N maps to
    /// `sign(N) * (100000 - min(|N|, 100) * 1000)`, so every mate outranks any
    /// centipawn score and closer mates outrank distant ones. `Mate(0)` means
    /// the side to move is already mated.
    pub fn to_centipawns(self) -> i32 {
        match self {
            Evaluation::Centipawns(cp) => cp,
            Evaluation::Mate(0) => -MATE_SCORE_BASE,
            Evaluation::Mate(n) => {
                n.signum() * (MATE_SCORE_BASE - n.abs().min(MATE_DISTANCE_CAP) * MATE_SCORE_STEP)
            }
        }
    }

    /// Same evaluation seen from the other side
    pub fn negate(self) -> Self {
        match self {
            Evaluation::Centipawns(cp) => Evaluation::Centipawns(-cp),
            Evaluation::Mate(n) => Evaluation::Mate(-n),
        }
    }
}

/// One candidate line of a multi-line search
#[derive(Clone, Serialize, Debug, Derivative, PartialEq, Eq)]
#[derivative(Default)]
#[serde(rename_all = "camelCase")]
pub struct LineResult {
    #[derivative(Default(value = "1"))]
    pub multipv: u16,
    pub depth: u32,
    pub evaluation: Evaluation,
    pub uci_moves: Vec<String>,
    pub san_moves: Vec<String>,
}

/// Outcome of a completed search
#[derive(Clone, Serialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub best_move: String,
    pub ponder: Option<String>,
    pub evaluation: Option<Evaluation>,
    pub depth: u32,
    pub pv: Vec<String>,
    pub lines: Vec<LineResult>,
}

impl SearchResult {
    pub fn primary(&self) -> Option<&LineResult> {
        self.lines.first()
    }
}

// =============================================================================
// Engine Settings and Logs
// =============================================================================

/// Where the engine lives and how it is driven by default
#[derive(Debug, Clone, Derivative)]
#[derivative(Default)]
pub struct EngineSettings {
    pub path: Option<PathBuf>,
    #[derivative(Default(value = "DEFAULT_SEARCH_TIMEOUT"))]
    pub default_timeout: Duration,
    #[derivative(Default(value = "MAX_SKILL_LEVEL"))]
    pub default_skill: u8,
}

/// Protocol traffic of one session, kept for diagnostics
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum EngineLog {
    Gui(String),
    Engine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mates_outrank_centipawns() {
        let big_cp = Evaluation::Centipawns(50_000).to_centipawns();
        assert!(Evaluation::Mate(5).to_centipawns() > big_cp);
        assert!(Evaluation::Mate(-5).to_centipawns() < -big_cp);
        assert!(Evaluation::Mate(1).to_centipawns() > Evaluation::Mate(5).to_centipawns());
        assert!(Evaluation::Mate(-1).to_centipawns() < Evaluation::Mate(-5).to_centipawns());
    }

    #[test]
    fn mate_scale_matches_formula() {
        assert_eq!(Evaluation::Mate(3).to_centipawns(), 97_000);
        assert_eq!(Evaluation::Mate(-2).to_centipawns(), -98_000);
        assert_eq!(Evaluation::Mate(250).to_centipawns(), 0);
        assert_eq!(Evaluation::Mate(0).to_centipawns(), -MATE_SCORE_BASE);
    }

    #[test]
    fn negate_flips_perspective() {
        assert_eq!(Evaluation::Centipawns(35).negate(), Evaluation::Centipawns(-35));
        assert_eq!(Evaluation::Mate(2).negate(), Evaluation::Mate(-2));
    }

    #[test]
    fn depth_takes_precedence_over_movetime() {
        let mut request = SearchRequest::default();
        assert_eq!(request.budget(), SearchBudget::MoveTime(DEFAULT_MOVETIME_MS));
        request.movetime_ms = Some(250);
        assert_eq!(request.budget(), SearchBudget::MoveTime(250));
        request.depth = Some(12);
        assert_eq!(request.budget(), SearchBudget::Depth(12));
    }

    #[test]
    fn bounds_are_clamped() {
        let mut request = SearchRequest::default();
        assert_eq!(request.requested_lines(), 1);
        request.multipv = Some(0);
        assert_eq!(request.requested_lines(), 1);
        request.multipv = Some(40);
        assert_eq!(request.requested_lines(), MAX_MULTIPV);
        request.skill_level = Some(99);
        assert_eq!(request.skill(10), MAX_SKILL_LEVEL);
        assert_eq!(SearchRequest::default().skill(10), 10);
    }
}
