//! Game review: replays a recorded game and grades each move.
//!
//! For every ply the engine is asked twice: once before the move, for the
//! best achievable score and the line that gets it, and once after, for
//! what the played move actually leaves. Both are put on the mover's
//! centipawn scale and the difference is graded against three thresholds.
//! Engine failures are recorded per ply and the review carries on; a move
//! the rules reject ends the review.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::chess::{load_recorded_game, GamePosition, RulesError, Side, TerminalStatus};

use super::{
    types::{Evaluation, SearchRequest, SearchResult, MATE_SCORE_BASE},
    SearchEngine,
};

// =============================================================================
// Types
// =============================================================================

/// Move quality tiers, mildest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Inaccuracy,
    Mistake,
    Blunder,
}

/// Centipawn losses at which each tier starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thresholds {
    pub inaccuracy: i32,
    pub mistake: i32,
    pub blunder: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            inaccuracy: 50,
            mistake: 100,
            blunder: 250,
        }
    }
}

impl Thresholds {
    /// Highest tier whose threshold the loss meets
    pub fn classify(&self, delta: i32) -> Option<Severity> {
        if delta >= self.blunder {
            Some(Severity::Blunder)
        } else if delta >= self.mistake {
            Some(Severity::Mistake)
        } else if delta >= self.inaccuracy {
            Some(Severity::Inaccuracy)
        } else {
            None
        }
    }
}

/// What to review and how hard to search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    /// Starting position; the standard one when absent
    pub fen: Option<String>,
    /// Played moves, coordinate or algebraic notation
    #[serde(default)]
    pub moves: Vec<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
    pub depth: Option<u32>,
    pub movetime_ms: Option<u64>,
    pub skill_level: Option<u8>,
    /// Candidate lines requested for the pre-move search
    pub multipv: Option<u16>,
    pub timeout_ms: Option<u64>,
    /// Review at most this many plies
    pub max_plies: Option<usize>,
}

impl AnalysisRequest {
    /// Review the mainline of a PGN text
    pub fn from_pgn(text: &str) -> Result<Self, RulesError> {
        let game = load_recorded_game(text)?;
        Ok(Self {
            fen: Some(game.start_fen),
            moves: game.uci_moves,
            ..Self::default()
        })
    }

    fn search_at(&self, fen: String, multipv: Option<u16>) -> SearchRequest {
        SearchRequest {
            fen: Some(fen),
            moves: Vec::new(),
            depth: self.depth,
            movetime_ms: self.movetime_ms,
            skill_level: self.skill_level,
            multipv,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// A graded move
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub severity: Severity,
    /// Centipawns lost against the best line
    pub delta: i32,
    /// Score the played move leaves, mover's perspective
    pub actual: i32,
    /// Best achievable score, mover's perspective
    pub best: i32,
    pub best_move: String,
    /// Recommended line in SAN
    pub best_line: Vec<String>,
}

/// One entry of the evaluation timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlyAnalysis {
    /// 1-based half-move index
    pub ply: usize,
    pub move_number: u32,
    pub side: Side,
    pub san: String,
    pub uci: String,
    pub fen_before: String,
    pub fen_after: String,
    /// Engine view after the move, from the side then to move
    pub evaluation: Option<Evaluation>,
    /// Position score after the move on the common scale, White's perspective
    pub score: Option<i32>,
    pub annotation: Option<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlyError {
    pub ply: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub timeline: Vec<PlyAnalysis>,
    pub flagged: Vec<PlyAnalysis>,
    pub errors: Vec<PlyError>,
    /// Set when a move was rejected and the review ended before the last ply
    pub stopped_early: bool,
}

// =============================================================================
// Analyzer
// =============================================================================

/// Reviews games against a search engine, one search at a time
pub struct GameAnalyzer<E: SearchEngine> {
    engine: E,
}

impl<E: SearchEngine> GameAnalyzer<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Review every ply of the request. Only an unusable starting position
    /// fails the call; everything else ends up in the report.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisReport, RulesError> {
        let mut position = match &request.fen {
            Some(fen) => GamePosition::from_fen(fen)?,
            None => GamePosition::new(),
        };

        let total = request
            .max_plies
            .map_or(request.moves.len(), |cap| cap.min(request.moves.len()));
        info!("Analyzing {} plies", total);

        let mut report = AnalysisReport::default();

        for (index, played) in request.moves.iter().take(total).enumerate() {
            let ply = index + 1;
            let move_number = position.fullmove_number();

            // 1. best achievable before the move
            let before = self
                .engine
                .search(&request.search_at(position.fen(), request.multipv))
                .await
                .map_err(|e| record(&mut report, ply, format!("pre-move search failed: {e}")))
                .ok();

            // 2. the played move
            let applied = match position.apply_move(played) {
                Ok(applied) => applied,
                Err(e) => {
                    warn!("Stopping analysis at ply {}: {}", ply, e);
                    record(&mut report, ply, e.to_string());
                    report.stopped_early = true;
                    break;
                }
            };

            // 3. what the move actually left, from the opponent's chair
            let after = match position.terminal_status() {
                TerminalStatus::None => self
                    .engine
                    .search(&request.search_at(applied.fen_after.clone(), Some(1)))
                    .await
                    .map_err(|e| record(&mut report, ply, format!("post-move search failed: {e}")))
                    .ok()
                    .and_then(|result| match result.evaluation {
                        Some(eval) => Some(eval),
                        None => {
                            record(&mut report, ply, "post-move search returned no score".into());
                            None
                        }
                    }),
                TerminalStatus::Checkmate => Some(Evaluation::Mate(0)),
                _ => Some(Evaluation::Centipawns(0)),
            };

            let actual = after.map(|eval| mover_score(eval, position.terminal_status()));
            let annotation = match (&before, actual) {
                (Some(before), Some(actual)) => {
                    grade(&request.thresholds, before, actual)
                }
                _ => None,
            };

            if let Some(annotation) = &annotation {
                debug!(
                    "Ply {} {} graded {:?} (best {}, actual {})",
                    ply, applied.san, annotation.severity, annotation.best, annotation.actual
                );
            }

            let entry = PlyAnalysis {
                ply,
                move_number,
                side: applied.mover,
                score: actual.map(|cp| match applied.mover {
                    Side::White => cp,
                    Side::Black => -cp,
                }),
                san: applied.san,
                uci: applied.uci,
                fen_before: applied.fen_before,
                fen_after: applied.fen_after,
                evaluation: after,
                annotation,
            };
            if entry.annotation.is_some() {
                report.flagged.push(entry.clone());
            }
            report.timeline.push(entry);
        }

        info!(
            "Analysis finished: {} plies, {} flagged, {} errors",
            report.timeline.len(),
            report.flagged.len(),
            report.errors.len()
        );
        Ok(report)
    }
}

fn record(report: &mut AnalysisReport, ply: usize, message: String) {
    warn!("Analysis error at ply {}: {}", ply, message);
    report.errors.push(PlyError { ply, message });
}

/// Score of the position after a move, from the mover's side. A mated
/// opponent counts as the full mate bonus for the mover.
fn mover_score(after: Evaluation, status: TerminalStatus) -> i32 {
    match status {
        TerminalStatus::Checkmate => MATE_SCORE_BASE,
        _ => -after.to_centipawns(),
    }
}

fn grade(thresholds: &Thresholds, before: &SearchResult, actual: i32) -> Option<Annotation> {
    let best = before.evaluation?.to_centipawns();
    let delta = best - actual;
    let severity = thresholds.classify(delta)?;
    Some(Annotation {
        severity,
        delta,
        actual,
        best,
        best_move: before.best_move.clone(),
        best_line: before
            .primary()
            .map(|line| line.san_moves.clone())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::engine::types::{EngineError, EngineResult, LineResult};

    /// Answers from a table keyed by FEN; `None` entries fail the search
    #[derive(Default)]
    struct ScriptedEngine {
        scores: HashMap<String, Option<Evaluation>>,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn with(mut self, fen: String, eval: Option<Evaluation>) -> Self {
            self.scores.insert(fen, eval);
            self
        }
    }

    #[async_trait]
    impl SearchEngine for ScriptedEngine {
        async fn search(&self, request: &SearchRequest) -> EngineResult<SearchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fen = request.base_fen().to_string();
            let eval = match self.scores.get(&fen) {
                Some(None) => return Err(EngineError::Protocol("scripted failure".into())),
                Some(Some(eval)) => *eval,
                None => Evaluation::Centipawns(0),
            };
            Ok(SearchResult {
                best_move: "g1f3".into(),
                evaluation: Some(eval),
                depth: 12,
                lines: vec![LineResult {
                    evaluation: eval,
                    san_moves: vec!["Nf3".into()],
                    uci_moves: vec!["g1f3".into()],
                    ..LineResult::default()
                }],
                ..SearchResult::default()
            })
        }
    }

    fn fen_after(moves: &[&str]) -> String {
        let mut pos = GamePosition::new();
        for m in moves {
            pos.apply_move(m).unwrap();
        }
        pos.fen()
    }

    fn request(moves: &[&str]) -> AnalysisRequest {
        AnalysisRequest {
            moves: moves.iter().map(|m| m.to_string()).collect(),
            ..AnalysisRequest::default()
        }
    }

    #[test]
    fn highest_met_tier_wins() {
        let t = Thresholds::default();
        assert_eq!(t.classify(49), None);
        assert_eq!(t.classify(50), Some(Severity::Inaccuracy));
        assert_eq!(t.classify(120), Some(Severity::Mistake));
        assert_eq!(t.classify(250), Some(Severity::Blunder));
        assert_eq!(t.classify(-400), None);
    }

    #[tokio::test]
    async fn single_swing_yields_one_blunder() {
        let moves = ["e2e4", "e7e5", "g1f3", "b8c6"];
        // after 1...e5 White is suddenly 300 up and keeps it with 2.Nf3
        let engine = ScriptedEngine::default()
            .with(fen_after(&moves[..2]), Some(Evaluation::Centipawns(300)))
            .with(fen_after(&moves[..3]), Some(Evaluation::Centipawns(-300)));
        let analyzer = GameAnalyzer::new(engine);

        let report = analyzer.analyze(&request(&moves)).await.unwrap();

        assert_eq!(report.timeline.len(), 4);
        assert!(report.errors.is_empty());
        assert_eq!(report.flagged.len(), 1);
        let flagged = &report.flagged[0];
        assert_eq!(flagged.ply, 2);
        assert_eq!(flagged.side, Side::Black);
        assert_eq!(flagged.san, "e5");
        let annotation = flagged.annotation.as_ref().unwrap();
        assert_eq!(annotation.severity, Severity::Blunder);
        assert_eq!(annotation.delta, 300);
        assert_eq!(annotation.actual, -300);
        assert_eq!(annotation.best_line, vec!["Nf3"]);
        // timeline scores are from White's side
        assert_eq!(report.timeline[1].score, Some(300));
    }

    #[tokio::test]
    async fn engine_failures_are_recorded_and_skipped() {
        let moves = ["e2e4", "e7e5", "g1f3"];
        let engine = ScriptedEngine::default().with(fen_after(&moves[..1]), None);
        let analyzer = GameAnalyzer::new(engine);

        let report = analyzer.analyze(&request(&moves)).await.unwrap();

        assert_eq!(report.timeline.len(), 3);
        assert!(!report.stopped_early);
        // post-move search of ply 1 and pre-move search of ply 2 share a position
        let plies: Vec<usize> = report.errors.iter().map(|e| e.ply).collect();
        assert_eq!(plies, vec![1, 2]);
        assert_eq!(report.timeline[0].evaluation, None);
        assert!(report.flagged.is_empty());
    }

    #[tokio::test]
    async fn rejected_move_stops_review() {
        let analyzer = GameAnalyzer::new(ScriptedEngine::default());

        let report = analyzer
            .analyze(&request(&["e2e4", "e7e4", "g1f3"]))
            .await
            .unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.timeline.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].ply, 2);
    }

    #[tokio::test]
    async fn mating_move_skips_post_search() {
        let moves = ["f2f3", "e7e5", "g2g4", "d8h4"];
        let engine = ScriptedEngine::default()
            .with(fen_after(&moves[..3]), Some(Evaluation::Mate(1)));
        let analyzer = GameAnalyzer::new(engine);

        let report = analyzer.analyze(&request(&moves)).await.unwrap();

        // four pre-move searches, three post-move searches
        assert_eq!(analyzer.engine.calls.load(Ordering::SeqCst), 7);
        let last = report.timeline.last().unwrap();
        assert_eq!(last.san, "Qh4#");
        assert_eq!(last.evaluation, Some(Evaluation::Mate(0)));
        assert_eq!(last.score, Some(-MATE_SCORE_BASE));
        assert!(last.annotation.is_none());
    }

    #[tokio::test]
    async fn respects_ply_cap_and_pgn_input() {
        let mut req = AnalysisRequest::from_pgn("1. e4 e5 2. Nf3 Nc6 3. Bb5 *").unwrap();
        req.max_plies = Some(2);
        let analyzer = GameAnalyzer::new(ScriptedEngine::default());

        let report = analyzer.analyze(&req).await.unwrap();

        assert_eq!(report.timeline.len(), 2);
        assert_eq!(report.timeline[1].move_number, 1);
        assert!(!report.stopped_early);
    }

    #[tokio::test]
    async fn bad_start_position_fails_the_call() {
        let analyzer = GameAnalyzer::new(ScriptedEngine::default());
        let req = AnalysisRequest {
            fen: Some("nonsense".into()),
            ..AnalysisRequest::default()
        };
        assert!(analyzer.analyze(&req).await.is_err());
    }
}
