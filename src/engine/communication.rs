use std::collections::BTreeMap;

use log::{debug, trace, warn};
use shakmaty::{san::SanPlus, uci::UciMove};
use vampirc_uci::{
    parse_one,
    uci::{Score, ScoreValue},
    UciInfoAttribute, UciMessage,
};

use crate::chess::GamePosition;

use super::types::{
    EngineError, EngineResult, Evaluation, LineResult, SearchBudget, SearchRequest, SearchResult,
};

/// Where a session stands in the UCI exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `uci` sent, waiting for `uciok`
    Handshake,
    /// options and `isready` sent, waiting for `readyok`
    AwaitingReady,
    /// `position` and `go` sent, collecting `info` until `bestmove`
    Searching,
    Done,
}

/// What the driver should do after feeding a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write these commands, in order
    Send(Vec<String>),
    /// Nothing to do, read the next line
    Wait,
    Finished(SearchResult),
}

/// Running record for one multipv index
#[derive(Debug, Clone, Default)]
struct LineRecord {
    depth: u32,
    evaluation: Evaluation,
    uci_moves: Vec<String>,
}

/// Finite-state driver for one search.
///
/// It owns no I/O: the caller writes `opening_commands`, then feeds every
/// line the engine prints to `on_line` and acts on the returned `Step`.
#[derive(Debug)]
pub struct UciSession {
    stage: Stage,
    fen: Option<String>,
    moves: Vec<String>,
    budget: SearchBudget,
    skill: u8,
    lines_wanted: u16,
    position: GamePosition,
    records: BTreeMap<u16, LineRecord>,
}

impl UciSession {
    /// Validate the request position and resolve its settings
    pub fn new(request: &SearchRequest, default_skill: u8) -> EngineResult<Self> {
        let mut position = GamePosition::from_fen(request.base_fen())?;
        for mv in &request.moves {
            position.apply_move(mv)?;
        }

        let legal = position.legal_move_count();
        let lines_wanted = calculate_effective_multipv(request.requested_lines(), legal);
        if lines_wanted != request.requested_lines() {
            debug!(
                "MultiPV reduced from {} to {} ({} legal moves)",
                request.requested_lines(),
                lines_wanted,
                legal
            );
        }

        Ok(Self {
            stage: Stage::Handshake,
            fen: request.fen.clone(),
            moves: request.moves.clone(),
            budget: request.budget(),
            skill: request.skill(default_skill),
            lines_wanted,
            position,
            records: BTreeMap::new(),
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn lines_wanted(&self) -> u16 {
        self.lines_wanted
    }

    pub fn opening_commands(&self) -> Vec<String> {
        vec!["uci".to_string()]
    }

    /// Advance the session by one line of engine output
    pub fn on_line(&mut self, line: &str) -> EngineResult<Step> {
        let line = line.trim();
        trace!("Engine output [{:?}]: {}", self.stage, line);

        match self.stage {
            Stage::Handshake => {
                if line.ends_with("uciok") {
                    self.stage = Stage::AwaitingReady;
                    return Ok(Step::Send(self.configure_commands()));
                }
                Ok(Step::Wait)
            }
            Stage::AwaitingReady => {
                if line.ends_with("readyok") {
                    self.stage = Stage::Searching;
                    return Ok(Step::Send(vec![self.position_command(), self.go_command()]));
                }
                if line.starts_with("bestmove") {
                    return Err(EngineError::Protocol(format!(
                        "bestmove before readyok: {line}"
                    )));
                }
                Ok(Step::Wait)
            }
            Stage::Searching => {
                if line.starts_with("bestmove") {
                    let result = self.finish(line)?;
                    self.stage = Stage::Done;
                    return Ok(Step::Finished(result));
                }
                if line.starts_with("info") {
                    self.process_info_line(line);
                }
                Ok(Step::Wait)
            }
            Stage::Done => Err(EngineError::Protocol(format!(
                "output after bestmove: {line}"
            ))),
        }
    }

    fn configure_commands(&self) -> Vec<String> {
        let mut commands = vec![format!("setoption name Skill Level value {}", self.skill)];
        if self.lines_wanted > 1 {
            commands.push(format!("setoption name MultiPV value {}", self.lines_wanted));
        }
        commands.push("isready".to_string());
        commands
    }

    fn position_command(&self) -> String {
        let base = match &self.fen {
            Some(fen) => format!("position fen {fen}"),
            None => "position startpos".to_string(),
        };
        if self.moves.is_empty() {
            base
        } else {
            format!("{base} moves {}", self.moves.join(" "))
        }
    }

    fn go_command(&self) -> String {
        match self.budget {
            SearchBudget::Depth(depth) => format!("go depth {depth}"),
            SearchBudget::MoveTime(ms) => format!("go movetime {ms}"),
        }
    }

    fn process_info_line(&mut self, line: &str) {
        let attrs = match parse_one(line) {
            UciMessage::Info(attrs) => attrs,
            other => {
                debug!("Unparsed info line ({:?}): {}", other, line);
                return;
            }
        };

        let Some(update) = parse_info_attrs(attrs) else {
            return;
        };
        if update.multipv > self.lines_wanted {
            trace!("Ignoring line {} beyond requested {}", update.multipv, self.lines_wanted);
            return;
        }

        let record = self.records.entry(update.multipv).or_default();
        record.depth = update.depth;
        record.evaluation = update.evaluation;
        if !update.uci_moves.is_empty() {
            record.uci_moves = update.uci_moves;
        }
    }

    fn finish(&self, line: &str) -> EngineResult<SearchResult> {
        let mut tokens = line.split_whitespace().skip(1);
        let best_move = match tokens.next() {
            Some("(none)") | None => {
                return Err(EngineError::Protocol(format!("no best move reported: {line}")))
            }
            Some(mv) => mv.to_string(),
        };
        let ponder = match (tokens.next(), tokens.next()) {
            (Some("ponder"), Some(mv)) => Some(mv.to_string()),
            _ => None,
        };

        let lines: Vec<LineResult> = self
            .records
            .iter()
            .take(self.lines_wanted as usize)
            .map(|(&multipv, record)| LineResult {
                multipv,
                depth: record.depth,
                evaluation: record.evaluation,
                san_moves: self.san_line(&record.uci_moves),
                uci_moves: record.uci_moves.clone(),
            })
            .collect();

        if lines.is_empty() {
            warn!("Engine reported bestmove {} without any evaluation", best_move);
        }

        let primary = lines.first();
        debug!(
            "Search finished: bestmove={}, depth={}, lines={}",
            best_move,
            primary.map_or(0, |l| l.depth),
            lines.len()
        );

        Ok(SearchResult {
            best_move,
            ponder,
            evaluation: primary.map(|l| l.evaluation),
            depth: primary.map_or(0, |l| l.depth),
            pv: primary.map(|l| l.uci_moves.clone()).unwrap_or_default(),
            lines,
        })
    }

    /// Render a coordinate line in SAN, stopping at the first unplayable move
    fn san_line(&self, uci_moves: &[String]) -> Vec<String> {
        let mut pos = self.position.chess().clone();
        let mut san_moves = Vec::with_capacity(uci_moves.len());
        for mv in uci_moves {
            let Ok(uci) = UciMove::from_ascii(mv.as_bytes()) else {
                break;
            };
            let Ok(m) = uci.to_move(&pos) else {
                break;
            };
            san_moves.push(SanPlus::from_move_and_play_unchecked(&mut pos, &m).to_string());
        }
        san_moves
    }
}

/// Fields of one scored `info` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoUpdate {
    pub multipv: u16,
    pub depth: u32,
    pub evaluation: Evaluation,
    pub uci_moves: Vec<String>,
}

/// Extract multipv index, depth, score and pv. Lines without a score are
/// progress chatter (`currmove`, `string`, ...) and yield `None`.
pub fn parse_info_attrs(attrs: Vec<UciInfoAttribute>) -> Option<InfoUpdate> {
    let mut multipv = 1u16;
    let mut depth = 0u32;
    let mut evaluation = None;
    let mut uci_moves = Vec::new();

    for attr in attrs {
        match attr {
            UciInfoAttribute::Depth(d) => {
                depth = u32::try_from(u64::from(d)).unwrap_or(u32::MAX);
            }
            UciInfoAttribute::MultiPv(m) => {
                multipv = u16::try_from(u64::from(m)).unwrap_or(u16::MAX).max(1);
            }
            UciInfoAttribute::Score(Score { value, .. }) => {
                evaluation = Some(match value {
                    ScoreValue::Cp(cp) => Evaluation::Centipawns(saturate(i64::from(cp))),
                    ScoreValue::Mate(n) => Evaluation::Mate(saturate(i64::from(n))),
                });
            }
            UciInfoAttribute::Pv(moves) => {
                uci_moves = moves.iter().map(|m| m.to_string()).collect();
            }
            _ => {}
        }
    }

    evaluation.map(|evaluation| InfoUpdate {
        multipv,
        depth,
        evaluation,
        uci_moves,
    })
}

fn saturate(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// An engine cannot report more distinct lines than there are legal moves
pub fn calculate_effective_multipv(requested: u16, legal_moves: usize) -> u16 {
    requested
        .min(u16::try_from(legal_moves).unwrap_or(u16::MAX))
        .max(1)
}
