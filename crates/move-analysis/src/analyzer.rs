//! Game analysis with move quality classification.
//!
//! This module provides the [`GameAnalyzer`], which walks a recorded game
//! ply by ply, evaluates the position before and after every move and
//! classifies the move actually played.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use shakmaty::{Chess, Color, Move, Position};
use thiserror::Error;
use tracing::{debug, debug_span, info, warn};

use crate::engine::{EngineLauncher, EngineResult, LaunchError, PositionAnalyzer, SearchLimit};
use crate::game::Game;
use crate::narrative::{build_prompt, Narrator};
use crate::quality::{ClassifierKind, MoveFacts, QualityLabel};
use crate::rules::{self, RulesError};

/// Errors that end an analysis run.
///
/// Failures of a single engine query are not errors here: they degrade
/// the affected record instead.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    /// The engine could not be started.
    #[error("Engine error: {0}")]
    Launch(#[from] LaunchError),
    /// There is no move to analyze.
    #[error("No moves to analyze")]
    MissingInput,
    /// Invalid game data was provided.
    #[error("Invalid game data: {0}")]
    InvalidGame(#[from] RulesError),
    /// The run was cancelled; holds the records completed before that.
    #[error("Analysis cancelled after {} moves", .records.len())]
    Cancelled { records: Vec<AnalysisRecord> },
}

/// Lifecycle of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkState {
    #[default]
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Shared flag to stop a run between plies.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Analysis of a single ply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    /// Ply index, starting at 0.
    pub ply: usize,
    /// Move played, in SAN.
    pub move_san: String,
    /// Move played, in UCI notation.
    pub move_uci: String,
    /// FEN of the position the move was played from.
    pub position_before: String,
    /// White-relative evaluation in pawns before the move.
    pub eval_before: Option<f64>,
    /// White-relative evaluation in pawns after the move.
    pub eval_after: Option<f64>,
    /// Engine's best move in UCI notation.
    pub best_move: Option<String>,
    /// Engine's best move in SAN.
    pub best_move_san: Option<String>,
    /// Engine's principal variation from the position before, in SAN.
    pub best_line: Vec<String>,
    /// Quality label, absent when either evaluation is unavailable.
    pub quality: Option<QualityLabel>,
    /// Strategy that produced `quality`.
    pub classifier: ClassifierKind,
    /// Generated commentary, absent when no narrator is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commentary: Option<String>,
}

/// Configuration for game analysis.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Strategy used to label moves.
    pub classifier: ClassifierKind,
    /// Plies from the start that count as known theory.
    pub opening_book_plies: usize,
    /// How much worse, in pawns, the second-best line must be for the best
    /// move to be the only good move.
    pub only_move_margin: f64,
    /// Player level the commentary is written for.
    pub audience: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::Simplified,
            opening_book_plies: 0,
            only_move_margin: 1.5,
            audience: "beginner".to_string(),
        }
    }
}

/// Walks games and classifies each move.
///
/// Every call to [`GameAnalyzer::run`] acquires its own analyzer from the
/// launcher and releases it before returning.
pub struct GameAnalyzer<L: EngineLauncher> {
    launcher: L,
    config: AnalysisConfig,
    narrator: Option<Box<dyn Narrator>>,
    cancel: CancelToken,
    state: WalkState,
}

impl<L: EngineLauncher> GameAnalyzer<L> {
    pub fn new(launcher: L, config: AnalysisConfig) -> Self {
        Self {
            launcher,
            config,
            narrator: None,
            cancel: CancelToken::new(),
            state: WalkState::Idle,
        }
    }

    /// Attach a commentary generator.
    pub fn with_narrator(mut self, narrator: Box<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    /// Use `token` to cancel runs of this analyzer.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyzes the first `max_moves` plies of `game` (all of them when `None`).
    ///
    /// Both evaluations of a record come from the same analyzer and the same
    /// `limit`, so comparing the played move with the engine's best move is
    /// meaningful.
    ///
    /// # Errors
    ///
    /// - `AnalyzerError::MissingInput` if the game has no moves; no engine is started
    /// - `AnalyzerError::Launch` if the engine cannot be started
    /// - `AnalyzerError::Cancelled` if the cancel token fired during the run
    pub fn run(
        &mut self,
        game: &Game,
        limit: SearchLimit,
        max_moves: Option<usize>,
    ) -> Result<Vec<AnalysisRecord>, AnalyzerError> {
        if game.is_empty() {
            return Err(AnalyzerError::MissingInput);
        }

        let plies = max_moves.map_or(game.len(), |max| max.min(game.len()));
        if plies == 0 {
            self.state = WalkState::Completed;
            return Ok(Vec::new());
        }

        self.state = WalkState::Running;
        let mut engine = match self.launcher.launch() {
            Ok(engine) => engine,
            Err(e) => {
                self.state = WalkState::Aborted;
                return Err(e.into());
            }
        };

        info!(plies, %limit, classifier = %self.config.classifier, "analysis started");
        let outcome = self.walk(&mut engine, game, limit, plies);
        engine.close();

        self.state = if outcome.is_ok() {
            WalkState::Completed
        } else {
            WalkState::Aborted
        };
        match &outcome {
            Ok(records) => info!(records = records.len(), "analysis finished"),
            Err(e) => warn!(error = %e, "analysis aborted"),
        }
        outcome
    }

    fn walk<A: PositionAnalyzer>(
        &mut self,
        engine: &mut A,
        game: &Game,
        limit: SearchLimit,
        plies: usize,
    ) -> Result<Vec<AnalysisRecord>, AnalyzerError> {
        if let Err(e) = engine.new_game() {
            warn!(error = %e, "ucinewgame failed");
        }

        let mut pos = game.initial_position().clone();
        let mut records = Vec::with_capacity(plies);
        for (ply, mv) in game.moves().iter().take(plies).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(AnalyzerError::Cancelled { records });
            }

            let span = debug_span!("ply", ply);
            let _enter = span.enter();

            let after = rules::apply(&pos, mv)?;
            let mut record = self.analyze_move(engine, &pos, &after, mv, ply, limit);
            if let Some(narrator) = self.narrator.as_mut() {
                let prompt = build_prompt(&record, &self.config.audience);
                record.commentary = Some(match narrator.generate(&prompt) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "commentary unavailable");
                        format!("[narrative error] {}", e)
                    }
                });
            }
            records.push(record);
            pos = after;
        }
        Ok(records)
    }

    fn analyze_move<A: PositionAnalyzer>(
        &self,
        engine: &mut A,
        pos: &Chess,
        after: &Chess,
        mv: &Move,
        ply: usize,
        limit: SearchLimit,
    ) -> AnalysisRecord {
        let before_result = query(engine, pos, limit, "before");
        let after_result = query(engine, after, limit, "after");

        let eval_before = before_result.as_ref().and_then(EngineResult::evaluation);
        let eval_after = after_result.as_ref().and_then(EngineResult::evaluation);

        let move_uci = rules::to_compact_notation(mv);
        let best_move = before_result.as_ref().and_then(|r| r.best_move.clone());
        let is_best_move = best_move.as_deref() == Some(move_uci.as_str());

        let best_line = before_result
            .as_ref()
            .map(|r| convert_line(pos, &r.pv))
            .unwrap_or_default();
        let best_move_san = best_move
            .as_ref()
            .and_then(|best| convert_line(pos, std::slice::from_ref(best)).pop());

        let classifier = self.config.classifier;
        let quality = match (eval_before, eval_after) {
            (Some(eval_before), Some(eval_after)) => {
                let is_opening_book = ply < self.config.opening_book_plies;
                let is_only_good_move = classifier.needs_context()
                    && is_best_move
                    && !is_opening_book
                    && self.only_good_move(engine, pos, limit);
                Some(classifier.classify(&MoveFacts {
                    eval_before,
                    eval_after,
                    is_best_move,
                    is_only_good_move,
                    is_opening_book,
                    position: pos,
                    played: mv,
                }))
            }
            _ => {
                warn!(ply, "evaluation unavailable, move left unclassified");
                None
            }
        };

        AnalysisRecord {
            ply,
            move_san: rules::to_display_notation(pos, mv),
            move_uci,
            position_before: rules::to_position_string(pos),
            eval_before,
            eval_after,
            best_move,
            best_move_san,
            best_line,
            quality,
            classifier,
            commentary: None,
        }
    }

    /// Is the engine's best move in `pos` the only one that keeps the
    /// evaluation? True when there is no alternative at all.
    fn only_good_move<A: PositionAnalyzer>(
        &self,
        engine: &mut A,
        pos: &Chess,
        limit: SearchLimit,
    ) -> bool {
        if rules::legal_moves(pos).len() < 2 {
            return true;
        }

        let lines = match engine.variations(pos, limit, 2) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "ranked lines unavailable");
                return false;
            }
        };
        let evals: Vec<f64> = lines.iter().filter_map(|line| line.evaluation()).collect();
        match evals.as_slice() {
            [best, second, ..] => {
                let gap = match pos.turn() {
                    Color::White => best - second,
                    Color::Black => second - best,
                };
                gap >= self.config.only_move_margin
            }
            _ => false,
        }
    }
}

fn query<A: PositionAnalyzer>(
    engine: &mut A,
    pos: &Chess,
    limit: SearchLimit,
    which: &str,
) -> Option<EngineResult> {
    debug!(which, "querying engine");
    match engine.analyze(pos, limit) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(which, error = %e, "position analysis failed");
            None
        }
    }
}

/// Replay an engine line from `pos` and render it in SAN.
///
/// The line is cut at the first move that is not legal where it is played,
/// so a desynchronized or partial engine answer never fails the record.
pub fn convert_line(pos: &Chess, line: &[String]) -> Vec<String> {
    let mut scratch = pos.clone();
    let mut converted = Vec::with_capacity(line.len());
    for uci in line {
        let mv = match rules::from_compact_notation(&scratch, uci) {
            Ok(mv) => mv,
            Err(e) => {
                warn!(error = %e, kept = converted.len(), "best line truncated");
                break;
            }
        };
        converted.push(rules::to_display_notation(&scratch, &mv));
        scratch = match rules::apply(&scratch, &mv) {
            Ok(next) => next,
            Err(_) => break,
        };
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AnalysisError, Variation};
    use crate::narrative::NarrativeError;
    use crate::rules::to_position_string;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned engine answer, scored from White's point of view.
    #[derive(Clone)]
    enum Reply {
        Eval {
            white_cp: i32,
            best: Option<&'static str>,
            pv: Vec<&'static str>,
        },
        Lines(Vec<i32>),
    }

    fn eval(white_cp: i32, best: &'static str, pv: &[&'static str]) -> Reply {
        Reply::Eval {
            white_cp,
            best: Some(best),
            pv: pv.to_vec(),
        }
    }

    fn cp(white_cp: i32) -> Reply {
        Reply::Eval {
            white_cp,
            best: None,
            pv: Vec::new(),
        }
    }

    #[derive(Default)]
    struct Log {
        launches: usize,
        closes: usize,
        new_games: usize,
        analyze_calls: Vec<String>,
        variation_calls: usize,
    }

    /// Scripted analyzer keyed by FEN.
    struct ScriptedAnalyzer {
        replies: HashMap<String, Reply>,
        lines: HashMap<String, Reply>,
        log: Arc<Mutex<Log>>,
    }

    fn side_relative(white_cp: i32, side: Color) -> uci::Score {
        match side {
            Color::White => uci::Score::Cp(white_cp),
            Color::Black => uci::Score::Cp(-white_cp),
        }
    }

    impl PositionAnalyzer for ScriptedAnalyzer {
        fn new_game(&mut self) -> Result<(), AnalysisError> {
            self.log.lock().unwrap().new_games += 1;
            Ok(())
        }

        fn analyze(
            &mut self,
            pos: &Chess,
            _limit: SearchLimit,
        ) -> Result<EngineResult, AnalysisError> {
            let fen = to_position_string(pos);
            self.log.lock().unwrap().analyze_calls.push(fen.clone());
            match self.replies.get(&fen) {
                Some(Reply::Eval { white_cp, best, pv }) => Ok(EngineResult {
                    raw_score: Some(side_relative(*white_cp, pos.turn())),
                    side_to_move: pos.turn(),
                    best_move: best.map(str::to_string),
                    pv: pv.iter().map(|m| m.to_string()).collect(),
                    depth: Some(10),
                    nodes: None,
                    time_ms: None,
                }),
                _ => Err(AnalysisError::Timeout(std::time::Duration::from_millis(1))),
            }
        }

        fn variations(
            &mut self,
            pos: &Chess,
            _limit: SearchLimit,
            count: u32,
        ) -> Result<Vec<Variation>, AnalysisError> {
            self.log.lock().unwrap().variation_calls += 1;
            match self.lines.get(&to_position_string(pos)) {
                Some(Reply::Lines(scores)) => Ok(scores
                    .iter()
                    .take(count as usize)
                    .enumerate()
                    .map(|(i, white_cp)| Variation {
                        rank: i as u32 + 1,
                        raw_score: Some(side_relative(*white_cp, pos.turn())),
                        side_to_move: pos.turn(),
                        pv: Vec::new(),
                    })
                    .collect()),
                _ => Err(AnalysisError::EngineExited),
            }
        }

        fn close(self) {
            self.log.lock().unwrap().closes += 1;
        }
    }

    #[derive(Default)]
    struct ScriptedLauncher {
        replies: HashMap<String, Reply>,
        lines: HashMap<String, Reply>,
        fail: bool,
        log: Arc<Mutex<Log>>,
    }

    impl ScriptedLauncher {
        fn reply(mut self, fen: &str, reply: Reply) -> Self {
            self.replies.insert(fen.to_string(), reply);
            self
        }

        fn lines(mut self, fen: &str, scores: Vec<i32>) -> Self {
            self.lines.insert(fen.to_string(), Reply::Lines(scores));
            self
        }
    }

    impl EngineLauncher for ScriptedLauncher {
        type Analyzer = ScriptedAnalyzer;

        fn launch(&self) -> Result<ScriptedAnalyzer, LaunchError> {
            if self.fail {
                return Err(LaunchError::NotFound("stockfish".to_string()));
            }
            self.log.lock().unwrap().launches += 1;
            Ok(ScriptedAnalyzer {
                replies: self.replies.clone(),
                lines: self.lines.clone(),
                log: Arc::clone(&self.log),
            })
        }
    }

    struct FixedNarrator(Result<&'static str, ()>);

    impl Narrator for FixedNarrator {
        fn generate(&mut self, _prompt: &str) -> Result<String, NarrativeError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(NarrativeError::Empty),
            }
        }
    }

    /// Cancels the run as soon as the first commentary is requested.
    struct CancellingNarrator(CancelToken);

    impl Narrator for CancellingNarrator {
        fn generate(&mut self, _prompt: &str) -> Result<String, NarrativeError> {
            self.0.cancel();
            Ok("ok".to_string())
        }
    }

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";
    const AFTER_D4: &str = "rnbqkbnr/pppppppp/8/8/3P4/8/PPP1PPPP/RNBQKBNR b KQkq - 0 1";
    const AFTER_E4_E5: &str = "rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2";
    const AFTER_E4_F6: &str = "rnbqkbnr/ppppp1pp/5p2/8/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2";

    fn game(moves: &[&str]) -> Game {
        Game::from_uci_moves(None, moves).unwrap()
    }

    fn analyzer(launcher: ScriptedLauncher) -> (GameAnalyzer<ScriptedLauncher>, Arc<Mutex<Log>>) {
        let log = Arc::clone(&launcher.log);
        (GameAnalyzer::new(launcher, AnalysisConfig::default()), log)
    }

    #[test]
    fn test_best_move_scenario() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(30, "e2e4", &["e2e4", "e7e5", "g1f3"]))
            .reply(AFTER_E4, cp(30));
        let (mut analyzer, log) = analyzer(launcher);

        let records = analyzer
            .run(&game(&["e2e4"]), SearchLimit::Depth(10), None)
            .unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.ply, 0);
        assert_eq!(record.move_san, "e4");
        assert_eq!(record.move_uci, "e2e4");
        assert_eq!(record.position_before, START);
        assert_eq!(record.eval_before, Some(0.3));
        assert_eq!(record.eval_before, record.eval_after);
        assert_eq!(record.quality, Some(QualityLabel::BestMove));
        assert_eq!(record.best_move_san.as_deref(), Some("e4"));
        assert_eq!(record.best_line, vec!["e4", "e5", "Nf3"]);
        assert_eq!(record.classifier, ClassifierKind::Simplified);
        assert_eq!(record.commentary, None);

        let log = log.lock().unwrap();
        assert_eq!(log.launches, 1);
        assert_eq!(log.closes, 1);
        assert_eq!(log.new_games, 1);
        assert_eq!(log.analyze_calls, vec![START, AFTER_E4]);
        assert_eq!(log.variation_calls, 0);
        assert_eq!(analyzer.state(), WalkState::Completed);
    }

    #[test]
    fn test_equal_evaluation_not_best_is_good_move() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(250, "e2e4", &["e2e4"]))
            .reply(AFTER_D4, cp(250));
        let (mut analyzer, _) = analyzer(launcher);

        let records = analyzer
            .run(&game(&["d2d4"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].quality, Some(QualityLabel::GoodMove));
    }

    #[test]
    fn test_blunder_scenario() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(100, "e2e4", &["e2e4"]))
            .reply(AFTER_D4, cp(-200));
        let (mut analyzer, _) = analyzer(launcher);

        let records = analyzer
            .run(&game(&["d2d4"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].eval_before, Some(1.0));
        assert_eq!(records[0].eval_after, Some(-2.0));
        assert_eq!(records[0].quality, Some(QualityLabel::Blunder));
    }

    #[test]
    fn test_zero_max_moves_makes_no_engine_calls() {
        let (mut analyzer, log) = analyzer(ScriptedLauncher::default());
        let records = analyzer
            .run(&game(&["e2e4", "e7e5"]), SearchLimit::Depth(10), Some(0))
            .unwrap();
        assert!(records.is_empty());
        let log = log.lock().unwrap();
        assert_eq!(log.launches, 0);
        assert!(log.analyze_calls.is_empty());
    }

    #[test]
    fn test_empty_game_is_missing_input() {
        let (mut analyzer, log) = analyzer(ScriptedLauncher::default());
        let result = analyzer.run(&game(&[]), SearchLimit::Depth(10), None);
        assert!(matches!(result, Err(AnalyzerError::MissingInput)));
        assert_eq!(log.lock().unwrap().launches, 0);
        assert_eq!(analyzer.state(), WalkState::Idle);
    }

    #[test]
    fn test_launch_failure_aborts() {
        let launcher = ScriptedLauncher {
            fail: true,
            ..ScriptedLauncher::default()
        };
        let (mut analyzer, _) = analyzer(launcher);
        let result = analyzer.run(&game(&["e2e4"]), SearchLimit::Depth(10), None);
        assert!(matches!(result, Err(AnalyzerError::Launch(LaunchError::NotFound(_)))));
        assert_eq!(analyzer.state(), WalkState::Aborted);
    }

    #[test]
    fn test_max_moves_truncates() {
        let launcher = ScriptedLauncher::default()
            .reply(START, cp(20))
            .reply(AFTER_E4, cp(20))
            .reply(AFTER_E4_E5, cp(20));
        let (mut analyzer, log) = analyzer(launcher);

        let records = analyzer
            .run(&game(&["e2e4", "e7e5", "g1f3"]), SearchLimit::Depth(10), Some(2))
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(log.lock().unwrap().analyze_calls.len(), 4);
    }

    #[test]
    fn test_positions_follow_played_moves() {
        let moves = ["e2e4", "e7e5", "g1f3", "b8c6"];
        let (mut analyzer, _) = analyzer(ScriptedLauncher::default());
        let records = analyzer
            .run(&game(&moves), SearchLimit::Depth(10), None)
            .unwrap();

        let mut pos = Chess::default();
        for (record, uci) in records.iter().zip(moves) {
            assert_eq!(record.position_before, to_position_string(&pos));
            assert_eq!(record.move_uci, uci);
            let mv = rules::from_compact_notation(&pos, uci).unwrap();
            pos = rules::apply(&pos, &mv).unwrap();
        }
        assert_eq!(records.len(), moves.len());
    }

    #[test]
    fn test_failed_queries_degrade_record() {
        // Only the position after e4 has an answer.
        let launcher = ScriptedLauncher::default().reply(AFTER_E4, cp(30));
        let (mut analyzer, _) = analyzer(launcher);

        let records = analyzer
            .run(&game(&["e2e4", "e7e5"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].eval_before, None);
        assert_eq!(records[0].eval_after, Some(0.3));
        assert_eq!(records[0].quality, None);
        assert_eq!(records[0].best_move, None);
        assert!(records[0].best_line.is_empty());
        assert_eq!(records[1].eval_before, Some(0.3));
        assert_eq!(records[1].quality, None);
        assert_eq!(analyzer.state(), WalkState::Completed);
    }

    #[test]
    fn test_black_move_uses_white_relative_scores() {
        // 1...f6 drops White's advantage from the engine's view of Black.
        let launcher = ScriptedLauncher::default()
            .reply(START, cp(20))
            .reply(AFTER_E4, eval(30, "e7e5", &["e7e5", "g1f3"]))
            .reply(AFTER_E4_F6, cp(150));
        let (mut analyzer, _) = analyzer(launcher);

        let records = analyzer
            .run(&game(&["e2e4", "f7f6"]), SearchLimit::Depth(10), None)
            .unwrap();
        let record = &records[1];
        assert_eq!(record.eval_before, Some(0.3));
        assert_eq!(record.eval_after, Some(1.5));
        assert_eq!(record.quality, Some(QualityLabel::Dubious));
        assert_eq!(record.best_line, vec!["e5", "Nf3"]);
    }

    #[test]
    fn test_best_line_truncated_at_illegal_move() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(30, "e2e4", &["e2e4", "e7e5", "e7e5", "g1f3"]))
            .reply(AFTER_E4, cp(30));
        let (mut analyzer, _) = analyzer(launcher);

        let records = analyzer
            .run(&game(&["e2e4"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].best_line, vec!["e4", "e5"]);
        assert_eq!(records[0].quality, Some(QualityLabel::BestMove));
    }

    #[test]
    fn test_convert_line_round_trip() {
        let line: Vec<String> = ["e2e4", "e7e5", "g1f3", "b8c6", "f1b5"]
            .iter()
            .map(|m| m.to_string())
            .collect();
        let converted = convert_line(&Chess::default(), &line);
        assert_eq!(converted, vec!["e4", "e5", "Nf3", "Nc6", "Bb5"]);
    }

    #[test]
    fn test_convert_line_truncates_at_k() {
        let line: Vec<String> = ["e2e4", "e7e5", "g1f3", "a1a8", "b8c6"]
            .iter()
            .map(|m| m.to_string())
            .collect();
        assert_eq!(convert_line(&Chess::default(), &line).len(), 3);
        assert!(convert_line(&Chess::default(), &["zz".to_string()]).is_empty());
        assert!(convert_line(&Chess::default(), &[]).is_empty());
    }

    #[test]
    fn test_narrator_commentary() {
        let launcher = ScriptedLauncher::default()
            .reply(START, cp(30))
            .reply(AFTER_E4, cp(30));
        let (analyzer, _) = analyzer(launcher);
        let mut analyzer = analyzer.with_narrator(Box::new(FixedNarrator(Ok("Central pawn."))));

        let records = analyzer
            .run(&game(&["e2e4"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].commentary.as_deref(), Some("Central pawn."));
    }

    #[test]
    fn test_narrator_error_is_inline() {
        let launcher = ScriptedLauncher::default()
            .reply(START, cp(30))
            .reply(AFTER_E4, cp(30));
        let (analyzer, _) = analyzer(launcher);
        let mut analyzer = analyzer.with_narrator(Box::new(FixedNarrator(Err(()))));

        let records = analyzer
            .run(&game(&["e2e4", "e7e5"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].commentary.as_deref(),
            Some("[narrative error] Narrator produced no output")
        );
    }

    #[test]
    fn test_cancel_before_run() {
        let (mut analyzer, log) = analyzer(ScriptedLauncher::default());
        analyzer.cancel_token().cancel();

        match analyzer.run(&game(&["e2e4"]), SearchLimit::Depth(10), None) {
            Err(AnalyzerError::Cancelled { records }) => assert!(records.is_empty()),
            other => panic!("Expected Cancelled, got {:?}", other),
        }
        let log = log.lock().unwrap();
        assert_eq!(log.launches, 1);
        assert_eq!(log.closes, 1);
        assert_eq!(analyzer.state(), WalkState::Aborted);
    }

    #[test]
    fn test_cancel_mid_run_keeps_completed_records() {
        let token = CancelToken::new();
        let (analyzer, log) = analyzer(ScriptedLauncher::default());
        let mut analyzer = analyzer
            .with_cancel_token(token.clone())
            .with_narrator(Box::new(CancellingNarrator(token)));

        match analyzer.run(&game(&["e2e4", "e7e5", "g1f3"]), SearchLimit::Depth(10), None) {
            Err(AnalyzerError::Cancelled { records }) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].move_san, "e4");
            }
            other => panic!("Expected Cancelled, got {:?}", other),
        }
        assert_eq!(log.lock().unwrap().closes, 1);
    }

    #[test]
    fn test_repeated_runs_each_release_engine() {
        let (mut analyzer, log) = analyzer(ScriptedLauncher::default());
        let game = game(&["e2e4"]);
        analyzer.run(&game, SearchLimit::Depth(5), None).unwrap();
        analyzer.run(&game, SearchLimit::Depth(5), None).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.launches, 2);
        assert_eq!(log.closes, 2);
    }

    fn context_analyzer(
        launcher: ScriptedLauncher,
        opening_book_plies: usize,
    ) -> (GameAnalyzer<ScriptedLauncher>, Arc<Mutex<Log>>) {
        let log = Arc::clone(&launcher.log);
        let config = AnalysisConfig {
            classifier: ClassifierKind::ContextAware,
            opening_book_plies,
            ..AnalysisConfig::default()
        };
        (GameAnalyzer::new(launcher, config), log)
    }

    #[test]
    fn test_context_aware_opening_book() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(30, "e2e4", &["e2e4"]))
            .reply(AFTER_E4, cp(30))
            .reply(AFTER_E4_E5, cp(-400));
        let (mut analyzer, log) = context_analyzer(launcher, 2);

        let records = analyzer
            .run(&game(&["e2e4", "e7e5"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].quality, Some(QualityLabel::TheoreticalMove));
        assert_eq!(records[1].quality, Some(QualityLabel::TheoreticalMove));
        assert_eq!(records[1].classifier, ClassifierKind::ContextAware);
        assert_eq!(log.lock().unwrap().variation_calls, 0);
    }

    #[test]
    fn test_context_aware_only_good_move() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(30, "e2e4", &["e2e4"]))
            .reply(AFTER_E4, cp(30))
            .lines(START, vec![30, -150]);
        let (mut analyzer, log) = context_analyzer(launcher, 0);

        let records = analyzer
            .run(&game(&["e2e4"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].quality, Some(QualityLabel::OnlyGoodMove));
        assert_eq!(log.lock().unwrap().variation_calls, 1);
    }

    #[test]
    fn test_context_aware_close_alternative_is_best_move() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(30, "e2e4", &["e2e4"]))
            .reply(AFTER_E4, cp(30))
            .lines(START, vec![30, 20]);
        let (mut analyzer, _) = context_analyzer(launcher, 0);

        let records = analyzer
            .run(&game(&["e2e4"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].quality, Some(QualityLabel::BestMove));
    }

    #[test]
    fn test_context_aware_only_move_for_black() {
        // For Black, the second line is worse when it is better for White.
        let launcher = ScriptedLauncher::default()
            .reply(START, cp(20))
            .reply(AFTER_E4, eval(30, "e7e5", &["e7e5"]))
            .reply(AFTER_E4_E5, cp(30))
            .lines(AFTER_E4, vec![30, 250]);
        let (mut analyzer, _) = context_analyzer(launcher, 0);

        let records = analyzer
            .run(&game(&["e2e4", "e7e5"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[1].quality, Some(QualityLabel::OnlyGoodMove));
    }

    #[test]
    fn test_context_aware_failed_lines_fall_back() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(30, "e2e4", &["e2e4"]))
            .reply(AFTER_E4, cp(30));
        let (mut analyzer, _) = context_analyzer(launcher, 0);

        let records = analyzer
            .run(&game(&["e2e4"]), SearchLimit::Depth(10), None)
            .unwrap();
        assert_eq!(records[0].quality, Some(QualityLabel::BestMove));
    }

    #[test]
    fn test_record_serializes() {
        let launcher = ScriptedLauncher::default()
            .reply(START, eval(30, "e2e4", &["e2e4"]))
            .reply(AFTER_E4, cp(30));
        let (mut analyzer, _) = analyzer(launcher);
        let records = analyzer
            .run(&game(&["e2e4"]), SearchLimit::Depth(10), None)
            .unwrap();

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["move_san"], "e4");
        assert_eq!(json["quality"], "best_move");
        assert_eq!(json["classifier"], "simplified");
        assert!(json.get("commentary").is_none());
    }
}
