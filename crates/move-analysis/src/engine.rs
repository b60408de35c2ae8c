//! UCI engine client for position analysis.
//!
//! [`EngineClient`] owns one engine process and serializes every request
//! to it. Engine output is read on a dedicated thread and handed over a
//! channel, so every wait is bounded by a deadline and a hung engine turns
//! into an [`AnalysisError::Timeout`] instead of blocking forever.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use shakmaty::{Chess, Color, Position};
use thiserror::Error;
use tracing::{debug, warn};
use uci::{EngineInfo, EngineMessage, GoOptions, GuiCommand, ScoreBound};

use crate::evaluation::{normalize, Score};
use crate::rules::to_position_string;

/// Maximum number of lines to read before giving up on a UCI response.
pub const MAX_UCI_LINES: usize = 20_000;

/// Default time allowed for the engine to answer on top of the search budget.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest wait for `bestmove` after sending `stop` to an overdue search.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Longest wait for the process to exit after `quit` before it is killed.
const QUIT_GRACE: Duration = Duration::from_secs(1);

/// Errors that prevent an engine from being started.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Failed to spawn the engine process.
    #[error("Failed to spawn engine: {0}")]
    SpawnError(#[from] std::io::Error),
    /// Engine executable was not found at the specified path.
    #[error("Engine not found at path: {0}")]
    NotFound(String),
    /// Engine failed to initialize properly (UCI handshake failed).
    #[error("Engine initialization failed: {0}")]
    InitFailed(String),
}

/// Errors from a single analysis request. These are recoverable: the
/// engine client stays usable for the next request.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Writing to the engine failed.
    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The engine did not answer in time.
    #[error("Engine did not answer within {0:?}")]
    Timeout(Duration),
    /// The engine process closed its output.
    #[error("Engine closed unexpectedly")]
    EngineExited,
    /// Engine returned an invalid or unexpected response.
    #[error("Invalid engine response: {0}")]
    InvalidResponse(String),
}

/// How long a single search may run. Exactly one bound applies per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchLimit {
    /// Search to a fixed depth in plies.
    Depth(u32),
    /// Search for a fixed wall-clock time.
    Time(Duration),
}

impl SearchLimit {
    fn go_options(self) -> GoOptions {
        match self {
            SearchLimit::Depth(d) => GoOptions::depth(d),
            SearchLimit::Time(t) => GoOptions::movetime(t.as_millis() as u64),
        }
    }

    /// Wall-clock time the search itself is allowed to take.
    fn budget(self) -> Duration {
        match self {
            SearchLimit::Depth(_) => Duration::ZERO,
            SearchLimit::Time(t) => t,
        }
    }
}

impl Default for SearchLimit {
    fn default() -> Self {
        SearchLimit::Depth(15)
    }
}

impl std::fmt::Display for SearchLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchLimit::Depth(d) => write!(f, "depth {}", d),
            SearchLimit::Time(t) => write!(f, "{} ms", t.as_millis()),
        }
    }
}

/// Result of analyzing a chess position.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResult {
    /// Score as reported by the engine, relative to the side to move.
    pub raw_score: Option<uci::Score>,
    /// Side to move in the analyzed position.
    pub side_to_move: Color,
    /// The best move found (UCI notation), `None` in a terminal position.
    pub best_move: Option<String>,
    /// The principal variation (UCI notation).
    pub pv: Vec<String>,
    /// The search depth reached.
    pub depth: Option<u32>,
    /// The number of nodes searched.
    pub nodes: Option<u64>,
    /// Search time reported by the engine, in milliseconds.
    pub time_ms: Option<u64>,
}

impl EngineResult {
    /// White-relative score.
    pub fn score(&self) -> Option<Score> {
        self.raw_score.map(|s| Score::from_uci(s, self.side_to_move))
    }

    /// White-relative evaluation in pawns, `None` if the engine gave no score.
    pub fn evaluation(&self) -> Option<f64> {
        normalize(self.raw_score, self.side_to_move)
    }
}

/// One ranked line of a multi-PV search.
#[derive(Debug, Clone, PartialEq)]
pub struct Variation {
    /// 1-based rank (1 = best).
    pub rank: u32,
    /// Score relative to the side to move.
    pub raw_score: Option<uci::Score>,
    /// Side to move in the analyzed position.
    pub side_to_move: Color,
    /// Moves of this line (UCI notation).
    pub pv: Vec<String>,
}

impl Variation {
    /// White-relative evaluation in pawns.
    pub fn evaluation(&self) -> Option<f64> {
        normalize(self.raw_score, self.side_to_move)
    }
}

/// Something that can evaluate positions. Implemented by [`EngineClient`];
/// tests substitute scripted doubles.
pub trait PositionAnalyzer {
    /// Tell the analyzer that following positions belong to a new game.
    fn new_game(&mut self) -> Result<(), AnalysisError>;

    /// Analyze one position with a single principal variation.
    fn analyze(&mut self, pos: &Chess, limit: SearchLimit) -> Result<EngineResult, AnalysisError>;

    /// Analyze one position and return up to `count` ranked lines, best first.
    fn variations(
        &mut self,
        pos: &Chess,
        limit: SearchLimit,
        count: u32,
    ) -> Result<Vec<Variation>, AnalysisError>;

    /// Moves of the best line among `count` ranked lines.
    ///
    /// A failed query yields an empty line: a missing principal variation
    /// is a valid outcome callers must tolerate.
    fn best_line(&mut self, pos: &Chess, limit: SearchLimit, count: u32) -> Vec<String> {
        match self.variations(pos, limit, count.max(1)) {
            Ok(lines) => lines.into_iter().next().map(|v| v.pv).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "best line unavailable");
                Vec::new()
            }
        }
    }

    /// Release the analyzer. Consumes it, so it can only happen once.
    fn close(self)
    where
        Self: Sized;
}

/// Acquires a fresh [`PositionAnalyzer`] for each analysis run.
pub trait EngineLauncher {
    type Analyzer: PositionAnalyzer;

    fn launch(&self) -> Result<Self::Analyzer, LaunchError>;
}

/// Settings applied to an engine process at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Extra command-line arguments for the engine executable.
    pub args: Vec<String>,
    /// `setoption` pairs sent after the handshake.
    pub uci_options: Vec<(String, String)>,
    /// Time allowed for any answer, on top of the search time itself.
    pub response_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            uci_options: Vec::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Launches [`EngineClient`]s for a UCI executable.
#[derive(Debug, Clone)]
pub struct UciLauncher {
    pub path: PathBuf,
    pub options: EngineOptions,
}

impl UciLauncher {
    pub fn new(path: impl Into<PathBuf>, options: EngineOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }
}

impl EngineLauncher for UciLauncher {
    type Analyzer = EngineClient;

    fn launch(&self) -> Result<EngineClient, LaunchError> {
        EngineClient::open(&self.path, self.options.clone())
    }
}

/// Best move and ranked lines collected from one `go` command.
struct SearchOutcome {
    best_move: Option<String>,
    lines: Vec<Option<EngineInfo>>,
}

/// Client for a UCI-compatible analysis engine like Stockfish.
///
/// The process is released when the client is closed or dropped,
/// whichever comes first.
pub struct EngineClient {
    /// The engine process handle.
    process: Child,
    /// Writer for sending commands to the engine.
    stdin: ChildStdin,
    /// Lines read from the engine's stdout by the reader thread.
    lines: Receiver<String>,
    /// The engine's name (reported via UCI id).
    name: String,
    options: EngineOptions,
    /// A `go` was sent and its `bestmove` has not been read yet.
    searching: bool,
    closed: bool,
}

impl EngineClient {
    /// Spawn the engine process and perform the UCI handshake.
    ///
    /// # Errors
    ///
    /// - `LaunchError::NotFound` if the executable does not exist
    /// - `LaunchError::SpawnError` if the engine process fails to start
    /// - `LaunchError::InitFailed` if the UCI handshake fails or times out
    pub fn open(path: &Path, options: EngineOptions) -> Result<Self, LaunchError> {
        // Bare names are looked up on PATH by the OS; only check explicit paths.
        if path.components().count() > 1 && !path.exists() {
            return Err(LaunchError::NotFound(path.display().to_string()));
        }

        let mut process = Command::new(path)
            .args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LaunchError::NotFound(path.display().to_string()),
                _ => LaunchError::SpawnError(e),
            })?;

        let stdin = process.stdin.take();
        let stdout = process.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(LaunchError::InitFailed("engine pipes unavailable".to_string()));
            }
        };
        let lines = match spawn_reader(stdout) {
            Ok(lines) => lines,
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(LaunchError::SpawnError(e));
            }
        };

        let mut engine = Self {
            process,
            stdin,
            lines,
            name: String::new(),
            options,
            searching: false,
            closed: false,
        };

        // On failure `engine` is dropped here, which reaps the process.
        engine
            .init_uci()
            .map_err(|e| LaunchError::InitFailed(e.to_string()))?;

        debug!(engine = %engine.name, "engine ready");
        Ok(engine)
    }

    /// Initialize the UCI protocol with the engine.
    fn init_uci(&mut self) -> Result<(), AnalysisError> {
        self.send(&GuiCommand::Uci)?;

        let deadline = Instant::now() + self.options.response_timeout;
        let mut name = String::new();
        let mut lines_read = 0;
        loop {
            if lines_read > MAX_UCI_LINES {
                return Err(AnalysisError::InvalidResponse("no uciok".to_string()));
            }
            lines_read += 1;
            match EngineMessage::parse(&self.read_line(deadline)?) {
                Ok(EngineMessage::Id { name: Some(n), .. }) => name = n,
                Ok(EngineMessage::UciOk) => break,
                _ => {}
            }
        }

        self.name = if name.is_empty() {
            "Unknown Engine".to_string()
        } else {
            name
        };

        for (name, value) in self.options.uci_options.clone() {
            self.send(&GuiCommand::SetOption {
                name,
                value: Some(value),
            })?;
        }

        self.synchronize()
    }

    /// Returns the engine's name as reported via UCI protocol.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the engine to an idle, synchronized state.
    ///
    /// Stops a search left over from a timed-out request and discards every
    /// line up to `readyok`, so no stale output can be read as the answer to
    /// the next request.
    fn synchronize(&mut self) -> Result<(), AnalysisError> {
        if self.searching {
            self.send(&GuiCommand::Stop)?;
        }
        self.send(&GuiCommand::IsReady)?;

        let deadline = Instant::now() + self.options.response_timeout;
        let mut lines_read = 0;
        loop {
            if lines_read > MAX_UCI_LINES {
                return Err(AnalysisError::InvalidResponse("no readyok".to_string()));
            }
            lines_read += 1;
            match EngineMessage::parse(&self.read_line(deadline)?) {
                Ok(EngineMessage::ReadyOk) => break,
                Ok(EngineMessage::BestMove { .. }) => self.searching = false,
                _ => {}
            }
        }
        self.searching = false;
        Ok(())
    }

    /// Run one search and collect the last exact line for each rank.
    fn search(
        &mut self,
        pos: &Chess,
        limit: SearchLimit,
        ranks: u32,
    ) -> Result<SearchOutcome, AnalysisError> {
        self.synchronize()?;
        self.send(&GuiCommand::Position {
            fen: to_position_string(pos),
        })?;
        self.send(&GuiCommand::Go(limit.go_options()))?;
        self.searching = true;

        let timeout = limit.budget() + self.options.response_timeout;
        let deadline = Instant::now() + timeout;
        let mut lines: Vec<Option<EngineInfo>> = vec![None; ranks as usize];

        let mut lines_read = 0;
        loop {
            if lines_read > MAX_UCI_LINES {
                return Err(AnalysisError::InvalidResponse(
                    "Too many lines without bestmove".to_string(),
                ));
            }
            lines_read += 1;

            let line = match self.read_line(deadline) {
                Ok(line) => line,
                Err(AnalysisError::Timeout(_)) => {
                    self.abort_search();
                    return Err(AnalysisError::Timeout(timeout));
                }
                Err(e) => return Err(e),
            };

            match EngineMessage::parse(&line) {
                Ok(EngineMessage::Info(info)) => {
                    if info.score.is_none() || info.bound != ScoreBound::Exact {
                        continue;
                    }
                    let rank = info.rank() as usize;
                    if (1..=lines.len()).contains(&rank) {
                        lines[rank - 1] = Some(info);
                    }
                }
                Ok(EngineMessage::BestMove { mv, .. }) => {
                    self.searching = false;
                    return Ok(SearchOutcome {
                        best_move: mv,
                        lines,
                    });
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "ignoring malformed engine line"),
            }
        }
    }

    /// Ask an overdue search to stop and give it a moment to answer.
    fn abort_search(&mut self) {
        if self.send(&GuiCommand::Stop).is_err() {
            return;
        }
        let deadline = Instant::now() + STOP_GRACE.min(self.options.response_timeout);
        while let Ok(line) = self.read_line(deadline) {
            if let Ok(EngineMessage::BestMove { .. }) = EngineMessage::parse(&line) {
                self.searching = false;
                return;
            }
        }
        warn!(engine = %self.name, "engine ignored stop; will resynchronize");
    }

    /// Send a command to the engine.
    fn send(&mut self, command: &GuiCommand) -> Result<(), AnalysisError> {
        let line = command.to_uci();
        debug!(cmd = %line, "engine <");
        writeln!(self.stdin, "{}", line)?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Read a line from the engine's output, waiting until `deadline` at most.
    fn read_line(&mut self, deadline: Instant) -> Result<String, AnalysisError> {
        let wait = deadline.saturating_duration_since(Instant::now());
        match self.lines.recv_timeout(wait) {
            Ok(line) => {
                let line = line.trim().to_string();
                debug!(line = %line, "engine >");
                Ok(line)
            }
            Err(RecvTimeoutError::Timeout) => Err(AnalysisError::Timeout(wait)),
            Err(RecvTimeoutError::Disconnected) => Err(AnalysisError::EngineExited),
        }
    }

    /// Quit the engine, killing it if it does not exit promptly.
    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.send(&GuiCommand::Quit);
        let deadline = Instant::now() + QUIT_GRACE;
        loop {
            match self.process.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => break,
            }
        }
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

impl PositionAnalyzer for EngineClient {
    /// Clear the engine's hash tables and prepare for a new game.
    fn new_game(&mut self) -> Result<(), AnalysisError> {
        self.send(&GuiCommand::UciNewGame)?;
        self.synchronize()
    }

    fn analyze(&mut self, pos: &Chess, limit: SearchLimit) -> Result<EngineResult, AnalysisError> {
        let outcome = self.search(pos, limit, 1)?;
        let info = outcome
            .lines
            .into_iter()
            .next()
            .flatten()
            .unwrap_or_default();

        let best_move = outcome.best_move.or_else(|| info.pv.first().cloned());
        Ok(EngineResult {
            raw_score: info.score,
            side_to_move: pos.turn(),
            best_move,
            pv: info.pv,
            depth: info.depth,
            nodes: info.nodes,
            time_ms: info.time,
        })
    }

    fn variations(
        &mut self,
        pos: &Chess,
        limit: SearchLimit,
        count: u32,
    ) -> Result<Vec<Variation>, AnalysisError> {
        let count = count.max(1);
        if count > 1 {
            self.send(&GuiCommand::multipv(count))?;
        }
        let outcome = self.search(pos, limit, count);
        if count > 1 {
            self.send(&GuiCommand::multipv(1))?;
        }

        let side_to_move = pos.turn();
        Ok(outcome?
            .lines
            .into_iter()
            .flatten()
            .map(|info| Variation {
                rank: info.rank(),
                raw_score: info.score,
                side_to_move,
                pv: info.pv,
            })
            .collect())
    }

    fn close(mut self) {
        self.shutdown();
    }
}

impl Drop for EngineClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forward every stdout line of the engine to a channel.
fn spawn_reader(stdout: ChildStdout) -> std::io::Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("uci-reader".to_string())
        .spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })?;
    Ok(rx)
}
