//! Move-by-move review of recorded chess games with a UCI engine.
//!
//! This crate walks a game, asks an engine such as Stockfish for the
//! evaluation before and after every move, and classifies each move.
//!
//! # Overview
//!
//! - [`Score`] / [`normalize`] - Engine scores re-expressed from White's side
//! - [`EngineClient`] - Owns one UCI engine process
//! - [`is_sacrifice`] - Material sacrifice heuristic
//! - [`ClassifierKind`] / [`QualityLabel`] - Move quality strategies and labels
//! - [`GameAnalyzer`] - Walks a [`Game`] and produces [`AnalysisRecord`]s
//!
//! # Example
//!
//! ```ignore
//! use move_analysis::{AnalysisConfig, EngineOptions, Game, GameAnalyzer, SearchLimit, UciLauncher};
//!
//! let game = Game::from_pgn("1. e4 e5 2. Nf3 Nc6 *")?;
//! let launcher = UciLauncher::new("stockfish", EngineOptions::default());
//! let mut analyzer = GameAnalyzer::new(launcher, AnalysisConfig::default());
//! for record in analyzer.run(&game, SearchLimit::Depth(15), None)? {
//!     println!("{} {:?}", record.move_san, record.quality);
//! }
//! ```

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod evaluation;
pub mod game;
pub mod narrative;
pub mod quality;
pub mod rules;
pub mod sacrifice;

pub use analyzer::{
    convert_line, AnalysisConfig, AnalysisRecord, AnalyzerError, CancelToken, GameAnalyzer,
    WalkState,
};
pub use config::{ConfigError, ReviewConfig};
pub use engine::{
    AnalysisError, EngineClient, EngineLauncher, EngineOptions, EngineResult, LaunchError,
    PositionAnalyzer, SearchLimit, UciLauncher, Variation,
};
pub use evaluation::{normalize, Score, MATE_SCORE};
pub use game::{Game, GameError, GameTags};
pub use narrative::{CommandNarrator, NarrativeError, Narrator};
pub use quality::{ClassifierKind, QualityLabel};
pub use sacrifice::is_sacrifice;
