//! Configuration file loading for game reviews.
//!
//! Settings live in `review.toml`. A missing file means defaults; every
//! field is optional.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::AnalysisConfig;
use crate::engine::{EngineOptions, SearchLimit, UciLauncher};
use crate::narrative::CommandNarrator;
use crate::quality::ClassifierKind;

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    /// Failed to parse the configuration file as valid TOML.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    /// Both a search depth and a move time were given.
    #[error("engine.depth and engine.movetime_ms are mutually exclusive")]
    ConflictingLimits,
    /// A value is out of range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// `[engine]` table.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Engine executable. Defaults to "stockfish" (assumes it's in PATH).
    #[serde(default = "default_engine_path")]
    pub path: PathBuf,
    /// Extra command-line arguments for the engine.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub movetime_ms: Option<u64>,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub hash_mb: Option<u32>,
    /// Extra `setoption` pairs, sent in name order.
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

fn default_engine_path() -> PathBuf {
    PathBuf::from("stockfish")
}

fn default_response_timeout() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: default_engine_path(),
            args: Vec::new(),
            depth: None,
            movetime_ms: None,
            response_timeout_secs: default_response_timeout(),
            threads: None,
            hash_mb: None,
            options: BTreeMap::new(),
        }
    }
}

/// `[analysis]` table.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AnalysisSection {
    #[serde(default)]
    pub classifier: ClassifierKind,
    /// 0 analyzes the whole game.
    #[serde(default)]
    pub max_moves: usize,
    #[serde(default)]
    pub opening_book_plies: usize,
    #[serde(default = "default_only_move_margin")]
    pub only_move_margin: f64,
}

fn default_only_move_margin() -> f64 {
    1.5
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::default(),
            max_moves: 0,
            opening_book_plies: 0,
            only_move_margin: default_only_move_margin(),
        }
    }
}

/// `[narrator]` table.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NarratorConfig {
    /// Program and arguments. Empty disables commentary.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_narrator_timeout")]
    pub timeout_secs: u64,
    /// Player level the commentary addresses.
    #[serde(default = "default_audience")]
    pub audience: String,
}

fn default_narrator_timeout() -> u64 {
    60
}

fn default_audience() -> String {
    "beginner".to_string()
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_narrator_timeout(),
            audience: default_audience(),
        }
    }
}

/// Main review configuration structure.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ReviewConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub narrator: NarratorConfig,
}

impl ReviewConfig {
    /// Default configuration file name in the working directory.
    pub const DEFAULT_PATH: &'static str = "review.toml";

    /// Loads the configuration from `path`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadError`] if the file exists but cannot be read,
    /// or [`ConfigError::ParseError`] if the file contains invalid TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Search bound per query. Depth 15 when neither bound is set.
    pub fn search_limit(&self) -> Result<SearchLimit, ConfigError> {
        match (self.engine.depth, self.engine.movetime_ms) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingLimits),
            (Some(0), None) => Err(ConfigError::InvalidValue {
                field: "engine.depth",
                reason: "must be at least 1".to_string(),
            }),
            (None, Some(0)) => Err(ConfigError::InvalidValue {
                field: "engine.movetime_ms",
                reason: "must be at least 1".to_string(),
            }),
            (Some(depth), None) => Ok(SearchLimit::Depth(depth)),
            (None, Some(ms)) => Ok(SearchLimit::Time(Duration::from_millis(ms))),
            (None, None) => Ok(SearchLimit::default()),
        }
    }

    /// Startup settings for the engine process.
    pub fn engine_options(&self) -> EngineOptions {
        let mut uci_options = Vec::new();
        if let Some(threads) = self.engine.threads {
            uci_options.push(("Threads".to_string(), threads.to_string()));
        }
        if let Some(hash) = self.engine.hash_mb {
            uci_options.push(("Hash".to_string(), hash.to_string()));
        }
        for (name, value) in &self.engine.options {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            uci_options.push((name.clone(), value));
        }

        EngineOptions {
            args: self.engine.args.clone(),
            uci_options,
            response_timeout: Duration::from_secs(self.engine.response_timeout_secs),
        }
    }

    pub fn launcher(&self) -> UciLauncher {
        UciLauncher::new(self.engine.path.clone(), self.engine_options())
    }

    pub fn analysis_config(&self) -> Result<AnalysisConfig, ConfigError> {
        let margin = self.analysis.only_move_margin;
        if !margin.is_finite() || margin < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "analysis.only_move_margin",
                reason: format!("{} is not a non-negative number", margin),
            });
        }
        Ok(AnalysisConfig {
            classifier: self.analysis.classifier,
            opening_book_plies: self.analysis.opening_book_plies,
            only_move_margin: margin,
            audience: self.narrator.audience.clone(),
        })
    }

    /// Ply cap for a run; `None` analyzes the whole game.
    pub fn max_moves(&self) -> Option<usize> {
        match self.analysis.max_moves {
            0 => None,
            n => Some(n),
        }
    }

    /// The configured narrator, if any.
    pub fn narrator(&self) -> Option<CommandNarrator> {
        CommandNarrator::new(
            &self.narrator.command,
            Duration::from_secs(self.narrator.timeout_secs),
        )
        .ok()
    }
}
