//! Commentary generation for analyzed moves.
//!
//! The walker only needs "prompt in, text out, may fail". [`Narrator`] is
//! that seam; [`CommandNarrator`] fulfils it with any external program
//! that reads a prompt on stdin and prints commentary on stdout.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::analyzer::AnalysisRecord;
use crate::quality::QualityLabel;

/// Default time a narrator command may take per prompt.
pub const DEFAULT_NARRATOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from the commentary generator.
#[derive(Error, Debug)]
pub enum NarrativeError {
    #[error("Failed to start narrator: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Narrator exited with status {0}")]
    Failed(i32),
    #[error("Narrator was killed by a signal")]
    Killed,
    #[error("Narrator produced no output")]
    Empty,
    #[error("Narrator did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Narrator command is empty")]
    NoCommand,
}

/// Generates free-text commentary from a prompt.
pub trait Narrator: Send {
    fn generate(&mut self, prompt: &str) -> Result<String, NarrativeError>;
}

/// Runs an external program once per prompt.
#[derive(Debug, Clone)]
pub struct CommandNarrator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandNarrator {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, NarrativeError> {
        let (program, args) = command.split_first().ok_or(NarrativeError::NoCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

impl Narrator for CommandNarrator {
    fn generate(&mut self, prompt: &str) -> Result<String, NarrativeError> {
        debug!(program = %self.program, "running narrator");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits without reading its input is not an error here.
            let _ = stdin.write_all(prompt.as_bytes());
        }

        let (tx, rx) = mpsc::channel();
        if let Some(mut stdout) = child.stdout.take() {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = stdout.read_to_string(&mut text);
                let _ = tx.send(text);
            });
        }

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(NarrativeError::Timeout(self.timeout));
                }
                None => thread::sleep(Duration::from_millis(10)),
            }
        };

        if !status.success() {
            return Err(match status.code() {
                Some(code) => NarrativeError::Failed(code),
                None => NarrativeError::Killed,
            });
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let text = rx
            .recv_timeout(remaining.max(Duration::from_millis(100)))
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return Err(NarrativeError::Empty);
        }
        Ok(text.to_string())
    }
}

/// What the coach should concentrate on for a move of this quality.
pub fn coaching_focus(label: QualityLabel) -> &'static str {
    match label {
        QualityLabel::BrilliantMove => {
            "Explain why giving up material here works and what the opponent cannot do about it."
        }
        QualityLabel::OnlyGoodMove => {
            "Explain why every other move loses ground and how this one holds the position."
        }
        QualityLabel::BestMove => "Explain the idea behind the move and the plan it supports.",
        QualityLabel::ExcellentMove => "Explain what makes the move strong.",
        QualityLabel::GoodMove => "Briefly explain the purpose of the move.",
        QualityLabel::Dubious => {
            "Explain the small inaccuracy and what would have been more precise."
        }
        QualityLabel::Mistake => "Explain why the move is an error and what it allows.",
        QualityLabel::MissedWin => {
            "Explain how the winning advantage slipped away and which move kept it."
        }
        QualityLabel::Blunder => {
            "Explain the serious error, the concrete threat it allows, and the better move."
        }
        QualityLabel::TheoreticalMove => "Name the opening idea this known move belongs to.",
    }
}

/// Assemble the prompt for one analyzed move.
pub fn build_prompt(record: &AnalysisRecord, audience: &str) -> String {
    let mut prompt = format!(
        "You are a chess coach talking to a {} player. Be clear and encouraging.\n",
        audience
    );
    if let Some(label) = record.quality {
        prompt.push_str(coaching_focus(label));
        prompt.push('\n');
        prompt.push_str(&format!("- Classification: {}\n", label));
    }
    prompt.push_str(&format!("- Position (FEN): {}\n", record.position_before));
    prompt.push_str(&format!("- Move played: {}\n", record.move_san));
    if let Some(best) = &record.best_move_san {
        prompt.push_str(&format!("- Engine best move: {}\n", best));
    }
    if !record.best_line.is_empty() {
        prompt.push_str(&format!("- Best line: {}\n", record.best_line.join(" ")));
    }
    prompt
}
