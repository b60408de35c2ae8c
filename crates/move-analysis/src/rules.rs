//! Rules-engine adapter.
//!
//! All game rules come from `shakmaty`. This module is the only place the
//! rest of the crate touches move generation, notation or FEN handling.

use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Move, MoveList, Position};
use thiserror::Error;

/// Errors raised by the rules adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RulesError {
    /// The position string is not valid FEN or describes an impossible position.
    #[error("Invalid position: {0}")]
    InvalidPosition(String),
    /// The compact move string cannot be parsed.
    #[error("Invalid move notation: {0}")]
    InvalidNotation(String),
    /// The move is well-formed but not legal in the given position.
    #[error("Illegal move {mv} in {fen}")]
    IllegalMove { mv: String, fen: String },
}

/// All legal moves in `pos`.
pub fn legal_moves(pos: &Chess) -> MoveList {
    pos.legal_moves()
}

/// Play `mv` on a copy of `pos`. The caller's position is left untouched.
pub fn apply(pos: &Chess, mv: &Move) -> Result<Chess, RulesError> {
    pos.clone().play(*mv).map_err(|_| RulesError::IllegalMove {
        mv: to_compact_notation(mv),
        fen: to_position_string(pos),
    })
}

/// Standard algebraic notation including the check/mate suffix (e.g. `Qxf7#`).
pub fn to_display_notation(pos: &Chess, mv: &Move) -> String {
    let mut san = San::from_move(pos, *mv).to_string();
    if let Ok(after) = apply(pos, mv) {
        if after.is_checkmate() {
            san.push('#');
        } else if after.is_check() {
            san.push('+');
        }
    }
    san
}

/// UCI notation with standard castling (e.g. `e1g1`).
pub fn to_compact_notation(mv: &Move) -> String {
    mv.to_uci(CastlingMode::Standard).to_string()
}

/// Resolve a UCI string into a legal move of `pos`.
pub fn from_compact_notation(pos: &Chess, uci: &str) -> Result<Move, RulesError> {
    let parsed: UciMove = uci
        .parse()
        .map_err(|_| RulesError::InvalidNotation(uci.to_string()))?;
    parsed.to_move(pos).map_err(|_| RulesError::IllegalMove {
        mv: uci.to_string(),
        fen: to_position_string(pos),
    })
}

/// Full FEN of `pos`.
pub fn to_position_string(pos: &Chess) -> String {
    Fen::from_position(pos, EnPassantMode::Legal).to_string()
}

/// Parse a FEN into a standard-chess position.
pub fn from_position_string(fen: &str) -> Result<Chess, RulesError> {
    let parsed: Fen = fen
        .trim()
        .parse()
        .map_err(|_| RulesError::InvalidPosition(fen.to_string()))?;
    parsed
        .into_position(CastlingMode::Standard)
        .map_err(|_| RulesError::InvalidPosition(fen.to_string()))
}
