//! Engine score types and normalization to White's point of view.

use serde::{Deserialize, Serialize};
use shakmaty::Color;

/// Centipawn value standing in for a forced mate.
///
/// Mate in N is mapped to `MATE_SCORE - N`, so shorter mates rank higher
/// and every mate stays far above any material evaluation.
pub const MATE_SCORE: i32 = 10_000;

/// A position evaluation reported by the engine.
///
/// Scores are always stored from White's perspective once they leave the
/// engine client. `Mate(0)` is never produced: a side that is already
/// mated has no move left to score, and the engine client maps that
/// report straight to the negative mate sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Score {
    /// Centipawn evaluation (positive = white advantage)
    Centipawns(i32),
    /// Mate in N moves (positive = white mates, negative = black mates)
    Mate(i32),
}

impl Score {
    /// Convert a raw UCI score, which is relative to the side to move,
    /// into a White-relative score.
    pub fn from_uci(score: uci::Score, side_to_move: Color) -> Self {
        let relative = match score {
            uci::Score::Cp(cp) => Score::Centipawns(cp),
            uci::Score::Mate(0) => Score::Centipawns(-MATE_SCORE),
            uci::Score::Mate(n) => Score::Mate(n),
        };
        relative.for_side(side_to_move)
    }

    /// Re-express a score given from `side`'s perspective from White's.
    pub fn for_side(self, side: Color) -> Self {
        match side {
            Color::White => self,
            Color::Black => self.flip(),
        }
    }

    /// Negate the score (switch perspective).
    pub fn flip(self) -> Self {
        match self {
            Score::Centipawns(cp) => Score::Centipawns(cp.saturating_neg()),
            Score::Mate(n) => Score::Mate(n.saturating_neg()),
        }
    }

    /// Centipawn value with mates mapped onto the sentinel range.
    pub fn to_centipawns(self) -> i32 {
        match self {
            Score::Centipawns(cp) => cp,
            Score::Mate(n) if n > 0 => MATE_SCORE - n,
            Score::Mate(n) if n < 0 => -MATE_SCORE - n,
            Score::Mate(_) => -MATE_SCORE,
        }
    }

    /// Evaluation in pawns (centipawns / 100), the unit every classifier
    /// threshold is expressed in.
    pub fn to_pawns(self) -> f64 {
        f64::from(self.to_centipawns()) / 100.0
    }

    /// True if this score is a forced mate for either side.
    pub fn is_mate(self) -> bool {
        matches!(self, Score::Mate(_))
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Score::Centipawns(cp) => write!(f, "{:+.2}", f64::from(*cp) / 100.0),
            Score::Mate(n) if *n < 0 => write!(f, "-M{}", -n),
            Score::Mate(n) => write!(f, "+M{}", n),
        }
    }
}

/// Normalize a raw engine score, reported from `side_to_move`'s point of
/// view, into a White-relative evaluation in pawns.
///
/// Returns `None` when the engine produced no score at all, which callers
/// must keep distinct from an evaluation of exactly `0.0`.
pub fn normalize(raw: Option<uci::Score>, side_to_move: Color) -> Option<f64> {
    raw.map(|score| Score::from_uci(score, side_to_move).to_pawns())
}
