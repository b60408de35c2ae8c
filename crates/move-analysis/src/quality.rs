//! Move quality classification.
//!
//! Three interchangeable strategies map a pair of evaluations (and, for the
//! context-aware one, some facts about the move) to a [`QualityLabel`].
//! Evaluations are in pawns, as produced by [`crate::evaluation::normalize`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shakmaty::{Chess, Color, Move, Position};
use thiserror::Error;

use crate::sacrifice::is_sacrifice;

/// Centipawn loss at or above which a move is a blunder.
pub const BLUNDER_CP: f64 = 300.0;
/// Centipawn loss at or above which a move is a mistake.
pub const MISTAKE_CP: f64 = 175.0;
/// Centipawn loss at or above which a move is dubious.
pub const DUBIOUS_CP: f64 = 100.0;

/// Win-probability drop at or above which a move is a blunder.
pub const BLUNDER_WIN_DROP: f64 = 0.6;
/// Win-probability drop at or above which a move is a mistake.
pub const MISTAKE_WIN_DROP: f64 = 0.4;
/// Win-probability drop at or above which a move is dubious.
pub const DUBIOUS_WIN_DROP: f64 = 0.2;

/// Largest evaluation change (in pawns) a sacrifice may cost and still be brilliant.
pub const BRILLIANT_MAX_DELTA: f64 = 0.5;
/// Mover's evaluation above which the position counts as won.
pub const WINNING_EVAL: f64 = 2.0;
/// Mover's evaluation below which a previously won position counts as let go.
pub const LET_GO_EVAL: f64 = 0.5;

/// Classification of move quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLabel {
    /// Best and only good move, giving up material for nothing measurable (!!)
    BrilliantMove,
    /// Best move where every alternative loses ground (!)
    OnlyGoodMove,
    /// The engine's own choice
    BestMove,
    /// Near-best move
    ExcellentMove,
    /// Small centipawn loss
    GoodMove,
    /// Noticeable loss (?!)
    Dubious,
    /// Significant loss (?)
    Mistake,
    /// A won position let slip (X)
    MissedWin,
    /// Major loss (??)
    Blunder,
    /// Known opening theory
    TheoreticalMove,
}

impl QualityLabel {
    /// Every label, in roughly descending order of quality.
    pub const ALL: [QualityLabel; 10] = [
        QualityLabel::BrilliantMove,
        QualityLabel::OnlyGoodMove,
        QualityLabel::BestMove,
        QualityLabel::ExcellentMove,
        QualityLabel::GoodMove,
        QualityLabel::TheoreticalMove,
        QualityLabel::Dubious,
        QualityLabel::Mistake,
        QualityLabel::MissedWin,
        QualityLabel::Blunder,
    ];

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            QualityLabel::BrilliantMove => "Brilliant move",
            QualityLabel::OnlyGoodMove => "Only good move",
            QualityLabel::BestMove => "Best move",
            QualityLabel::ExcellentMove => "Excellent move",
            QualityLabel::GoodMove => "Good move",
            QualityLabel::Dubious => "Dubious move",
            QualityLabel::Mistake => "Mistake",
            QualityLabel::MissedWin => "Missed win",
            QualityLabel::Blunder => "Blunder",
            QualityLabel::TheoreticalMove => "Theoretical move",
        }
    }

    /// Annotation glyph, empty for labels that have none.
    pub fn symbol(self) -> &'static str {
        match self {
            QualityLabel::BrilliantMove => "!!",
            QualityLabel::OnlyGoodMove | QualityLabel::ExcellentMove => "!",
            QualityLabel::Dubious => "?!",
            QualityLabel::Mistake => "?",
            QualityLabel::MissedWin => "X",
            QualityLabel::Blunder => "??",
            QualityLabel::BestMove | QualityLabel::GoodMove | QualityLabel::TheoreticalMove => "",
        }
    }

    /// True for labels that point at an error by the mover.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            QualityLabel::Dubious
                | QualityLabel::Mistake
                | QualityLabel::MissedWin
                | QualityLabel::Blunder
        )
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbol() {
            "" => write!(f, "{}", self.name()),
            symbol => write!(f, "{} ({})", self.name(), symbol),
        }
    }
}

/// The classification strategy in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    /// Bands on raw centipawn loss.
    #[default]
    Simplified,
    /// Bands on the drop in logistic win probability. Both evaluations are
    /// read from the mover's side, so a Black move that loses ground counts
    /// as a drop.
    WinProbability,
    /// Centipawn bands plus theory, only-move, brilliancy and missed-win labels.
    ContextAware,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown classifier '{0}' (expected simplified, win_probability or context_aware)")]
pub struct UnknownClassifier(pub String);

impl FromStr for ClassifierKind {
    type Err = UnknownClassifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "simplified" => Ok(ClassifierKind::Simplified),
            "win_probability" => Ok(ClassifierKind::WinProbability),
            "context_aware" => Ok(ClassifierKind::ContextAware),
            _ => Err(UnknownClassifier(s.to_string())),
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClassifierKind::Simplified => "simplified",
            ClassifierKind::WinProbability => "win_probability",
            ClassifierKind::ContextAware => "context_aware",
        };
        f.write_str(name)
    }
}

/// Everything known about one played move at classification time.
#[derive(Debug, Clone, Copy)]
pub struct MoveFacts<'a> {
    /// White-relative evaluation of the best continuation, in pawns.
    pub eval_before: f64,
    /// White-relative evaluation after the move played, in pawns.
    pub eval_after: f64,
    /// The move played is the engine's first choice.
    pub is_best_move: bool,
    /// Every alternative to the best move is clearly worse.
    pub is_only_good_move: bool,
    /// The move is still within known opening theory.
    pub is_opening_book: bool,
    /// Position before the move.
    pub position: &'a Chess,
    /// The move played.
    pub played: &'a Move,
}

impl MoveFacts<'_> {
    /// Side that played the move.
    pub fn mover(&self) -> Color {
        self.position.turn()
    }

    /// Evaluations before and after, seen from the mover's side.
    pub fn mover_evals(&self) -> (f64, f64) {
        match self.mover() {
            Color::White => (self.eval_before, self.eval_after),
            Color::Black => (-self.eval_before, -self.eval_after),
        }
    }
}

impl ClassifierKind {
    /// Classify a move with this strategy.
    pub fn classify(self, facts: &MoveFacts<'_>) -> QualityLabel {
        match self {
            ClassifierKind::Simplified => {
                classify_simplified(facts.eval_before, facts.eval_after, facts.is_best_move)
            }
            ClassifierKind::WinProbability => {
                let (before, after) = facts.mover_evals();
                classify_win_probability(before, after, facts.is_best_move)
            }
            ClassifierKind::ContextAware => classify_context_aware(facts),
        }
    }

    /// Whether this strategy needs the extra only-move and book context.
    pub fn needs_context(self) -> bool {
        matches!(self, ClassifierKind::ContextAware)
    }
}

/// Absolute evaluation change in centipawns.
///
/// Evaluations arrive as whole centipawns divided by 100; the result is
/// snapped to a millionth of a centipawn so float noise cannot push a
/// value across a band boundary.
pub fn centipawn_loss(eval_before: f64, eval_after: f64) -> f64 {
    ((eval_before - eval_after).abs() * 100.0 * 1e6).round() / 1e6
}

fn band_by_loss(loss_cp: f64) -> QualityLabel {
    if loss_cp >= BLUNDER_CP {
        QualityLabel::Blunder
    } else if loss_cp >= MISTAKE_CP {
        QualityLabel::Mistake
    } else if loss_cp >= DUBIOUS_CP {
        QualityLabel::Dubious
    } else {
        QualityLabel::GoodMove
    }
}

/// Centipawn-loss bands: 300+ blunder, 175+ mistake, 100+ dubious.
pub fn classify_simplified(
    eval_before: f64,
    eval_after: f64,
    is_best_move: bool,
) -> QualityLabel {
    if is_best_move {
        return QualityLabel::BestMove;
    }
    band_by_loss(centipawn_loss(eval_before, eval_after))
}

/// Logistic win probability for a centipawn evaluation.
pub fn win_probability(centipawns: f64) -> f64 {
    1.0 / (1.0 + (-centipawns / 100.0).exp())
}

/// Win-probability bands on the drop from `eval_before` to `eval_after`,
/// both given in pawns from the mover's point of view.
pub fn classify_win_probability(
    eval_before: f64,
    eval_after: f64,
    is_best_move: bool,
) -> QualityLabel {
    if is_best_move {
        return QualityLabel::BestMove;
    }

    let drop = win_probability(eval_before * 100.0) - win_probability(eval_after * 100.0);
    if drop >= BLUNDER_WIN_DROP {
        QualityLabel::Blunder
    } else if drop >= MISTAKE_WIN_DROP {
        QualityLabel::Mistake
    } else if drop >= DUBIOUS_WIN_DROP {
        QualityLabel::Dubious
    } else {
        QualityLabel::GoodMove
    }
}

/// Centipawn bands extended with theory, only-move, brilliancy and
/// missed-win labels.
pub fn classify_context_aware(facts: &MoveFacts<'_>) -> QualityLabel {
    if facts.is_opening_book {
        return QualityLabel::TheoreticalMove;
    }

    let loss = centipawn_loss(facts.eval_before, facts.eval_after);

    if facts.is_best_move && facts.is_only_good_move {
        if loss <= BRILLIANT_MAX_DELTA * 100.0 && is_sacrifice(facts.position, facts.played) {
            return QualityLabel::BrilliantMove;
        }
        return QualityLabel::OnlyGoodMove;
    }

    if facts.is_best_move {
        return QualityLabel::BestMove;
    }

    let (before, after) = facts.mover_evals();
    if before > WINNING_EVAL && after < LET_GO_EVAL {
        return QualityLabel::MissedWin;
    }

    band_by_loss(loss)
}
