//! Material sacrifice heuristic.

use shakmaty::{Chess, Move, Position, Role};

/// Minimum material value of a moved piece for the move to count as a sacrifice.
pub const MIN_SACRIFICE_VALUE: u32 = 3;

/// Conventional material value of a piece. Kings are worth nothing here
/// because they can never be given up.
pub fn piece_value(role: Role) -> u32 {
    match role {
        Role::Pawn => 1,
        Role::Knight | Role::Bishop => 3,
        Role::Rook => 5,
        Role::Queen => 9,
        Role::King => 0,
    }
}

/// Does `mv` leave a piece worth at least a minor piece standing on an
/// attacked square?
///
/// No search is done for recapture compensation, and pawns and kings are
/// never reported. `pos` is not modified; the move is tried on a copy.
pub fn is_sacrifice(pos: &Chess, mv: &Move) -> bool {
    if piece_value(mv.role()) < MIN_SACRIFICE_VALUE {
        return false;
    }

    let after = match pos.clone().play(*mv) {
        Ok(after) => after,
        Err(_) => return false,
    };

    let board = after.board();
    // After the move the opponent is the side to move.
    let attackers = board.attacks_to(mv.to(), after.turn(), board.occupied());
    !attackers.is_empty()
}
