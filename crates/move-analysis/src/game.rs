//! Recorded games: an initial position plus the moves actually played.

use std::io::Cursor;
use std::ops::ControlFlow;

use pgn_reader::{RawTag, Reader, SanPlus, Skip, Visitor};
use shakmaty::{Chess, Move};
use thiserror::Error;

use crate::rules::{self, RulesError};

/// Errors that can occur while loading a game.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    /// The input contains no game at all.
    #[error("No game found in input")]
    NoGame,
    /// The PGN text could not be read.
    #[error("Failed to read PGN: {0}")]
    Read(String),
    /// A move is not legal in the position it was played from.
    #[error("Illegal move {mv} at ply {ply}")]
    IllegalMove { ply: usize, mv: String },
    /// The starting position is invalid.
    #[error(transparent)]
    Position(#[from] RulesError),
}

/// Header tags the review output cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameTags {
    pub white: Option<String>,
    pub black: Option<String>,
    pub result: Option<String>,
    pub event: Option<String>,
}

/// A validated game record.
///
/// Every move is legal in the position reached by the moves before it,
/// so walking the game can never desynchronize from the rules engine.
#[derive(Debug, Clone)]
pub struct Game {
    pub tags: GameTags,
    initial: Chess,
    moves: Vec<Move>,
}

impl Game {
    /// Build a game from a starting position and already-resolved moves.
    pub fn new(initial: Chess, moves: Vec<Move>) -> Result<Self, GameError> {
        let mut pos = initial.clone();
        for (ply, mv) in moves.iter().enumerate() {
            pos = rules::apply(&pos, mv).map_err(|_| GameError::IllegalMove {
                ply,
                mv: rules::to_compact_notation(mv),
            })?;
        }
        Ok(Self {
            tags: GameTags::default(),
            initial,
            moves,
        })
    }

    /// Build a game from moves in compact (UCI) notation.
    ///
    /// `initial_fen` defaults to the standard starting position.
    pub fn from_uci_moves<S: AsRef<str>>(
        initial_fen: Option<&str>,
        moves: &[S],
    ) -> Result<Self, GameError> {
        let initial = match initial_fen {
            Some(fen) => rules::from_position_string(fen)?,
            None => Chess::default(),
        };

        let mut pos = initial.clone();
        let mut resolved = Vec::with_capacity(moves.len());
        for (ply, uci) in moves.iter().enumerate() {
            let uci = uci.as_ref();
            let mv = rules::from_compact_notation(&pos, uci).map_err(|_| {
                GameError::IllegalMove {
                    ply,
                    mv: uci.to_string(),
                }
            })?;
            pos = rules::apply(&pos, &mv)?;
            resolved.push(mv);
        }

        Ok(Self {
            tags: GameTags::default(),
            initial,
            moves: resolved,
        })
    }

    /// Parse the first game of a PGN document. Only the mainline is kept.
    pub fn from_pgn(text: &str) -> Result<Self, GameError> {
        let mut reader = Reader::new(Cursor::new(text.as_bytes()));
        let mut collector = MainlineCollector;
        match reader.read_game(&mut collector) {
            Ok(Some(game)) => game,
            Ok(None) => Err(GameError::NoGame),
            Err(e) => Err(GameError::Read(e.to_string())),
        }
    }

    pub fn initial_position(&self) -> &Chess {
        &self.initial
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Movetext state while reading one game.
struct Mainline {
    tags: GameTags,
    initial: Chess,
    pos: Chess,
    moves: Vec<Move>,
}

/// PGN visitor that keeps the tags and mainline of a single game.
struct MainlineCollector;

impl Visitor for MainlineCollector {
    type Tags = (GameTags, Option<String>);
    type Movetext = Mainline;
    type Output = Result<Game, GameError>;

    fn begin_tags(&mut self) -> ControlFlow<Self::Output, Self::Tags> {
        ControlFlow::Continue((GameTags::default(), None))
    }

    fn tag(
        &mut self,
        tags: &mut Self::Tags,
        name: &[u8],
        value: RawTag<'_>,
    ) -> ControlFlow<Self::Output> {
        let value = value.decode_utf8_lossy().into_owned();
        match name {
            b"White" => tags.0.white = Some(value),
            b"Black" => tags.0.black = Some(value),
            b"Result" => tags.0.result = Some(value),
            b"Event" => tags.0.event = Some(value),
            b"FEN" => tags.1 = Some(value),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn begin_movetext(&mut self, tags: Self::Tags) -> ControlFlow<Self::Output, Mainline> {
        let (tags, fen) = tags;
        let initial = match fen {
            Some(fen) => match rules::from_position_string(&fen) {
                Ok(pos) => pos,
                Err(e) => return ControlFlow::Break(Err(e.into())),
            },
            None => Chess::default(),
        };
        ControlFlow::Continue(Mainline {
            tags,
            pos: initial.clone(),
            initial,
            moves: Vec::new(),
        })
    }

    fn san(&mut self, game: &mut Mainline, san_plus: SanPlus) -> ControlFlow<Self::Output> {
        let ply = game.moves.len();
        let illegal = || GameError::IllegalMove {
            ply,
            mv: san_plus.to_string(),
        };

        let mv = match san_plus.san.to_move(&game.pos) {
            Ok(mv) => mv,
            Err(_) => return ControlFlow::Break(Err(illegal())),
        };
        match rules::apply(&game.pos, &mv) {
            Ok(next) => game.pos = next,
            Err(_) => return ControlFlow::Break(Err(illegal())),
        }
        game.moves.push(mv);
        ControlFlow::Continue(())
    }

    fn begin_variation(&mut self, _game: &mut Mainline) -> ControlFlow<Self::Output, Skip> {
        ControlFlow::Continue(Skip(true))
    }

    fn end_game(&mut self, game: Mainline) -> Self::Output {
        Ok(Game {
            tags: game.tags,
            initial: game.initial,
            moves: game.moves,
        })
    }
}
