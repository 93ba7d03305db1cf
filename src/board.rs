use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, Move, Position};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("'{0}' is not a well-formed move")]
    InvalidNotation(String),
    #[error("'{0}' is not legal in the current position")]
    Illegal(String),
}

/// A move that has been validated and applied, with the SAN name rendered
/// relative to the position it was played from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMove {
    pub uci: String,
    pub san: String,
}

/// Thin facade over shakmaty. The real board is owned by exactly one game
/// session; legality trials go through disposable copies from `trial`.
#[derive(Debug, Clone, Default)]
pub struct GameBoard {
    position: Chess,
}

impl GameBoard {
    pub fn new() -> Self {
        Self {
            position: Chess::default(),
        }
    }

    /// Deep copy for disposable legality trials.
    pub fn trial(&self) -> Self {
        self.clone()
    }

    pub fn turn(&self) -> Color {
        self.position.turn()
    }

    /// Syntactic square-to-square parse only; says nothing about legality.
    pub fn parse_uci(raw: &str) -> Result<UciMove, BoardError> {
        raw.parse::<UciMove>()
            .map_err(|_| BoardError::InvalidNotation(raw.to_string()))
    }

    /// Resolve a short algebraic move against the current position without
    /// mutating it. Check/mate suffixes are tolerated.
    pub fn parse_san(&self, raw: &str) -> Result<Move, BoardError> {
        let san: SanPlus = raw
            .parse()
            .map_err(|_| BoardError::InvalidNotation(raw.to_string()))?;
        san.san
            .to_move(&self.position)
            .map_err(|_| BoardError::Illegal(raw.to_string()))
    }

    pub fn uci_string(chess_move: &Move) -> String {
        UciMove::from_move(chess_move, CastlingMode::Standard).to_string()
    }

    /// Validate a square-to-square move against the current position and
    /// apply it, returning the canonical UCI string and the SAN name.
    pub fn apply_uci(&mut self, raw: &str) -> Result<AppliedMove, BoardError> {
        let uci = Self::parse_uci(raw)?;
        let chess_move = uci
            .to_move(&self.position)
            .map_err(|_| BoardError::Illegal(raw.to_string()))?;
        let canonical = Self::uci_string(&chess_move);
        let san = SanPlus::from_move_and_play_unchecked(&mut self.position, &chess_move).to_string();
        Ok(AppliedMove {
            uci: canonical,
            san,
        })
    }
}
