use anyhow::{Result, bail};
use shakmaty::{CastlingMode, Chess, Move, Position};

use crate::util::{self, fen_of, fenm2};

/// A start position plus the legal moves played from it.
#[derive(Debug, Clone, Default)]
pub struct Game {
    initial: Chess,
    moves: Vec<Move>,
}

impl Game {
    pub fn new(initial: Chess) -> Game {
        Game {
            initial,
            moves: Vec::new(),
        }
    }

    /// `fen` may be `None` or `"startpos"` for the standard start position.
    pub fn from_uci(fen: Option<&str>, moves: &str) -> Result<Game> {
        let initial = match fen {
            None | Some("startpos") => Chess::default(),
            Some(fen) => util::position_from_fen(fen)?,
        };
        let mut game = Game::new(initial);
        for uci_move in util::parse_uci_moves(moves)? {
            game.push_uci(&uci_move.to_string())?;
        }
        Ok(game)
    }

    pub fn push_uci(&mut self, uci: &str) -> Result<()> {
        let position = self.last_position();
        if position.is_game_over() {
            bail!("game is over, cannot play {uci}");
        }
        let valid_move = util::parse_uci_move(uci)?.to_move(&position)?;
        self.moves.push(valid_move);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Position before ply `index` (`index == len()` is the final position).
    pub fn position_at(&self, index: usize) -> Option<Chess> {
        if index > self.moves.len() {
            return None;
        }
        let mut position = self.initial.clone();
        for m in &self.moves[..index] {
            position.play_unchecked(*m);
        }
        Some(position)
    }

    pub fn last_position(&self) -> Chess {
        let mut position = self.initial.clone();
        for m in &self.moves {
            position.play_unchecked(*m);
        }
        position
    }

    pub fn move_at(&self, index: usize) -> Option<&Move> {
        self.moves.get(index)
    }

    pub fn uci_at(&self, index: usize) -> Option<String> {
        self.moves
            .get(index)
            .map(|m| m.to_uci(CastlingMode::Standard).to_string())
    }

    pub fn fen_at(&self, index: usize) -> Option<String> {
        self.position_at(index).map(|p| fen_of(&p))
    }

    pub fn fenm2_at(&self, index: usize) -> Option<String> {
        self.fen_at(index).map(|fen| fenm2(&fen))
    }

    pub fn last_fen(&self) -> String {
        fen_of(&self.last_position())
    }
}
