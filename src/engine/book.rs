use std::collections::HashMap;

use rand::{Rng, rng};

use crate::util::fenm2;

/// Opening book as seen by the play manager.
pub trait OpeningBook: Send {
    fn is_active(&self) -> bool;

    /// UCI move for the position, `None` when the book has nothing.
    fn get_move(&mut self, fen: &str, ply: usize) -> Option<String>;

    /// Stop consulting the book for the rest of the game.
    fn deactivate(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BookMode {
    /// always the heaviest move
    #[default]
    Best,
    /// weighted random pick
    Random,
}

/// Book held in memory, keyed by reduced FEN.
#[derive(Debug, Clone, Default)]
pub struct MemoryBook {
    entries: HashMap<String, Vec<(String, u32)>>,
    mode: BookMode,
    max_ply: usize,
    active: bool,
}

impl MemoryBook {
    pub fn new(mode: BookMode, max_ply: usize) -> MemoryBook {
        MemoryBook {
            entries: HashMap::new(),
            mode,
            max_ply,
            active: true,
        }
    }

    pub fn add(&mut self, fen: &str, uci: &str, weight: u32) {
        let moves = self.entries.entry(fenm2(fen)).or_default();
        match moves.iter_mut().find(|(m, _)| m == uci) {
            Some((_, w)) => *w += weight,
            None => moves.push((uci.to_string(), weight.max(1))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OpeningBook for MemoryBook {
    fn is_active(&self) -> bool {
        self.active
    }

    fn get_move(&mut self, fen: &str, ply: usize) -> Option<String> {
        if !self.active {
            return None;
        }
        if self.max_ply > 0 && ply >= self.max_ply {
            self.active = false;
            return None;
        }
        let moves = self.entries.get(&fenm2(fen))?;
        match self.mode {
            BookMode::Best => moves
                .iter()
                .max_by_key(|(_, weight)| *weight)
                .map(|(m, _)| m.clone()),
            BookMode::Random => {
                let total: u32 = moves.iter().map(|(_, w)| *w).sum();
                let mut pick = rng().random_range(0..total.max(1));
                for (m, weight) in moves {
                    if pick < *weight {
                        return Some(m.clone());
                    }
                    pick -= weight;
                }
                moves.last().map(|(m, _)| m.clone())
            }
        }
    }

    fn deactivate(&mut self) {
        self.active = false;
    }
}
