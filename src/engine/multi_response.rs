use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{response::EngineResponse, uci::InfoLine};

/// The candidate moves of one MultiPV search of one position.
///
/// `li_rm` always holds a complete depth readout. Lines of the depth the
/// engine is still working on wait in `partial` until that depth is done.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MultiEngineResponse {
    pub name: String,
    pub fen: String,
    pub is_white: bool,
    pub multipv: u32,
    li_rm: Vec<EngineResponse>,
    depth: u32,
    time_ms: u64,
    #[serde(skip)]
    partial: BTreeMap<u32, EngineResponse>,
    #[serde(skip)]
    partial_depth: u32,
}

impl MultiEngineResponse {
    pub fn new(name: &str, fen: &str, is_white: bool, multipv: u32) -> MultiEngineResponse {
        MultiEngineResponse {
            name: name.to_string(),
            fen: fen.to_string(),
            is_white,
            multipv: multipv.max(1),
            ..MultiEngineResponse::default()
        }
    }

    /// Feeds one `info` line. Returns true when a depth readout got committed.
    pub fn dispatch_info(&mut self, info: &InfoLine) -> bool {
        let Some(rm) = EngineResponse::from_info(&self.name, self.is_white, info) else {
            return false;
        };
        let mut committed = false;
        if rm.depth > self.partial_depth && !self.partial.is_empty() {
            committed = self.commit_partial();
        }
        self.partial_depth = self.partial_depth.max(rm.depth);
        self.partial.insert(rm.multipv, rm);
        committed
    }

    /// The engine sent `bestmove`: keep the last depth only if all of its lines arrived.
    pub fn finish(&mut self) -> bool {
        let complete = self.partial.len() >= self.li_rm.len()
            || self.partial.len() as u32 >= self.multipv;
        let committed = if complete && !self.partial.is_empty() {
            self.commit_partial()
        } else {
            false
        };
        self.partial.clear();
        self.partial_depth = 0;
        committed
    }

    fn commit_partial(&mut self) -> bool {
        let depth = self.partial_depth;
        let lines = std::mem::take(&mut self.partial);
        if depth < self.depth {
            return false;
        }
        let mut li_rm: Vec<EngineResponse> = lines.into_values().collect();
        // lines of the previous readout the engine did not repeat at this depth
        for old in &self.li_rm {
            let repeated = li_rm
                .iter()
                .any(|rm| rm.multipv == old.multipv || rm.uci_move() == old.uci_move());
            if !repeated && li_rm.len() < self.li_rm.len() {
                li_rm.push(old.clone());
            }
        }
        li_rm.sort_by_key(|rm| rm.multipv);
        self.time_ms = li_rm.iter().map(|rm| rm.time_ms).max().unwrap_or(self.time_ms);
        self.depth = depth;
        self.li_rm = li_rm;
        true
    }

    /// Copy without the depth still in progress.
    pub fn snapshot(&self) -> MultiEngineResponse {
        let mut mrm = self.clone();
        mrm.partial.clear();
        mrm.partial_depth = 0;
        mrm
    }

    /// Sort best first.
    pub fn ordena(&mut self) {
        self.li_rm.sort_by(|a, b| a.compare(b));
    }

    /// Entry for a UCI move and its rank, `None` when it was never a candidate.
    pub fn search_rm(&self, uci: &str) -> Option<(&EngineResponse, usize)> {
        let uci = uci.trim();
        self.li_rm
            .iter()
            .enumerate()
            .find(|(_, rm)| rm.uci_move() == uci)
            .map(|(pos, rm)| (rm, pos))
    }

    /// Appends an evaluation obtained outside the MultiPV search, replacing
    /// a previous one for the same move.
    pub fn add_rm(&mut self, rm: EngineResponse) {
        let uci = rm.uci_move();
        self.li_rm.retain(|other| other.uci_move() != uci);
        self.li_rm.push(rm);
    }

    /// Takes over the other readout's entries when they are at least as deep.
    pub fn merge(&mut self, other: &MultiEngineResponse) {
        for rm in &other.li_rm {
            match self.li_rm.iter_mut().find(|own| own.uci_move() == rm.uci_move()) {
                Some(own) if own.depth <= rm.depth => *own = rm.clone(),
                Some(_) => {}
                None => self.li_rm.push(rm.clone()),
            }
        }
        if other.depth >= self.depth {
            self.depth = other.depth;
            self.time_ms = self.time_ms.max(other.time_ms);
        }
    }

    pub fn best_rm(&self) -> Option<&EngineResponse> {
        self.li_rm.first()
    }

    pub fn rm(&self, pos: usize) -> Option<&EngineResponse> {
        self.li_rm.get(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineResponse> {
        self.li_rm.iter()
    }

    pub fn len(&self) -> usize {
        self.li_rm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.li_rm.is_empty()
    }

    pub fn max_depth(&self) -> u32 {
        self.depth
    }

    pub fn max_time(&self) -> u64 {
        self.time_ms
    }

    /// All entries mating in exactly the best mate distance of the readout.
    pub fn mate_rms(&self) -> Vec<EngineResponse> {
        let Some(shortest) = self.li_rm.iter().filter(|rm| rm.mate > 0).map(|rm| rm.mate).min()
        else {
            return Vec::new();
        };
        self.li_rm
            .iter()
            .filter(|rm| rm.mate == shortest)
            .cloned()
            .collect()
    }
}
