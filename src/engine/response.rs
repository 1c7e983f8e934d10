use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use super::uci::{InfoLine, Score};

const MATE_BASE: i32 = 30_000;
const MATE_STEP: i32 = 10;
const MAX_CENTIPAWNS: i32 = 29_000;

/// One principal variation reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineResponse {
    pub name: String,
    /// Side to move in the analysed position.
    pub is_white: bool,
    pub from_sq: String,
    pub to_sq: String,
    pub promotion: String,
    /// Space separated UCI moves, first one is the candidate.
    pub pv: String,
    /// From the mover's point of view, ignored when `mate != 0`.
    pub centipawns: i32,
    /// Mate in N moves, negative when the mover gets mated.
    pub mate: i32,
    pub depth: u32,
    pub seldepth: u32,
    pub time_ms: u64,
    pub nodes: u64,
    pub multipv: u32,
}

impl EngineResponse {
    pub fn from_info(name: &str, is_white: bool, info: &InfoLine) -> Option<EngineResponse> {
        if !info.is_pv_update() {
            return None;
        }
        let (centipawns, mate) = match info.score {
            Some(Score::Centipawns(cp)) => (cp, 0),
            Some(Score::Mate(m)) => (0, m),
            None => return None,
        };
        let mut rm = EngineResponse {
            name: name.to_string(),
            is_white,
            pv: info.pv.join(" "),
            centipawns,
            mate,
            depth: info.depth.unwrap_or(0),
            seldepth: info.seldepth.or(info.depth).unwrap_or(0),
            time_ms: info.time_ms.unwrap_or(0),
            nodes: info.nodes.unwrap_or(0),
            multipv: info.multipv.unwrap_or(1),
            ..EngineResponse::default()
        };
        rm.set_move(&info.pv[0]);
        Some(rm)
    }

    /// Evaluation of a finished game: mate delivered on the board or a draw.
    pub fn terminal(name: &str, is_white: bool, uci: &str, mate: i32) -> EngineResponse {
        let mut rm = EngineResponse {
            name: name.to_string(),
            is_white,
            pv: uci.to_string(),
            mate,
            ..EngineResponse::default()
        };
        rm.set_move(uci);
        rm
    }

    fn set_move(&mut self, uci: &str) {
        self.from_sq = uci.get(0..2).unwrap_or_default().to_string();
        self.to_sq = uci.get(2..4).unwrap_or_default().to_string();
        self.promotion = uci.get(4..5).unwrap_or_default().to_string();
    }

    /// The candidate move in UCI notation.
    pub fn uci_move(&self) -> String {
        format!("{}{}{}", self.from_sq, self.to_sq, self.promotion)
    }

    pub fn pv_moves(&self) -> impl Iterator<Item = &str> {
        self.pv.split_whitespace()
    }

    pub fn is_mate(&self) -> bool {
        self.mate != 0
    }

    /// Single comparable value, mates dominate every finite score.
    pub fn centipawns_abs(&self) -> i32 {
        match self.mate {
            0 => self.centipawns.clamp(-MAX_CENTIPAWNS, MAX_CENTIPAWNS),
            m if m > 0 => MATE_BASE - m * MATE_STEP,
            m => -MATE_BASE - m * MATE_STEP,
        }
    }

    pub fn score_white(&self) -> i32 {
        if self.is_white {
            self.centipawns_abs()
        } else {
            -self.centipawns_abs()
        }
    }

    /// Best first ordering: higher score, then deeper search.
    pub fn compare(&self, other: &EngineResponse) -> Ordering {
        other
            .centipawns_abs()
            .cmp(&self.centipawns_abs())
            .then(other.depth.cmp(&self.depth))
    }

    /// Re-anchors an evaluation of the position after `played` onto the
    /// position before it: the mover flips, `played` is prepended to the PV.
    pub fn change_side(&mut self, played: &str) {
        self.mate = -self.mate;
        if self.mate > 0 {
            self.mate += 1;
        }
        self.centipawns = -self.centipawns;
        self.is_white = !self.is_white;
        self.pv = if self.pv.is_empty() {
            played.to_string()
        } else {
            format!("{played} {}", self.pv)
        };
        self.set_move(played);
    }

    pub fn abbrev_text(&self) -> String {
        match self.mate {
            0 => format!("{:+.2}", self.centipawns as f64 / 100.0),
            m if m > 0 => format!("M{m}"),
            m => format!("-M{}", -m),
        }
    }
}

impl fmt::Display for EngineResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (depth {}, {}): {}",
            self.uci_move(),
            self.abbrev_text(),
            self.depth,
            self.name,
            self.pv
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rm(cp: i32, mate: i32) -> EngineResponse {
        EngineResponse {
            centipawns: cp,
            mate,
            ..EngineResponse::default()
        }
    }

    #[test]
    fn mates_dominate_centipawns() {
        assert!(rm(0, 3).centipawns_abs() > rm(50_000, 0).centipawns_abs());
        assert!(rm(0, 1).centipawns_abs() > rm(0, 4).centipawns_abs());
        assert!(rm(-50_000, 0).centipawns_abs() > rm(0, -4).centipawns_abs());
        // getting mated later is better than sooner
        assert!(rm(0, -6).centipawns_abs() > rm(0, -2).centipawns_abs());
        assert_eq!(rm(0, 2).compare(&rm(900, 0)), Ordering::Less);
    }

    #[test]
    fn builds_from_info_line() {
        let info = InfoLine {
            depth: Some(14),
            multipv: Some(2),
            score: Some(Score::Centipawns(31)),
            pv: vec!["e7e8q".into(), "d1d8".into()],
            ..InfoLine::default()
        };
        let rm = EngineResponse::from_info("sf", false, &info).unwrap();
        assert_eq!(rm.uci_move(), "e7e8q");
        assert_eq!(rm.promotion, "q");
        assert_eq!(rm.multipv, 2);
        assert_eq!(rm.seldepth, 14);
        assert_eq!(rm.score_white(), -31);
        assert_eq!(rm.abbrev_text(), "+0.31");
    }

    #[test]
    fn change_side_grafts_reply_analysis() {
        let mut reply = EngineResponse {
            name: "sf".into(),
            is_white: false,
            pv: "e7e5 g1f3".into(),
            centipawns: -40,
            depth: 9,
            ..EngineResponse::default()
        };
        reply.set_move("e7e5");
        reply.change_side("e2e4");
        assert!(reply.is_white);
        assert_eq!(reply.centipawns, 40);
        assert_eq!(reply.uci_move(), "e2e4");
        assert_eq!(reply.pv, "e2e4 e7e5 g1f3");
    }

    #[test]
    fn change_side_adjusts_mate_distance() {
        // opponent is mated in 2 after our move: we mate in 3
        let mut winning = rm(0, -2);
        winning.change_side("d1h5");
        assert_eq!(winning.mate, 3);

        // opponent mates in 2 after our move: we get mated in 2
        let mut losing = rm(0, 2);
        losing.change_side("a2a3");
        assert_eq!(losing.mate, -2);
        assert_eq!(losing.abbrev_text(), "-M2");
    }
}
