//! Line level parsing of what a UCI engine prints on stdout.

#[derive(Debug, Clone, PartialEq)]
pub enum UciMessage {
    IdName(String),
    IdAuthor(String),
    Option(String),
    UciOk,
    ReadyOk,
    BestMove {
        best_move: Option<String>,
        ponder: Option<String>,
    },
    Info(InfoLine),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Score {
    Centipawns(i32),
    Mate(i32),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoLine {
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    pub multipv: Option<u32>,
    pub score: Option<Score>,
    /// lowerbound / upperbound scores are not exact and never update a PV
    pub bound: bool,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    pub time_ms: Option<u64>,
    pub hashfull: Option<u32>,
    pub pv: Vec<String>,
}

impl InfoLine {
    /// Only exact, scored lines with a principal variation feed the analysis.
    pub fn is_pv_update(&self) -> bool {
        self.depth.is_some() && self.score.is_some() && !self.bound && !self.pv.is_empty()
    }
}

pub fn parse_uci_line(line: &str) -> Option<UciMessage> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return None;
    }

    match parts[0] {
        "id" => {
            if parts.len() >= 3 {
                match parts[1] {
                    "name" => Some(UciMessage::IdName(parts[2..].join(" "))),
                    "author" => Some(UciMessage::IdAuthor(parts[2..].join(" "))),
                    _ => None,
                }
            } else {
                None
            }
        }
        "option" => option_name(&parts).map(UciMessage::Option),
        "uciok" => Some(UciMessage::UciOk),
        "readyok" => Some(UciMessage::ReadyOk),
        "bestmove" => {
            let best_move = parts
                .get(1)
                .filter(|m| **m != "(none)" && **m != "0000")
                .map(|m| m.to_string());
            let ponder = if parts.len() >= 4 && parts[2] == "ponder" {
                Some(parts[3].to_string())
            } else {
                None
            };
            Some(UciMessage::BestMove { best_move, ponder })
        }
        "info" => Some(UciMessage::Info(parse_info(&parts[1..]))),
        _ => Some(UciMessage::Unknown(line.to_string())),
    }
}

fn option_name(parts: &[&str]) -> Option<String> {
    let start = parts.iter().position(|p| *p == "name")? + 1;
    let end = parts
        .iter()
        .position(|p| *p == "type")
        .unwrap_or(parts.len());
    (start < end).then(|| parts[start..end].join(" "))
}

fn parse_info(parts: &[&str]) -> InfoLine {
    let mut info = InfoLine::default();
    let value = |i: usize| parts.get(i + 1).copied();

    let mut i = 0;
    while i < parts.len() {
        match parts[i] {
            "depth" => {
                info.depth = value(i).and_then(|v| v.parse().ok());
                i += 2;
            }
            "seldepth" => {
                info.seldepth = value(i).and_then(|v| v.parse().ok());
                i += 2;
            }
            "multipv" => {
                info.multipv = value(i).and_then(|v| v.parse().ok());
                i += 2;
            }
            "nodes" => {
                info.nodes = value(i).and_then(|v| v.parse().ok());
                i += 2;
            }
            "nps" => {
                info.nps = value(i).and_then(|v| v.parse().ok());
                i += 2;
            }
            "time" => {
                info.time_ms = value(i).and_then(|v| v.parse().ok());
                i += 2;
            }
            "hashfull" => {
                info.hashfull = value(i).and_then(|v| v.parse().ok());
                i += 2;
            }
            "score" => {
                let amount = parts.get(i + 2).and_then(|v| v.parse::<i32>().ok());
                info.score = match (value(i), amount) {
                    (Some("cp"), Some(cp)) => Some(Score::Centipawns(cp)),
                    (Some("mate"), Some(mate)) => Some(Score::Mate(mate)),
                    _ => None,
                };
                i += 3;
                if matches!(parts.get(i), Some(&"lowerbound") | Some(&"upperbound")) {
                    info.bound = true;
                    i += 1;
                }
            }
            "pv" => {
                info.pv = parts[i + 1..].iter().map(|m| m.to_string()).collect();
                break;
            }
            // free text runs to the end of the line
            "string" => break,
            _ => i += 1,
        }
    }

    info
}
