pub mod analysis;
pub mod book;
pub mod cache;
pub mod manager;
pub mod multi_response;
pub mod play;
pub mod process;
pub mod protocol_log;
pub mod refresh;
pub mod registry;
pub mod response;
pub mod uci;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UciOption {
    pub name: String,
    pub value: String,
}

impl UciOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> UciOption {
        UciOption {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Strength-limited engine personalities that need extra care in simplified
/// endgames, picked once when the descriptor is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Persona {
    #[default]
    Standard,
    Wicker {
        elo: u32,
    },
    Maia,
    Irina,
}

impl Persona {
    pub fn is_strength_limited(&self) -> bool {
        !matches!(self, Persona::Standard)
    }

    /// Options to send once the persona reaches a simplified endgame, so it
    /// can still convert won positions.
    pub fn configure_for_strength_limit(&self) -> Vec<UciOption> {
        match *self {
            Persona::Standard => Vec::new(),
            Persona::Wicker { elo } => vec![
                UciOption::new("UCI_LimitStrength", "true"),
                UciOption::new("UCI_Elo", elo.max(WICKER_ENDGAME_MIN_ELO).to_string()),
                UciOption::new("Hash", "16"),
            ],
            // lc0 based, ignores UCI_Elo: reduce the hash and keep one thread
            Persona::Maia => vec![
                UciOption::new("Threads", "1"),
                UciOption::new("Hash", "16"),
            ],
            // its own handicap scheme has to be switched off explicitly
            Persona::Irina => vec![
                UciOption::new("UCI_LimitStrength", "false"),
                UciOption::new("Hash", "16"),
            ],
        }
    }
}

const WICKER_ENDGAME_MIN_ELO: u32 = 1800;

/// Descriptor of an external UCI engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engine {
    pub key: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub options: Vec<UciOption>,
    /// Largest MultiPV the engine accepts, 0 or 1 means no MultiPV support.
    #[serde(default)]
    pub multipv_max: u32,
    #[serde(default)]
    pub fixed_strength: bool,
    #[serde(default)]
    pub emulate_movetime: bool,
    #[serde(default)]
    pub elo: Option<u32>,
    #[serde(default)]
    pub persona: Persona,
}

impl Engine {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Engine {
        let key = key.into();
        Engine {
            name: key.clone(),
            key,
            path: path.into(),
            args: Vec::new(),
            options: Vec::new(),
            multipv_max: 1,
            fixed_strength: false,
            emulate_movetime: false,
            elo: None,
            persona: Persona::Standard,
        }
    }

    pub fn supports_multipv(&self) -> bool {
        self.multipv_max > 1
    }

    pub fn clamp_multipv(&self, requested: u32) -> u32 {
        if self.supports_multipv() {
            requested.clamp(1, self.multipv_max)
        } else {
            1
        }
    }
}

/// How long and how wide one search runs. All limits zero means "until stopped".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEngineParams {
    #[serde(default)]
    pub fixed_ms: u64,
    #[serde(default)]
    pub fixed_nodes: u64,
    #[serde(default)]
    pub fixed_depth: u32,
    #[serde(default = "default_multipv")]
    pub multipv: u32,
}

fn default_multipv() -> u32 {
    1
}

impl Default for RunEngineParams {
    fn default() -> Self {
        Self {
            fixed_ms: 0,
            fixed_nodes: 0,
            fixed_depth: 0,
            multipv: 1,
        }
    }
}

const FAST_MS: u64 = 5_000;
const FAST_DEPTH: u32 = 12;
const FAST_NODES: u64 = 1_000_000;

impl RunEngineParams {
    pub fn depth(depth: u32) -> Self {
        Self {
            fixed_depth: depth,
            ..Self::default()
        }
    }

    pub fn movetime(ms: u64) -> Self {
        Self {
            fixed_ms: ms,
            ..Self::default()
        }
    }

    pub fn nodes(nodes: u64) -> Self {
        Self {
            fixed_nodes: nodes,
            ..Self::default()
        }
    }

    pub fn with_multipv(mut self, multipv: u32) -> Self {
        self.multipv = multipv.max(1);
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.fixed_depth = depth;
        self
    }

    /// Deterministic stopping condition.
    pub fn is_fixed(&self) -> bool {
        self.fixed_depth > 0 || self.fixed_nodes > 0
    }

    pub fn is_infinite(&self) -> bool {
        self.fixed_ms == 0 && self.fixed_nodes == 0 && self.fixed_depth == 0
    }

    /// Cheap enough that a caller need not confirm a cancel.
    pub fn is_fast(&self) -> bool {
        if self.is_infinite() {
            return false;
        }
        (self.fixed_ms == 0 || self.fixed_ms <= FAST_MS)
            && (self.fixed_depth == 0 || self.fixed_depth <= FAST_DEPTH)
            && (self.fixed_nodes == 0 || self.fixed_nodes <= FAST_NODES)
    }

    /// `emulate_movetime` replaces `movetime` by `infinite` plus a manager-side stop.
    pub fn go_command(&self, emulate_movetime: bool) -> String {
        let mut cmd = "go".to_string();
        if self.fixed_depth > 0 {
            cmd.push_str(&format!(" depth {}", self.fixed_depth));
        }
        if self.fixed_nodes > 0 {
            cmd.push_str(&format!(" nodes {}", self.fixed_nodes));
        }
        if self.fixed_ms > 0 && !emulate_movetime {
            cmd.push_str(&format!(" movetime {}", self.fixed_ms));
        }
        if cmd == "go" {
            cmd.push_str(" infinite");
        }
        cmd
    }

    /// Cache entries are only valid for the parameters that produced them.
    pub fn fingerprint(&self) -> String {
        format!(
            "ms={};nodes={};depth={};multipv={}",
            self.fixed_ms, self.fixed_nodes, self.fixed_depth, self.multipv
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Low,
    VeryLow,
}

impl Priority {
    pub fn niceness(&self) -> i32 {
        match self {
            Priority::Normal => 0,
            Priority::Low => 10,
            Priority::VeryLow => 19,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_params() {
        let infinite = RunEngineParams::default();
        assert!(infinite.is_infinite());
        assert!(!infinite.is_fixed());
        assert!(!infinite.is_fast());

        assert!(RunEngineParams::depth(10).is_fixed());
        assert!(RunEngineParams::depth(10).is_fast());
        assert!(!RunEngineParams::depth(25).is_fast());

        assert!(!RunEngineParams::movetime(1000).is_fixed());
        assert!(RunEngineParams::movetime(1000).is_fast());
        assert!(!RunEngineParams::movetime(60_000).is_fast());
        assert!(RunEngineParams::nodes(5_000).is_fixed());
    }

    #[test]
    fn builds_go_commands() {
        assert_eq!(RunEngineParams::default().go_command(false), "go infinite");
        assert_eq!(RunEngineParams::depth(10).go_command(false), "go depth 10");
        assert_eq!(
            RunEngineParams::movetime(500).go_command(false),
            "go movetime 500"
        );
        assert_eq!(RunEngineParams::movetime(500).go_command(true), "go infinite");
    }

    #[test]
    fn with_depth_leaves_original_untouched() {
        let params = RunEngineParams::depth(10).with_multipv(3);
        let probe = params.with_depth(9).with_multipv(1);
        assert_eq!(params.fixed_depth, 10);
        assert_eq!(params.multipv, 3);
        assert_eq!(probe.fixed_depth, 9);
        assert_ne!(params.fingerprint(), probe.fingerprint());
    }

    #[test]
    fn clamps_multipv_to_engine_support() {
        let mut engine = Engine::new("sf", "/usr/bin/stockfish");
        assert_eq!(engine.clamp_multipv(4), 1);
        engine.multipv_max = 3;
        assert_eq!(engine.clamp_multipv(4), 3);
        assert_eq!(engine.clamp_multipv(0), 1);
    }

    #[test]
    fn personas_deserialize_and_configure() {
        let persona: Persona = serde_json::from_str(r#"{"kind":"wicker","elo":1200}"#).unwrap();
        assert_eq!(persona, Persona::Wicker { elo: 1200 });
        assert!(persona.is_strength_limited());
        let options = persona.configure_for_strength_limit();
        assert!(options.contains(&UciOption::new("UCI_Elo", "1800")));

        assert!(Persona::Standard.configure_for_strength_limit().is_empty());
        assert!(!Persona::Standard.is_strength_limited());
    }
}
