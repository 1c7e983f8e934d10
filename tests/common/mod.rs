#![allow(dead_code)]

use std::{
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use engine_manager::{
    Engine, EngineConnection, EngineError, EngineManager, Launcher, RunEngineParams,
    util::fen_of,
};
use shakmaty::{Board, CastlingMode, Chess, Color, Move, Position, Role, fen::Fen};
use tokio::sync::mpsc;

pub const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
/// Depth searched when `go` names no depth of its own.
pub const DEFAULT_DEPTH: u32 = 5;
/// Depths reported before an open ended search waits for `stop`.
pub const OPEN_DEPTHS: u32 = 3;

/// Everything the scripted engine was asked to do.
#[derive(Debug, Default)]
pub struct Stats {
    pub launches: u32,
    pub commands: Vec<String>,
    /// FEN of every `go`.
    pub searches: Vec<String>,
}

/// Starts an in-process UCI engine with a deterministic one ply evaluation.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    pub stats: Arc<Mutex<Stats>>,
    pub fail: bool,
    /// The engine exits as soon as it is asked to search.
    pub die_on_go: bool,
    /// Fixed reply to every `go`: lines, each after a delay in milliseconds.
    pub script: Option<Arc<Vec<(u64, String)>>>,
}

impl ScriptedLauncher {
    pub fn new() -> ScriptedLauncher {
        ScriptedLauncher::default()
    }

    pub fn failing() -> ScriptedLauncher {
        ScriptedLauncher {
            fail: true,
            ..ScriptedLauncher::default()
        }
    }

    pub fn dying() -> ScriptedLauncher {
        ScriptedLauncher {
            die_on_go: true,
            ..ScriptedLauncher::default()
        }
    }

    /// `stop` skips the rest of the script up to its bestmove.
    pub fn replaying(script: &[(u64, &str)]) -> ScriptedLauncher {
        let script = script.iter().map(|(ms, line)| (*ms, line.to_string())).collect();
        ScriptedLauncher {
            script: Some(Arc::new(script)),
            ..ScriptedLauncher::default()
        }
    }

    pub fn launches(&self) -> u32 {
        self.stats.lock().unwrap().launches
    }

    pub fn searches(&self) -> Vec<String> {
        self.stats.lock().unwrap().searches.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.stats.lock().unwrap().commands.clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn manager(&self, engine: Engine, params: RunEngineParams) -> EngineManager {
        EngineManager::new(engine, params, Arc::new(self.clone()))
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, engine: &Engine) -> Result<EngineConnection, EngineError> {
        if self.fail {
            return Err(EngineError::InvalidExecutable(engine.path.clone()));
        }
        self.stats.lock().unwrap().launches += 1;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_engine(command_rx, line_tx, self.clone()));
        Ok(EngineConnection::new(command_tx, line_rx).attach_task(task))
    }
}

pub fn scripted_engine(key: &str) -> Engine {
    let mut engine = Engine::new(key, format!("/opt/engines/{key}"));
    engine.name = format!("Scripted {key}");
    engine.multipv_max = 500;
    engine
}

enum Limit {
    Depth(u32),
    /// report a few depths, then wait for `stop` (or the time to pass)
    Open(Option<Duration>),
}

async fn run_engine(
    mut commands: mpsc::UnboundedReceiver<String>,
    lines: mpsc::UnboundedSender<String>,
    launcher: ScriptedLauncher,
) {
    let stats = launcher.stats;
    let send = |line: String| {
        let _ = lines.send(line);
    };
    let mut multipv = 1usize;
    let mut position = Chess::default();

    while let Some(command) = commands.recv().await {
        stats.lock().unwrap().commands.push(command.clone());
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied() {
            Some("uci") => {
                send("id name Scripted 1.0".to_string());
                send("id author engine-manager tests".to_string());
                send("option name MultiPV type spin default 1 min 1 max 500".to_string());
                send("option name UCI_Elo type spin default 1350 min 1350 max 2850".to_string());
                send("uciok".to_string());
            }
            Some("isready") => send("readyok".to_string()),
            Some("setoption") => {
                if parts.get(2) == Some(&"MultiPV") {
                    multipv = parts.get(4).and_then(|v| v.parse().ok()).unwrap_or(1);
                }
            }
            Some("position") => {
                position = match parts.get(1) {
                    Some(&"fen") => Fen::from_str(&parts[2..].join(" "))
                        .ok()
                        .and_then(|fen| fen.into_position(CastlingMode::Standard).ok())
                        .unwrap_or_default(),
                    _ => Chess::default(),
                };
            }
            Some("go") => {
                stats.lock().unwrap().searches.push(fen_of(&position));
                if launcher.die_on_go {
                    return;
                }
                if let Some(script) = launcher.script.as_ref() {
                    if !replay(&mut commands, &stats, &send, script).await {
                        return;
                    }
                    continue;
                }
                let limit = go_limit(&parts);
                let ranked = rank_moves(&position);
                if ranked.is_empty() {
                    send("bestmove (none)".to_string());
                    continue;
                }
                let shown = &ranked[..multipv.min(ranked.len())];
                match limit {
                    Limit::Depth(depth) => {
                        for d in 1..=depth {
                            report_depth(&send, &position, shown, d);
                        }
                    }
                    Limit::Open(time) => {
                        for d in 1..=OPEN_DEPTHS {
                            report_depth(&send, &position, shown, d);
                        }
                        if !wait_for_stop(&mut commands, &stats, time).await {
                            return;
                        }
                    }
                }
                send(format!("bestmove {}", uci(&ranked[0].0)));
            }
            Some("quit") => return,
            _ => {}
        }
    }
}

enum Interrupt {
    Elapsed,
    Stop,
    Quit,
}

async fn interrupted(
    commands: &mut mpsc::UnboundedReceiver<String>,
    stats: &Arc<Mutex<Stats>>,
    time: Duration,
) -> Interrupt {
    let waiting = async {
        while let Some(command) = commands.recv().await {
            stats.lock().unwrap().commands.push(command.clone());
            match command.as_str() {
                "stop" => return Interrupt::Stop,
                "quit" => return Interrupt::Quit,
                _ => {}
            }
        }
        Interrupt::Quit
    };
    tokio::time::timeout(time, waiting)
        .await
        .unwrap_or(Interrupt::Elapsed)
}

/// False when the engine was told to quit meanwhile.
async fn replay(
    commands: &mut mpsc::UnboundedReceiver<String>,
    stats: &Arc<Mutex<Stats>>,
    send: &impl Fn(String),
    script: &[(u64, String)],
) -> bool {
    let bestmove = script
        .iter()
        .map(|(_, line)| line)
        .find(|line| line.starts_with("bestmove"))
        .cloned()
        .unwrap_or_else(|| "bestmove (none)".to_string());
    for (ms, line) in script {
        if line.starts_with("bestmove") {
            break;
        }
        if *ms > 0 {
            match interrupted(commands, stats, Duration::from_millis(*ms)).await {
                Interrupt::Elapsed => {}
                Interrupt::Stop => break,
                Interrupt::Quit => return false,
            }
        }
        send(line.clone());
    }
    send(bestmove);
    true
}

/// False when the engine was told to quit meanwhile.
async fn wait_for_stop(
    commands: &mut mpsc::UnboundedReceiver<String>,
    stats: &Arc<Mutex<Stats>>,
    time: Option<Duration>,
) -> bool {
    let waiting = async {
        while let Some(command) = commands.recv().await {
            stats.lock().unwrap().commands.push(command.clone());
            match command.as_str() {
                "stop" => return true,
                "quit" => return false,
                _ => {}
            }
        }
        false
    };
    match time {
        Some(time) => tokio::time::timeout(time, waiting).await.unwrap_or(true),
        None => waiting.await,
    }
}

fn go_limit(parts: &[&str]) -> Limit {
    let value = |key: &str| {
        parts
            .iter()
            .position(|p| *p == key)
            .and_then(|i| parts.get(i + 1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    if let Some(depth) = value("depth") {
        Limit::Depth(depth as u32)
    } else if let Some(ms) = value("movetime") {
        Limit::Open(Some(Duration::from_millis(ms)))
    } else if parts.contains(&"infinite") {
        Limit::Open(None)
    } else {
        Limit::Depth(DEFAULT_DEPTH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eval {
    Cp(i32),
    Mate,
}

fn report_depth(
    send: &impl Fn(String),
    position: &Chess,
    shown: &[(Move, Eval)],
    depth: u32,
) {
    for (i, (m, eval)) in shown.iter().enumerate() {
        let score = match eval {
            Eval::Cp(cp) => format!("cp {cp}"),
            Eval::Mate => "mate 1".to_string(),
        };
        let mut pv = uci(m);
        let mut after = position.clone();
        after.play_unchecked(*m);
        if let Some(reply) = rank_moves(&after).first() {
            pv.push(' ');
            pv.push_str(&uci(&reply.0));
        }
        send(format!(
            "info depth {depth} seldepth {depth} multipv {} score {score} nodes {} nps 100000 time {} pv {pv}",
            i + 1,
            depth as u64 * 1_000,
            depth * 10,
        ));
    }
}

fn uci(m: &Move) -> String {
    m.to_uci(CastlingMode::Standard).to_string()
}

/// Legal moves, best first: mates, then material after the move, then the
/// file of the target square, then the move text.
fn rank_moves(position: &Chess) -> Vec<(Move, Eval)> {
    let mover = position.turn();
    let mut ranked: Vec<(Move, Eval)> = position
        .legal_moves()
        .into_iter()
        .map(|m| {
            let mut after = position.clone();
            after.play_unchecked(m);
            let eval = if after.is_checkmate() {
                Eval::Mate
            } else if after.is_stalemate() || after.is_insufficient_material() {
                Eval::Cp(0)
            } else {
                let file = m.to().file().char() as i32 - 'a' as i32;
                Eval::Cp(material(after.board(), mover) + file)
            };
            (m, eval)
        })
        .collect();
    ranked.sort_by(|(a, ea), (b, eb)| {
        key(*eb)
            .cmp(&key(*ea))
            .then_with(|| uci(a).cmp(&uci(b)))
    });
    ranked
}

fn key(eval: Eval) -> i32 {
    match eval {
        Eval::Mate => i32::MAX,
        Eval::Cp(cp) => cp,
    }
}

fn material(board: &Board, side: Color) -> i32 {
    let value = |color: Color| -> i32 {
        [
            (Role::Pawn, 100),
            (Role::Knight, 300),
            (Role::Bishop, 300),
            (Role::Rook, 500),
            (Role::Queen, 900),
        ]
        .iter()
        .map(|(role, v)| (board.by_role(*role) & board.by_color(color)).count() as i32 * v)
        .sum()
    };
    value(side) - value(side.other())
}
