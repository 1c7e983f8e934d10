use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shakmaty::{Chess, Position};
use tokio::time::Instant;

use super::{
    RunEngineParams,
    book::OpeningBook,
    manager::{EngineManager, Verdict},
    response::EngineResponse,
};
use crate::{
    game::Game,
    util::{fen_of, is_simplified_endgame, is_white, parse_uci_move},
};

const DEFAULT_REFRESH: Duration = Duration::from_millis(500);
const DEFAULT_BOOK_MISSES: u32 = 2;

pub const HUMANIZE_MIN_SECS: f64 = 1.0;
pub const HUMANIZE_MAX_SECS: f64 = 45.0;
const HUMAN_TIMES_KEPT: usize = 5;

/// Clock situation handed to the engine instead of fixed limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayClock {
    pub wtime_ms: u64,
    pub btime_ms: u64,
    pub winc_ms: u64,
    pub binc_ms: u64,
    #[serde(default)]
    pub movestogo: Option<u32>,
}

impl PlayClock {
    pub fn go_command(&self) -> String {
        let mut cmd = format!(
            "go wtime {} btime {} winc {} binc {}",
            self.wtime_ms, self.btime_ms, self.winc_ms, self.binc_ms
        );
        if let Some(movestogo) = self.movestogo.filter(|m| *m > 0) {
            cmd.push_str(&format!(" movestogo {movestogo}"));
        }
        cmd
    }
}

/// The move the manager decided on.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedMove {
    pub uci: String,
    pub from_book: bool,
    /// Engine evaluation of the move, absent for book moves.
    pub rm: Option<EngineResponse>,
    pub elapsed: Duration,
}

/// How long an engine move is held back before it is released.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Humanize {
    #[default]
    Off,
    /// Minimum wall time from the request to the move.
    Fixed(Duration),
    /// Think time from `humanize()`: `porc` percent of the clock share per move,
    /// blended with the opponent's recent think times. Only clock games use it.
    Clock { porc: u32 },
}

enum Budget<'a> {
    Params(RunEngineParams),
    Clock(&'a PlayClock),
}

/// Produces moves for a game: strength-limit care, then the book, then the engine.
pub struct EngineManagerPlay {
    manager: EngineManager,
    book: Option<Box<dyn OpeningBook>>,
    book_misses: u32,
    book_max_misses: u32,
    wicker_pending: bool,
    humanize: Humanize,
    human_times: Vec<f64>,
    refresh: Duration,
}

impl EngineManagerPlay {
    pub fn new(manager: EngineManager) -> EngineManagerPlay {
        let wicker_pending = manager.engine().persona.is_strength_limited();
        EngineManagerPlay {
            manager,
            book: None,
            book_misses: 0,
            book_max_misses: DEFAULT_BOOK_MISSES,
            wicker_pending,
            humanize: Humanize::Off,
            human_times: Vec::new(),
            refresh: DEFAULT_REFRESH,
        }
    }

    pub fn with_refresh(mut self, refresh: Duration) -> EngineManagerPlay {
        self.refresh = refresh;
        self
    }

    /// The book is dropped for good after more than `max_misses` misses.
    pub fn set_book(&mut self, book: Option<Box<dyn OpeningBook>>, max_misses: u32) {
        self.book = book;
        self.book_misses = 0;
        self.book_max_misses = max_misses;
    }

    pub fn book_active(&self) -> bool {
        self.book.as_ref().is_some_and(|book| book.is_active())
    }

    pub fn set_humanize(&mut self, humanize: Humanize) {
        self.humanize = match humanize {
            Humanize::Fixed(d) if d.is_zero() => Humanize::Off,
            Humanize::Clock { porc: 0 } => Humanize::Off,
            other => other,
        };
    }

    pub fn humanize_mode(&self) -> Humanize {
        self.humanize
    }

    /// Think time of the human's last move, in seconds.
    pub fn record_human_time(&mut self, secs: f64) {
        if !secs.is_finite() || secs < 0.0 {
            return;
        }
        self.human_times.push(secs);
        if self.human_times.len() > HUMAN_TIMES_KEPT {
            self.human_times.remove(0);
        }
    }

    /// The hold-back for an engine move in `game`, given the clock if there is one.
    pub fn humanize_delay(&self, game: &Game, clock: Option<&PlayClock>) -> Option<Duration> {
        match (self.humanize, clock) {
            (Humanize::Off, _) => None,
            (Humanize::Fixed(d), _) => Some(d),
            (Humanize::Clock { porc }, Some(clock)) => {
                let secs = humanize_for_game(game, porc, clock, &self.human_times);
                Duration::try_from_secs_f64(secs).ok()
            }
            (Humanize::Clock { .. }, None) => None,
        }
    }

    /// Whether the endgame reconfiguration of a strength-limited persona is still due.
    pub fn wicker_pending(&self) -> bool {
        self.wicker_pending
    }

    /// One move for the final position of `game` within the manager's parameters.
    pub async fn play<D>(&mut self, game: &Game, dispatcher: D) -> Option<PlayedMove>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        let params = *self.manager.params();
        self.play_budget(game, Budget::Params(params), dispatcher).await
    }

    /// One move for the final position of `game`, the engine manages its clock.
    pub async fn play_with_clock<D>(
        &mut self,
        game: &Game,
        clock: &PlayClock,
        dispatcher: D,
    ) -> Option<PlayedMove>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        self.play_budget(game, Budget::Clock(clock), dispatcher).await
    }

    async fn play_budget<D>(
        &mut self,
        game: &Game,
        budget: Budget<'_>,
        mut dispatcher: D,
    ) -> Option<PlayedMove>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        let started = Instant::now();
        let position = game.last_position();
        if position.is_game_over() {
            debug!("no move to play, the game is over");
            return None;
        }
        if !self.manager.ensure_idle().await {
            return None;
        }

        self.check_wicker(&position);

        if let Some(uci) = self.book_move(&position, game.len()) {
            info!("book move {uci}");
            return Some(PlayedMove {
                uci,
                from_book: true,
                rm: None,
                elapsed: started.elapsed(),
            });
        }

        let delay = match budget {
            Budget::Params(_) => self.humanize_delay(game, None),
            Budget::Clock(clock) => self.humanize_delay(game, Some(clock)),
        };
        let fen = fen_of(&position);
        let (searching, refresh) = match budget {
            Budget::Params(params) => {
                // small fixed searches finish on their own, no need to poll them
                let refresh = (!params.is_fast()).then_some(self.refresh);
                (self.manager.go(&fen, &params).await, refresh)
            }
            Budget::Clock(clock) => {
                let command = clock.go_command();
                let multipv = self.manager.params().multipv;
                (
                    self.manager.go_with(&fen, multipv, &command, None).await,
                    Some(self.refresh),
                )
            }
        };
        if !searching {
            return None;
        }

        let mrm = self
            .manager
            .wait_search(refresh, |mrm, ms| {
                if dispatcher(mrm.best_rm(), Some(ms)) {
                    Verdict::Continue
                } else {
                    Verdict::Cancel
                }
            })
            .await?;

        let Some(uci) = self.manager.last_bestmove().map(str::to_string) else {
            warn!("{} found no move", self.manager.engine().name);
            return None;
        };
        if !is_legal(&position, &uci) {
            warn!("{} answered the illegal move {uci}", self.manager.engine().name);
            return None;
        }
        let rm = mrm
            .search_rm(&uci)
            .map(|(rm, _)| rm.clone())
            .or_else(|| mrm.best_rm().cloned());

        if let Some(delay) = delay {
            debug!("holding {uci} back for {delay:?}");
            if !self.manager.pause_until(started + delay).await {
                return None;
            }
        }

        Some(PlayedMove {
            uci,
            from_book: false,
            rm,
            elapsed: started.elapsed(),
        })
    }

    fn check_wicker(&mut self, position: &Chess) {
        if !self.wicker_pending || !is_simplified_endgame(position) {
            return;
        }
        self.wicker_pending = false;
        let persona = self.manager.engine().persona;
        let options = persona.configure_for_strength_limit();
        info!(
            "{} reached a simplified endgame, applying {} option(s) for {:?}",
            self.manager.engine().name,
            options.len(),
            persona
        );
        for option in options {
            self.manager.set_option(&option.name, &option.value);
        }
    }

    fn book_move(&mut self, position: &Chess, ply: usize) -> Option<String> {
        let book = self.book.as_mut()?;
        if !book.is_active() {
            return None;
        }
        match book.get_move(&fen_of(position), ply) {
            Some(uci) if is_legal(position, &uci) => return Some(uci),
            Some(uci) => warn!("book proposes the illegal move {uci}"),
            None => {}
        }
        self.book_misses += 1;
        if self.book_misses > self.book_max_misses && book.is_active() {
            debug!("book missed {} times, leaving it", self.book_misses);
            book.deactivate();
        }
        None
    }
}

fn is_legal(position: &Chess, uci: &str) -> bool {
    parse_uci_move(uci)
        .ok()
        .and_then(|m| m.to_move(position).ok())
        .is_some()
}

/// What the think time of an engine move is derived from.
#[derive(Debug, Clone, Default)]
pub struct HumanizeInput {
    /// Share of the per-move budget to use, in percent.
    pub porc: u32,
    /// Remaining clock of the engine's side.
    pub clock_secs: f64,
    /// Increment added after every move.
    pub seconds_per_move: f64,
    /// Moves still expected in this time control.
    pub movestogo: u32,
    /// Plies already played.
    pub ply: usize,
    pub legal_replies: usize,
    /// Recent think times of the human opponent.
    pub human_times: Vec<f64>,
}

/// Think time in seconds that an engine move should appear to take.
pub fn humanize(input: &HumanizeInput) -> f64 {
    let movestogo = input.movestogo.max(1) as f64;
    let porc = input.porc.clamp(1, 100) as f64 / 100.0;
    let per_move = input.clock_secs.max(0.0) / movestogo + input.seconds_per_move.max(0.0);
    let mut secs = per_move * porc;

    // quick in the opening, slower as the game develops
    if input.ply < 20 {
        secs *= 0.5 + input.ply as f64 / 40.0;
    }

    secs *= match input.legal_replies {
        0 | 1 => 0.25,
        2..=4 => 0.5,
        5..=9 => 0.75,
        _ => 1.0,
    };

    let recent: Vec<f64> = input
        .human_times
        .iter()
        .rev()
        .take(5)
        .copied()
        .filter(|t| t.is_finite() && *t >= 0.0)
        .collect();
    if !recent.is_empty() {
        let average = recent.iter().sum::<f64>() / recent.len() as f64;
        let average = average.max(secs * 0.8).min(secs * 1.5);
        secs = (secs + average) / 2.0;
    }

    if secs.is_finite() {
        secs.clamp(HUMANIZE_MIN_SECS, HUMANIZE_MAX_SECS)
    } else {
        HUMANIZE_MIN_SECS
    }
}

/// `humanize` for the side to move of `game`.
pub fn humanize_for_game(game: &Game, porc: u32, clock: &PlayClock, human_times: &[f64]) -> f64 {
    let position = game.last_position();
    let (clock_ms, inc_ms) = if is_white(position.turn()) {
        (clock.wtime_ms, clock.winc_ms)
    } else {
        (clock.btime_ms, clock.binc_ms)
    };
    humanize(&HumanizeInput {
        porc,
        clock_secs: clock_ms as f64 / 1000.0,
        seconds_per_move: inc_ms as f64 / 1000.0,
        movestogo: clock.movestogo.unwrap_or(40),
        ply: game.len(),
        legal_replies: position.legal_moves().len(),
        human_times: human_times.to_vec(),
    })
}

impl Deref for EngineManagerPlay {
    type Target = EngineManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

impl DerefMut for EngineManagerPlay {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.manager
    }
}
