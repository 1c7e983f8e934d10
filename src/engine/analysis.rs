use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use log::{debug, info, warn};
use shakmaty::{Chess, Position};

use super::{
    RunEngineParams,
    cache::AnalysisCache,
    manager::{EngineManager, ManagerState, Verdict},
    multi_response::MultiEngineResponse,
    response::EngineResponse,
};
use crate::{
    game::Game,
    util::{fen_of, fenm2, is_white, parse_uci_move},
};

const DEFAULT_REFRESH: Duration = Duration::from_millis(200);
/// Depth cap of a mate search when the manager's parameters have no limit.
const MATE_EXTRA_DEPTH: u32 = 8;

/// Analysis of one move: the position's candidates and where the move ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedMove {
    pub mrm: MultiEngineResponse,
    /// `None` when the move could not be placed because its probe was cancelled.
    pub rank: Option<usize>,
}

impl AnalyzedMove {
    pub fn rm(&self) -> Option<&EngineResponse> {
        self.rank.and_then(|pos| self.mrm.rm(pos))
    }
}

struct TutorSearch {
    fen: String,
}

/// Runs bounded analysis requests and remembers their results per position.
pub struct EngineManagerAnalysis {
    manager: EngineManager,
    cache: Option<AnalysisCache>,
    refresh: Duration,
    tutor_params: RunEngineParams,
    tutor: Option<TutorSearch>,
}

impl EngineManagerAnalysis {
    pub fn new(manager: EngineManager) -> EngineManagerAnalysis {
        let tutor_params = RunEngineParams::movetime(3_000).with_multipv(manager.params().multipv);
        EngineManagerAnalysis {
            manager,
            cache: None,
            refresh: DEFAULT_REFRESH,
            tutor_params,
            tutor: None,
        }
    }

    pub fn with_cache(mut self, cache: AnalysisCache) -> EngineManagerAnalysis {
        self.cache = Some(cache);
        self
    }

    pub fn with_refresh(mut self, refresh: Duration) -> EngineManagerAnalysis {
        self.refresh = refresh;
        self
    }

    pub fn with_tutor_params(mut self, params: RunEngineParams) -> EngineManagerAnalysis {
        self.tutor_params = params;
        self
    }

    /// Closes the engine and releases the cache store.
    pub async fn close(&mut self) {
        self.tutor = None;
        self.manager.close().await;
        if let Some(cache) = self.cache.take() {
            cache.close().await;
        }
    }

    /// The position store, in memory unless a shared one was given.
    async fn cache(&mut self) -> Option<&AnalysisCache> {
        if self.cache.is_none() && !self.manager.is_closed() {
            match AnalysisCache::open_in_memory().await {
                Ok(cache) => self.cache = Some(cache),
                Err(e) => warn!("could not open an analysis cache: {e}"),
            }
        }
        self.cache.as_ref()
    }

    async fn cached(&mut self, key: &str) -> Option<MultiEngineResponse> {
        let fingerprint = self.manager.params().fingerprint();
        let hit = self.cache().await?.get(key, &fingerprint).await;
        if hit.is_some() {
            debug!("cache hit for {key}");
        }
        hit
    }

    /// Only ordered readouts are stored.
    async fn store(&mut self, key: &str, mrm: &MultiEngineResponse) {
        let fingerprint = self.manager.params().fingerprint();
        if let Some(cache) = self.cache().await {
            if let Err(e) = cache.put(key, &fingerprint, mrm).await {
                warn!("could not cache analysis of {key}: {e}");
            }
        }
    }

    async fn search<D>(
        &mut self,
        fen: &str,
        params: &RunEngineParams,
        dispatcher: D,
    ) -> Option<MultiEngineResponse>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        let result = self
            .manager
            .run_search(fen, params, Some(self.refresh), dispatcher)
            .await;
        if result.is_none() && self.manager.is_closed() {
            self.close().await;
        }
        result
    }

    /// MultiPV analysis of a position, from the cache when possible.
    pub async fn analyze_fen<D>(&mut self, fen: &str, dispatcher: D) -> Option<MultiEngineResponse>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        let key = fenm2(fen);
        if let Some(mrm) = self.cached(&key).await {
            return Some(mrm);
        }
        let params = *self.manager.params();
        let mut mrm = self.search(fen, &params, dispatcher).await?;
        mrm.ordena();
        self.store(&key, &mrm).await;
        Some(mrm)
    }

    /// Evaluates ply `move_index` of `game` against the engine's own candidates.
    ///
    /// A move outside the MultiPV list is searched on its own from the
    /// position after it, one ply shallower, and spliced into the list.
    pub async fn analyze_move<D>(
        &mut self,
        game: &Game,
        move_index: usize,
        mut dispatcher: D,
    ) -> Option<AnalyzedMove>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        let (Some(position), Some(played)) = (game.position_at(move_index), game.uci_at(move_index))
        else {
            warn!("no move {move_index} in a game of {} plies", game.len());
            return None;
        };
        let fen = fen_of(&position);
        let key = fenm2(&fen);
        let params = *self.manager.params();

        let mut mrm = match self.cached(&key).await {
            Some(mrm) => {
                if let Some((_, rank)) = mrm.search_rm(&played) {
                    return Some(AnalyzedMove {
                        rank: Some(rank),
                        mrm,
                    });
                }
                mrm
            }
            None => self.search(&fen, &params, &mut dispatcher).await?,
        };

        if mrm.search_rm(&played).is_none() {
            let probe = params
                .with_depth(probe_depth(params.fixed_depth))
                .with_multipv(1);
            match self.probe_move(&position, &played, &probe, &mut dispatcher).await {
                Some(rm) => mrm.add_rm(rm),
                None if self.manager.is_closed() => return None,
                None => {
                    debug!("probe of {played} cancelled");
                    mrm.ordena();
                    self.store(&key, &mrm).await;
                    return Some(AnalyzedMove { mrm, rank: None });
                }
            }
        }

        mrm.ordena();
        self.store(&key, &mrm).await;
        let rank = mrm.search_rm(&played).map(|(_, rank)| rank);
        Some(AnalyzedMove { mrm, rank })
    }

    /// Evaluation of `played` from `before`, expressed for the side playing it.
    async fn probe_move<D>(
        &mut self,
        before: &Chess,
        played: &str,
        params: &RunEngineParams,
        dispatcher: D,
    ) -> Option<EngineResponse>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        let name = self.manager.engine().name.clone();
        let mover_is_white = is_white(before.turn());
        let m = parse_uci_move(played).ok()?.to_move(before).ok()?;
        let mut after = before.clone();
        after.play_unchecked(m);

        if after.is_checkmate() {
            return Some(EngineResponse::terminal(&name, mover_is_white, played, 1));
        }
        if after.is_game_over() {
            return Some(EngineResponse::terminal(&name, mover_is_white, played, 0));
        }

        let reply = self.search(&fen_of(&after), params, dispatcher).await?;
        let mut rm = reply.best_rm()?.clone();
        rm.change_side(played);
        Some(rm)
    }

    /// Searches the final position of `game` until a mate in at most `n`
    /// moves stops getting shorter. Returns every candidate with that mate.
    pub async fn seek_mate(&mut self, game: &Game, n: u32) -> Vec<EngineResponse> {
        let fen = game.last_fen();
        let mut params = *self.manager.params();
        if params.is_infinite() {
            params.fixed_depth = mate_search_depth(n);
        }
        if !self.manager.go(&fen, &params).await {
            return Vec::new();
        }

        let limit = i32::try_from(n).unwrap_or(i32::MAX);
        let mut found: Option<i32> = None;
        let mut judged_depth = 0;
        let result = self
            .manager
            .wait_search(Some(self.refresh), |mrm, _| {
                // ticks carry no new readout, only a finished depth can improve
                if mrm.max_depth() == judged_depth {
                    return Verdict::Continue;
                }
                judged_depth = mrm.max_depth();
                let shortest = mrm
                    .iter()
                    .filter(|rm| rm.mate > 0 && rm.mate <= limit)
                    .map(|rm| rm.mate)
                    .min();
                match (shortest, found) {
                    (Some(mate), Some(previous)) if mate >= previous => Verdict::Stop,
                    (Some(mate), _) => {
                        found = Some(mate);
                        Verdict::Continue
                    }
                    (None, _) => Verdict::Continue,
                }
            })
            .await;

        match result {
            Some(mrm) => {
                let mates: Vec<EngineResponse> = mrm
                    .mate_rms()
                    .into_iter()
                    .filter(|rm| rm.mate <= limit)
                    .collect();
                info!("mate search found {} move(s) mating in {:?}", mates.len(), found);
                mates
            }
            None => {
                if self.manager.is_closed() {
                    self.close().await;
                }
                Vec::new()
            }
        }
    }

    /// Starts thinking about the final position of `game` while the user
    /// deliberates. Returns immediately.
    pub async fn analyze_tutor(&mut self, game: &Game) -> bool {
        let fen = game.last_fen();
        let params = self.tutor_params;
        if !self.manager.go(&fen, &params).await {
            return false;
        }
        self.tutor = Some(TutorSearch { fen });
        true
    }

    /// The user played `played` in the position given to [`Self::analyze_tutor`].
    /// An early move ends the tutor search; a move outside its candidates is
    /// probed one ply shallower than what the tutor reached.
    pub async fn analyze_tutor_move<D>(
        &mut self,
        game: &Game,
        played: &str,
        mut dispatcher: D,
    ) -> Option<AnalyzedMove>
    where
        D: FnMut(Option<&EngineResponse>, Option<u64>) -> bool,
    {
        let tutor = self.tutor.take()?;
        let position = game.last_position();
        if tutor.fen != fen_of(&position) {
            warn!("tutor was analysing another position");
            self.manager.stop();
            return None;
        }

        let mut mrm = if self.manager.poll().await {
            self.manager.stop();
            let refresh = Some(self.refresh);
            let finished = self
                .manager
                .wait_search(refresh, |mrm, ms| {
                    if dispatcher(mrm.best_rm(), Some(ms)) {
                        Verdict::Continue
                    } else {
                        Verdict::Cancel
                    }
                })
                .await;
            match finished {
                Some(mrm) => mrm,
                None => {
                    if self.manager.is_closed() {
                        self.close().await;
                    }
                    return None;
                }
            }
        } else if self.manager.state() == ManagerState::Idle {
            self.manager.working().snapshot()
        } else {
            return None;
        };
        mrm.ordena();

        if mrm.search_rm(played).is_none() {
            let probe = RunEngineParams::depth(probe_depth(mrm.max_depth().max(1)));
            match self.probe_move(&position, played, &probe, &mut dispatcher).await {
                Some(rm) => {
                    mrm.add_rm(rm);
                    mrm.ordena();
                }
                None if self.manager.is_closed() => return None,
                None => return Some(AnalyzedMove { mrm, rank: None }),
            }
        }

        let rank = mrm.search_rm(played).map(|(_, rank)| rank);
        Some(AnalyzedMove { mrm, rank })
    }
}

/// One ply shallower than the main search, never below one. Time or node
/// limited searches (depth 0) keep their limits.
fn probe_depth(depth: u32) -> u32 {
    if depth == 0 { 0 } else { depth.saturating_sub(1).max(1) }
}

/// Depth bound of a mate-in-`n` search that has no limit of its own.
fn mate_search_depth(n: u32) -> u32 {
    n.saturating_mul(2).saturating_add(MATE_EXTRA_DEPTH)
}

impl Deref for EngineManagerAnalysis {
    type Target = EngineManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

impl DerefMut for EngineManagerAnalysis {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.manager
    }
}
