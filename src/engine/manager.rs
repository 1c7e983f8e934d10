use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use tokio::{
    sync::{
        Notify,
        mpsc::{UnboundedSender, error::TryRecvError},
    },
    time::{Instant, Interval, MissedTickBehavior},
};

use super::{
    Engine, Priority, RunEngineParams, UciOption,
    multi_response::MultiEngineResponse,
    process::{EngineConnection, Launcher},
    protocol_log::{Direction, ProtocolLog},
    uci::{UciMessage, parse_uci_line},
};
use crate::error::EngineError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

pub type BestMoveCallback = Box<dyn FnMut(Option<&str>) + Send>;
pub type DepthChangedCallback = Box<dyn FnMut(&MultiEngineResponse) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Searching,
    Closed,
}

/// Why a wait on the engine returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    BestMove(Option<String>),
    DepthChanged,
    Tick,
    Closed,
}

/// What a search loop does after a progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    /// stop the engine but keep what it found
    Stop,
    /// stop the engine and give up on the request
    Cancel,
}

struct Control {
    id: u64,
    key: String,
    close_requested: AtomicBool,
    closed: AtomicBool,
    logging: AtomicBool,
    wake: Notify,
    /// Command line of the running engine, so a close request reaches an idle one.
    engine: Mutex<Option<UnboundedSender<String>>>,
}

/// Shared view of a manager, used to close it or toggle its protocol log
/// while it is waiting on the engine.
#[derive(Clone)]
pub struct ManagerHandle {
    control: Arc<Control>,
}

impl ManagerHandle {
    pub(crate) fn new(key: &str) -> ManagerHandle {
        ManagerHandle {
            control: Arc::new(Control {
                id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
                key: key.to_string(),
                close_requested: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                logging: AtomicBool::new(false),
                wake: Notify::new(),
                engine: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.control.id
    }

    pub fn key(&self) -> &str {
        &self.control.key
    }

    pub fn is_closed(&self) -> bool {
        self.control.closed.load(Ordering::Acquire)
    }

    /// A running engine is told to quit at once. The manager itself finishes
    /// closing at its next wake up or call.
    pub fn request_close(&self) {
        self.control.close_requested.store(true, Ordering::Release);
        if let Ok(engine) = self.control.engine.lock() {
            if let Some(commands) = engine.as_ref() {
                let _ = commands.send("quit".to_string());
            }
        }
        self.control.wake.notify_one();
    }

    fn attach_engine(&self, commands: Option<UnboundedSender<String>>) {
        if let Ok(mut engine) = self.control.engine.lock() {
            *engine = commands;
        }
    }

    pub fn set_logging(&self, active: bool) {
        self.control.logging.store(active, Ordering::Release);
    }

    pub fn is_logging(&self) -> bool {
        self.control.logging.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("id", &self.id())
            .field("key", &self.key())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns one engine process and the notifications it produces.
pub struct EngineManager {
    engine: Engine,
    params: RunEngineParams,
    launcher: Arc<dyn Launcher>,
    connection: Option<EngineConnection>,
    state: ManagerState,
    handle: ManagerHandle,
    options: Vec<UciOption>,
    available_options: Vec<String>,
    id_name: Option<String>,
    current_multipv: u32,
    priority: Priority,
    working: MultiEngineResponse,
    current: Option<MultiEngineResponse>,
    last_bestmove: Option<String>,
    search_started: Option<Instant>,
    stop_sent: bool,
    stop_deadline: Option<Instant>,
    searches: u64,
    bestmove_cb: Option<BestMoveCallback>,
    depthchanged_cb: Option<DepthChangedCallback>,
    bestmove_enabled: bool,
    depthchanged_enabled: bool,
    log_dir: PathBuf,
    log: Option<ProtocolLog>,
}

impl EngineManager {
    pub fn new(
        engine: Engine,
        params: RunEngineParams,
        launcher: Arc<dyn Launcher>,
    ) -> EngineManager {
        let handle = ManagerHandle::new(&engine.key);
        EngineManager {
            options: engine.options.clone(),
            current_multipv: engine.clamp_multipv(params.multipv),
            working: MultiEngineResponse::new(&engine.name, "", true, 1),
            engine,
            params,
            launcher,
            connection: None,
            state: ManagerState::Idle,
            handle,
            available_options: Vec::new(),
            id_name: None,
            priority: Priority::Normal,
            current: None,
            last_bestmove: None,
            search_started: None,
            stop_sent: false,
            stop_deadline: None,
            searches: 0,
            bestmove_cb: None,
            depthchanged_cb: None,
            bestmove_enabled: false,
            depthchanged_enabled: false,
            log_dir: std::env::temp_dir(),
            log: None,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> EngineManager {
        self.log_dir = dir.into();
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn params(&self) -> &RunEngineParams {
        &self.params
    }

    pub fn set_params(&mut self, params: RunEngineParams) {
        self.params = params;
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ManagerState::Closed
    }

    pub fn is_running(&self) -> bool {
        self.connection.is_some()
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// `go` commands sent since the manager was created.
    pub fn searches_started(&self) -> u64 {
        self.searches
    }

    /// Name the engine reported during the handshake.
    pub fn id_name(&self) -> Option<&str> {
        self.id_name.as_deref()
    }

    pub fn last_bestmove(&self) -> Option<&str> {
        self.last_bestmove.as_deref()
    }

    /// Starts the engine if it is not running yet. On failure the manager closes itself.
    pub async fn check_engine(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.handle.control.close_requested.load(Ordering::Acquire) {
            self.close().await;
            return false;
        }
        if self.connection.is_some() {
            return true;
        }

        match self.launcher.launch(&self.engine).await {
            Ok(connection) => {
                self.handle.attach_engine(Some(connection.command_sender()));
                self.connection = Some(connection);
            }
            Err(e) => {
                error!("could not start engine {}: {e}", self.engine.name);
                self.close().await;
                return false;
            }
        }

        if let Err(e) = self.handshake().await {
            error!("engine {} failed the UCI handshake: {e}", self.engine.name);
            self.close().await;
            return false;
        }

        if self.priority != Priority::Normal {
            if let Some(connection) = self.connection.as_ref() {
                connection.set_priority(self.priority);
            }
        }
        info!(
            "engine {} ready ({})",
            self.engine.name,
            self.id_name.as_deref().unwrap_or("no id")
        );
        true
    }

    async fn handshake(&mut self) -> Result<(), EngineError> {
        self.send("uci")?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.read_until(UciMessage::UciOk))
            .await
            .map_err(|_| EngineError::Timeout("uciok"))??;

        for option in self.options.clone() {
            self.send(&setoption_command(&option.name, &option.value))?;
        }
        if self.engine.supports_multipv() {
            self.send(&setoption_command(
                "MultiPV",
                &self.current_multipv.to_string(),
            ))?;
        }

        self.send("isready")?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.read_until(UciMessage::ReadyOk))
            .await
            .map_err(|_| EngineError::Timeout("readyok"))??;
        Ok(())
    }

    async fn read_until(&mut self, expected: UciMessage) -> Result<(), EngineError> {
        loop {
            let line = {
                let connection = self.connection.as_mut().ok_or(EngineError::NotRunning)?;
                connection.lines.recv().await.ok_or(EngineError::NotRunning)?
            };
            self.log_line(Direction::FromEngine, &line);
            match parse_uci_line(&line) {
                Some(message) if message == expected => return Ok(()),
                Some(UciMessage::IdName(name)) => self.id_name = Some(name),
                Some(UciMessage::Option(name)) => self.available_options.push(name),
                _ => {}
            }
        }
    }

    /// Whether the engine announced the option (always false before the handshake).
    pub fn has_option(&self, name: &str) -> bool {
        self.available_options
            .iter()
            .any(|o| o.eq_ignore_ascii_case(name))
    }

    fn send(&mut self, command: &str) -> Result<(), EngineError> {
        self.log_line(Direction::ToEngine, command);
        self.connection
            .as_ref()
            .ok_or(EngineError::NotRunning)?
            .send(command)
    }

    /// Cached when the engine is not running yet, sent on the next start.
    pub fn set_option(&mut self, name: &str, value: &str) {
        match self.options.iter_mut().find(|o| o.name == name) {
            Some(option) => option.value = value.to_string(),
            None => self.options.push(UciOption::new(name, value)),
        }
        if self.connection.is_some() && !self.is_closed() {
            if let Err(e) = self.send(&setoption_command(name, value)) {
                warn!("could not send option {name} to {}: {e}", self.engine.name);
            }
        }
    }

    pub fn set_multipv(&mut self, multipv: u32) {
        let multipv = self.engine.clamp_multipv(multipv);
        if multipv != self.current_multipv {
            self.current_multipv = multipv;
            if self.engine.supports_multipv() {
                self.set_option("MultiPV", &multipv.to_string());
            }
        }
    }

    pub fn multipv(&self) -> u32 {
        self.current_multipv
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
        if let Some(connection) = self.connection.as_ref() {
            connection.set_priority(priority);
        }
    }

    pub fn new_game(&mut self) {
        if self.connection.is_some() && self.state == ManagerState::Idle {
            if let Err(e) = self.send("ucinewgame") {
                warn!("could not start a new game on {}: {e}", self.engine.name);
            }
        }
    }

    /// Replaces the subscriber, `None` unsubscribes.
    pub fn connect_bestmove(&mut self, callback: Option<BestMoveCallback>) {
        self.bestmove_enabled = callback.is_some();
        self.bestmove_cb = callback;
    }

    pub fn connect_depthchanged(&mut self, callback: Option<DepthChangedCallback>) {
        self.depthchanged_enabled = callback.is_some();
        self.depthchanged_cb = callback;
    }

    /// Mutes or unmutes the subscribers without dropping them.
    pub fn set_dispatch_enabled(&mut self, enabled: bool) {
        self.bestmove_enabled = enabled && self.bestmove_cb.is_some();
        self.depthchanged_enabled = enabled && self.depthchanged_cb.is_some();
    }

    /// Asks the engine to end the search. Completion arrives as a bestmove.
    pub fn stop(&mut self) {
        if self.state == ManagerState::Searching && !self.stop_sent {
            self.stop_sent = true;
            if let Err(e) = self.send("stop") {
                warn!("could not stop {}: {e}", self.engine.name);
            }
        }
    }

    /// Idempotent, later calls and calls on other paths are no-ops.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        let was_searching = self.state == ManagerState::Searching;
        self.state = ManagerState::Closed;
        self.handle
            .control
            .close_requested
            .store(true, Ordering::Release);

        if self.connection.is_some() {
            if was_searching {
                let _ = self.send("stop");
            }
            self.log_line(Direction::ToEngine, "quit");
        }
        self.handle.attach_engine(None);
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }

        self.bestmove_cb = None;
        self.depthchanged_cb = None;
        self.bestmove_enabled = false;
        self.depthchanged_enabled = false;
        self.log = None;
        self.handle.control.closed.store(true, Ordering::Release);
        self.handle.control.wake.notify_waiters();
        info!("engine {} closed", self.engine.name);
    }

    /// Latest complete readout, always a copy.
    pub fn get_current_mrm(&self) -> Option<MultiEngineResponse> {
        self.current.clone()
    }

    pub fn log_open(&mut self) {
        self.handle.set_logging(true);
        self.sync_log();
    }

    pub fn log_close(&mut self) {
        self.handle.set_logging(false);
        self.sync_log();
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log.as_ref().map(|log| log.path().to_path_buf())
    }

    /// Opens or closes the transcript to match the handle's logging flag.
    fn sync_log(&mut self) {
        let wanted = self.handle.is_logging();
        if wanted && self.log.is_none() {
            match ProtocolLog::open(&self.log_dir, &self.engine.key) {
                Ok(log) => {
                    info!("logging {} to {}", self.engine.name, log.path().display());
                    self.log = Some(log);
                }
                Err(e) => {
                    warn!("could not open protocol log for {}: {e}", self.engine.name);
                    self.handle.set_logging(false);
                }
            }
        } else if !wanted {
            self.log = None;
        }
    }

    fn log_line(&mut self, direction: Direction, line: &str) {
        trace!("[{}] {:?} {line}", self.engine.key, direction);
        self.sync_log();
        if let Some(log) = self.log.as_mut() {
            log.write(direction, line);
        }
    }

    /// Sends position and go for `fen`, starting the engine when needed.
    pub async fn go(&mut self, fen: &str, params: &RunEngineParams) -> bool {
        let emulate = self.engine.emulate_movetime && params.fixed_ms > 0;
        let deadline = emulate.then(|| Instant::now() + Duration::from_millis(params.fixed_ms));
        let command = params.go_command(self.engine.emulate_movetime);
        self.go_with(fen, params.multipv, &command, deadline).await
    }

    pub(crate) async fn go_with(
        &mut self,
        fen: &str,
        multipv: u32,
        go_command: &str,
        deadline: Option<Instant>,
    ) -> bool {
        if !self.check_engine().await || !self.ensure_idle().await {
            return false;
        }
        self.set_multipv(multipv);

        let is_white = fen.split_whitespace().nth(1) != Some("b");
        self.working =
            MultiEngineResponse::new(&self.engine.name, fen, is_white, self.current_multipv);
        self.last_bestmove = None;

        let sent = self
            .send(&format!("position fen {fen}"))
            .and_then(|_| self.send(go_command));
        if let Err(e) = sent {
            error!("engine {} rejected the search: {e}", self.engine.name);
            self.close().await;
            return false;
        }

        self.state = ManagerState::Searching;
        self.stop_sent = false;
        self.stop_deadline = deadline;
        self.search_started = Some(Instant::now());
        self.searches += 1;
        debug!("{} searching {fen} with {go_command}", self.engine.name);
        true
    }

    /// Waits for the acknowledgement of an abandoned search, with subscribers muted.
    pub(crate) async fn ensure_idle(&mut self) -> bool {
        match self.state {
            ManagerState::Closed => return false,
            ManagerState::Idle => return true,
            ManagerState::Searching => {}
        }
        self.stop();
        let (bestmove_enabled, depthchanged_enabled) =
            (self.bestmove_enabled, self.depthchanged_enabled);
        self.bestmove_enabled = false;
        self.depthchanged_enabled = false;

        let drained = tokio::time::timeout(STOP_ACK_TIMEOUT, self.drain()).await;

        self.bestmove_enabled = bestmove_enabled && self.bestmove_cb.is_some();
        self.depthchanged_enabled = depthchanged_enabled && self.depthchanged_cb.is_some();
        match drained {
            Ok(idle) => idle,
            Err(_) => {
                warn!("engine {} never acknowledged stop", self.engine.name);
                self.close().await;
                false
            }
        }
    }

    async fn drain(&mut self) -> bool {
        loop {
            match self.next_wake(None).await {
                Wake::BestMove(_) => return true,
                Wake::Closed => return false,
                Wake::DepthChanged | Wake::Tick => {}
            }
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.search_started
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// The one suspension point: returns on bestmove, a completed depth, a
    /// tick of `interval`, or when the manager got closed.
    pub async fn next_wake(&mut self, mut interval: Option<&mut Interval>) -> Wake {
        loop {
            if self.is_closed() {
                return Wake::Closed;
            }
            if self.handle.control.close_requested.load(Ordering::Acquire) {
                self.close().await;
                return Wake::Closed;
            }
            if self.stop_deadline.is_some_and(|d| Instant::now() >= d) {
                self.stop_deadline = None;
                self.stop();
            }

            let control = self.handle.control.clone();
            let deadline = self.stop_deadline;
            let Some(connection) = self.connection.as_mut() else {
                return Wake::Closed;
            };

            let event = tokio::select! {
                line = connection.lines.recv() => Event::Line(line),
                _ = tick(interval.as_deref_mut()) => Event::Tick,
                _ = until(deadline) => Event::Deadline,
                _ = control.wake.notified() => Event::Woken,
            };

            match event {
                Event::Line(Some(line)) => {
                    if let Some(wake) = self.handle_line(&line) {
                        return wake;
                    }
                }
                Event::Line(None) => {
                    warn!("engine {} closed its output", self.engine.name);
                    self.close().await;
                    return Wake::Closed;
                }
                Event::Tick => return Wake::Tick,
                Event::Deadline | Event::Woken => {}
            }
        }
    }

    /// Sleeps until `deadline` without reading the engine. False when the
    /// manager got closed meanwhile.
    pub(crate) async fn pause_until(&mut self, deadline: Instant) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            if self.handle.control.close_requested.load(Ordering::Acquire) {
                self.close().await;
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            let control = self.handle.control.clone();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = control.wake.notified() => {}
            }
        }
    }

    /// Handles whatever the engine already printed without waiting.
    /// Returns whether a search is still running.
    pub async fn poll(&mut self) -> bool {
        loop {
            if self.handle.control.close_requested.load(Ordering::Acquire) {
                self.close().await;
                return false;
            }
            let line = match self.connection.as_mut() {
                Some(connection) => connection.lines.try_recv(),
                None => return false,
            };
            match line {
                Ok(line) => {
                    self.handle_line(&line);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("engine {} closed its output", self.engine.name);
                    self.close().await;
                    return false;
                }
            }
        }
        if self.stop_deadline.is_some_and(|d| Instant::now() >= d) {
            self.stop_deadline = None;
            self.stop();
        }
        self.state == ManagerState::Searching
    }

    fn handle_line(&mut self, line: &str) -> Option<Wake> {
        self.log_line(Direction::FromEngine, line);
        match parse_uci_line(line)? {
            UciMessage::Info(info) if self.state == ManagerState::Searching => {
                if !self.working.dispatch_info(&info) {
                    return None;
                }
                let snapshot = self.working.snapshot();
                if self.depthchanged_enabled {
                    if let Some(callback) = self.depthchanged_cb.as_mut() {
                        callback(&snapshot);
                    }
                }
                self.current = Some(snapshot);
                Some(Wake::DepthChanged)
            }
            UciMessage::BestMove { best_move, .. } => {
                if self.state != ManagerState::Searching {
                    debug!("stray bestmove from {} ignored", self.engine.name);
                    return None;
                }
                self.working.finish();
                if !self.working.is_empty() {
                    self.current = Some(self.working.snapshot());
                }
                self.state = ManagerState::Idle;
                self.stop_sent = false;
                self.stop_deadline = None;
                self.last_bestmove = best_move.clone();
                if self.bestmove_enabled {
                    if let Some(callback) = self.bestmove_cb.as_mut() {
                        callback(best_move.as_deref());
                    }
                }
                Some(Wake::BestMove(best_move))
            }
            _ => None,
        }
    }

    /// Readout of the search in progress or just finished.
    pub(crate) fn working(&self) -> &MultiEngineResponse {
        &self.working
    }

    /// Runs the wait loop of a started search, consulting `verdict` on every
    /// completed depth and tick. `None` when cancelled or closed.
    pub(crate) async fn wait_search<F>(
        &mut self,
        refresh: Option<Duration>,
        mut verdict: F,
    ) -> Option<MultiEngineResponse>
    where
        F: FnMut(&MultiEngineResponse, u64) -> Verdict,
    {
        let mut interval = refresh.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        loop {
            match self.next_wake(interval.as_mut()).await {
                Wake::BestMove(_) => return Some(self.working.snapshot()),
                Wake::Closed => return None,
                Wake::DepthChanged | Wake::Tick => {
                    match verdict(&self.working, self.elapsed_ms()) {
                        Verdict::Continue => {}
                        Verdict::Stop => self.stop(),
                        Verdict::Cancel => {
                            debug!("search on {} cancelled", self.engine.name);
                            self.stop();
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Search `fen` to completion. The dispatcher sees the best line after
    /// every completed depth and refresh tick, returning false cancels.
    pub async fn run_search<D>(
        &mut self,
        fen: &str,
        params: &RunEngineParams,
        refresh: Option<Duration>,
        mut dispatcher: D,
    ) -> Option<MultiEngineResponse>
    where
        D: FnMut(Option<&super::response::EngineResponse>, Option<u64>) -> bool,
    {
        if !self.go(fen, params).await {
            return None;
        }
        self.wait_search(refresh, |mrm, ms| {
            if dispatcher(mrm.best_rm(), Some(ms)) {
                Verdict::Continue
            } else {
                Verdict::Cancel
            }
        })
        .await
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        // the process itself is killed on drop of its connection
        self.handle.attach_engine(None);
        self.handle.control.closed.store(true, Ordering::Release);
    }
}

enum Event {
    Line(Option<String>),
    Tick,
    Deadline,
    Woken,
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn setoption_command(name: &str, value: &str) -> String {
    if value.is_empty() {
        format!("setoption name {name}")
    } else {
        format!("setoption name {name} value {value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_report_close_requests() {
        let handle = ManagerHandle::new("sf");
        let other = ManagerHandle::new("sf");
        assert_ne!(handle.id(), other.id());
        assert!(!handle.is_closed());

        handle.request_close();
        assert!(handle.control.close_requested.load(Ordering::Acquire));
        // only the manager itself flips the closed flag
        assert!(!handle.is_closed());

        handle.set_logging(true);
        assert!(handle.clone().is_logging());
    }

    #[test]
    fn formats_setoption_commands() {
        assert_eq!(
            setoption_command("MultiPV", "3"),
            "setoption name MultiPV value 3"
        );
        assert_eq!(setoption_command("Clear Hash", ""), "setoption name Clear Hash");
    }
}
