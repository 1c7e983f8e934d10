use std::ops::{Deref, DerefMut};

use log::debug;

use super::{
    manager::{EngineManager, ManagerState, Wake},
    multi_response::MultiEngineResponse,
};

/// Keeps one evaluation display current. Requests that arrive while the
/// engine is busy replace each other, only the latest one gets searched.
pub struct EngineManagerRefresh {
    manager: EngineManager,
    pending: Option<String>,
    fen: Option<String>,
}

impl EngineManagerRefresh {
    pub fn new(manager: EngineManager) -> EngineManagerRefresh {
        EngineManagerRefresh {
            manager,
            pending: None,
            fen: None,
        }
    }

    /// Position waiting for the current search to end.
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Position of the search in progress or last finished.
    pub fn fen(&self) -> Option<&str> {
        self.fen.as_deref()
    }

    pub async fn refresh(&mut self, fen: &str) -> bool {
        match self.manager.state() {
            ManagerState::Closed => false,
            ManagerState::Idle => {
                self.pending = None;
                self.start(fen).await
            }
            ManagerState::Searching => {
                if let Some(superseded) = self.pending.replace(fen.to_string()) {
                    debug!("refresh of {superseded} superseded");
                }
                self.manager.stop();
                true
            }
        }
    }

    async fn start(&mut self, fen: &str) -> bool {
        self.fen = Some(fen.to_string());
        let params = *self.manager.params();
        self.manager.go(fen, &params).await
    }

    /// Waits for the next complete depth of the displayed position. Returns
    /// the final readout when a search ends on its own, `None` once there is
    /// nothing left to wait for.
    pub async fn next_update(&mut self) -> Option<MultiEngineResponse> {
        loop {
            if self.manager.state() == ManagerState::Idle {
                let fen = self.pending.take()?;
                if !self.start(&fen).await {
                    return None;
                }
            }
            match self.manager.next_wake(None).await {
                Wake::DepthChanged if self.pending.is_none() => {
                    return Some(self.manager.working().snapshot());
                }
                Wake::BestMove(_) => match self.pending.take() {
                    Some(fen) => {
                        if !self.start(&fen).await {
                            return None;
                        }
                    }
                    None => {
                        let mrm = self.manager.working().snapshot();
                        return (!mrm.is_empty()).then_some(mrm);
                    }
                },
                Wake::Closed => return None,
                Wake::DepthChanged | Wake::Tick => {}
            }
        }
    }
}

impl Deref for EngineManagerRefresh {
    type Target = EngineManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

impl DerefMut for EngineManagerRefresh {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.manager
    }
}
