pub mod config;
pub mod engine;
pub mod error;
pub mod game;
pub mod util;

pub use engine::{
    Engine, Persona, Priority, RunEngineParams, UciOption,
    analysis::{AnalyzedMove, EngineManagerAnalysis},
    book::{BookMode, MemoryBook, OpeningBook},
    cache::AnalysisCache,
    manager::{EngineManager, ManagerHandle, ManagerState, Wake},
    multi_response::MultiEngineResponse,
    play::{EngineManagerPlay, Humanize, HumanizeInput, PlayClock, PlayedMove, humanize},
    process::{EngineConnection, Launcher, ProcessLauncher},
    refresh::EngineManagerRefresh,
    registry::ListEngineManagers,
    response::EngineResponse,
};
pub use error::EngineError;
pub use game::Game;
