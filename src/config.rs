use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, RunEngineParams, play::{Humanize, PlayClock}};

pub const CONFIG_ENV: &str = "ENGINE_MANAGER_CONFIG";
const CONFIG_FILE: &str = "engines.json";
const CACHE_FILE: &str = "analysis.sqlite";

/// Engines and search defaults of the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub engines: Vec<Engine>,
    #[serde(default)]
    pub default_engine: Option<String>,
    #[serde(default = "default_analysis")]
    pub analysis: RunEngineParams,
    #[serde(default = "default_tutor")]
    pub tutor: RunEngineParams,
    #[serde(default = "default_play")]
    pub play: RunEngineParams,
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,
    /// Seconds of pretended thinking per engine move in play mode.
    #[serde(default)]
    pub humanize_secs: f64,
    /// Percent of the clock share per move a humanized clock game waits,
    /// takes precedence over `humanize_secs`.
    #[serde(default)]
    pub humanize_porc: u32,
    /// Clock of the `play` command, fixed `play` params when absent.
    #[serde(default)]
    pub play_clock: Option<PlayClock>,
    /// Directory of the per-engine protocol transcripts.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub protocol_logs: bool,
    /// Application log, stdout only when absent.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Where the analysis cache lives, in memory when absent.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

fn default_analysis() -> RunEngineParams {
    RunEngineParams::depth(12).with_multipv(3)
}

fn default_tutor() -> RunEngineParams {
    RunEngineParams::movetime(3_000).with_multipv(3)
}

fn default_play() -> RunEngineParams {
    RunEngineParams::movetime(1_000)
}

fn default_refresh_ms() -> u64 {
    200
}

impl Settings {
    /// Reads the file named by `ENGINE_MANAGER_CONFIG`, or `./engines.json`.
    pub fn load() -> Result<Settings> {
        let path = match env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => env::current_dir()?.join(CONFIG_FILE),
        };
        Settings::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read settings from {}", path.display()))?;
        Settings::from_json(&text)
            .with_context(|| format!("invalid settings in {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Settings> {
        let settings: Settings = serde_json::from_str(text)?;
        if settings.engines.is_empty() {
            bail!("no engines configured");
        }
        if let Some(key) = settings.default_engine.as_deref() {
            if !settings.engines.iter().any(|e| e.key == key) {
                bail!("default engine {key} is not configured");
            }
        }
        Ok(settings)
    }

    /// The engine called `key`, falling back to the default and then the first one.
    pub fn engine(&self, key: Option<&str>) -> Option<&Engine> {
        match key.or(self.default_engine.as_deref()) {
            Some(key) => self.engines.iter().find(|e| e.key == key),
            None => self.engines.first(),
        }
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.max(10))
    }

    pub fn humanize(&self) -> Humanize {
        if self.humanize_porc > 0 {
            return Humanize::Clock {
                porc: self.humanize_porc.min(100),
            };
        }
        match Duration::try_from_secs_f64(self.humanize_secs) {
            Ok(secs) if !secs.is_zero() => Humanize::Fixed(secs),
            _ => Humanize::Off,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(env::temp_dir)
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(CACHE_FILE))
    }
}
