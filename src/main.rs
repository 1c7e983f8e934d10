use std::{
    env,
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use engine_manager::{
    AnalysisCache, Engine, EngineManager, EngineManagerAnalysis, EngineManagerPlay, Game,
    Launcher, ListEngineManagers, Priority, ProcessLauncher, config::Settings,
};
use log::{LevelFilter, debug, info, warn};

const USAGE: &str = "usage: rusty-engine-manager analyze \"<uci moves>\" [fen]
       rusty-engine-manager mate <N> [fen]
       rusty-engine-manager play [fen]";

type Registry = Arc<Mutex<ListEngineManagers>>;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    setup_logger(settings.log_file.as_deref())?;

    let args: Vec<String> = env::args().skip(1).collect();
    let registry: Registry = Arc::new(Mutex::new(ListEngineManagers::new()));
    if let Ok(mut list) = registry.lock() {
        list.active_logs(settings.protocol_logs);
    }

    // ctrl-c wakes every manager out of its wait
    let on_interrupt = registry.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, closing engines");
            if let Ok(mut list) = on_interrupt.lock() {
                list.close_all();
            }
        }
    });

    let engine = settings
        .engine(None)
        .context("no engine configured")?
        .clone();
    let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher);

    let result = match args.first().map(String::as_str) {
        Some("analyze") => {
            let moves = args.get(1).map(String::as_str).unwrap_or_default();
            let fen = fen_arg(&args, 2);
            analyze(&settings, engine, launcher, &registry, moves, fen.as_deref()).await
        }
        Some("mate") => {
            let n = args
                .get(1)
                .map(|n| u32::from_str(n))
                .transpose()?
                .context(USAGE)?;
            let fen = fen_arg(&args, 2);
            seek_mate(&settings, engine, launcher, &registry, n, fen.as_deref()).await
        }
        Some("play") => {
            let fen = fen_arg(&args, 1);
            play(&settings, engine, launcher, &registry, fen.as_deref()).await
        }
        _ => bail!("{USAGE}"),
    };

    if let Ok(mut list) = registry.lock() {
        list.close_all();
    }
    result
}

fn setup_logger(log_file: Option<&Path>) -> Result<()> {
    let level = env::var("ENGINE_MANAGER_LOG")
        .ok()
        .and_then(|level| LevelFilter::from_str(&level).ok())
        .unwrap_or(LevelFilter::Info);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sqlx", LevelFilter::Warn)
        .chain(std::io::stdout());
    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}

/// The rest of the command line from `from` on, joined so a FEN needs no quoting.
fn fen_arg(args: &[String], from: usize) -> Option<String> {
    let rest = args.get(from..)?;
    (!rest.is_empty()).then(|| rest.join(" "))
}

fn new_manager(
    settings: &Settings,
    engine: Engine,
    params: engine_manager::RunEngineParams,
    launcher: Arc<dyn Launcher>,
    registry: &Registry,
) -> EngineManager {
    let manager = EngineManager::new(engine, params, launcher).with_log_dir(settings.log_dir());
    if let Ok(mut list) = registry.lock() {
        list.register(manager.handle());
    }
    manager
}

async fn analyze(
    settings: &Settings,
    engine: Engine,
    launcher: Arc<dyn Launcher>,
    registry: &Registry,
    moves: &str,
    fen: Option<&str>,
) -> Result<()> {
    let game = Game::from_uci(fen, moves)?;
    if game.is_empty() {
        bail!("no moves to analyze\n{USAGE}");
    }

    let cache = match settings.cache_path() {
        Some(path) => AnalysisCache::open(&path).await?,
        None => AnalysisCache::open_in_memory().await?,
    };
    let manager = new_manager(settings, engine, settings.analysis, launcher, registry);
    let mut analysis = EngineManagerAnalysis::new(manager)
        .with_cache(cache)
        .with_refresh(settings.refresh())
        .with_tutor_params(settings.tutor);
    if !analysis.check_engine().await {
        bail!("engine {} could not be started", analysis.engine().name);
    }
    analysis.set_priority(Priority::Low);

    for ply in 0..game.len() {
        let played = game.uci_at(ply).unwrap_or_default();
        let analyzed = analysis
            .analyze_move(&game, ply, |rm, ms| {
                if let Some(rm) = rm {
                    debug!("{played}: depth {} {} after {:?} ms", rm.depth, rm.abbrev_text(), ms);
                }
                true
            })
            .await;
        let Some(analyzed) = analyzed else {
            warn!("analysis stopped at ply {ply}");
            break;
        };

        let best = analyzed.mrm.best_rm();
        let verdict = match (analyzed.rank, analyzed.rm()) {
            (Some(0), Some(rm)) => format!("{} best move", rm.abbrev_text()),
            (Some(rank), Some(rm)) => format!(
                "{} rank {}, best {} {}",
                rm.abbrev_text(),
                rank + 1,
                best.map(|b| b.uci_move()).unwrap_or_default(),
                best.map(|b| b.abbrev_text()).unwrap_or_default()
            ),
            _ => "not evaluated".to_string(),
        };
        println!("{:>3}. {played:<6} {verdict}", ply / 2 + 1);
    }

    analysis.close().await;
    Ok(())
}

async fn seek_mate(
    settings: &Settings,
    engine: Engine,
    launcher: Arc<dyn Launcher>,
    registry: &Registry,
    n: u32,
    fen: Option<&str>,
) -> Result<()> {
    let game = Game::from_uci(fen, "")?;
    let manager = new_manager(settings, engine, settings.analysis, launcher, registry);
    let mut analysis = EngineManagerAnalysis::new(manager).with_refresh(settings.refresh());

    let mates = analysis.seek_mate(&game, n).await;
    if mates.is_empty() {
        println!("no mate in {n} found");
    }
    for rm in &mates {
        println!("{} mates in {}: {}", rm.uci_move(), rm.mate, rm.pv);
    }
    analysis.close().await;
    Ok(())
}

async fn play(
    settings: &Settings,
    engine: Engine,
    launcher: Arc<dyn Launcher>,
    registry: &Registry,
    fen: Option<&str>,
) -> Result<()> {
    let game = Game::from_uci(fen, "")?;
    let manager = new_manager(settings, engine, settings.play, launcher, registry);
    let mut player = EngineManagerPlay::new(manager).with_refresh(settings.refresh());
    player.set_humanize(settings.humanize());

    let played = match settings.play_clock.as_ref() {
        Some(clock) => player.play_with_clock(&game, clock, |_, _| true).await,
        None => player.play(&game, |_, _| true).await,
    };
    player.close().await;

    match played {
        Some(played) => {
            info!("move found after {:?}", played.elapsed);
            match played.rm {
                Some(rm) => println!("{} ({})", played.uci, rm.abbrev_text()),
                None => println!("{}", played.uci),
            }
            Ok(())
        }
        None => bail!("no move"),
    }
}
