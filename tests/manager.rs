mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{START, ScriptedLauncher, scripted_engine};
use engine_manager::{
    EngineManager, ListEngineManagers, ManagerState, MultiEngineResponse, ProcessLauncher,
    RunEngineParams,
};

fn temp_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "engine-manager-{name}-{}-{}",
        std::process::id(),
        chrono::Local::now().timestamp_nanos_opt().unwrap_or_default()
    ))
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let launcher = ScriptedLauncher::new();
    let mut manager = launcher.manager(scripted_engine("sf"), RunEngineParams::depth(2));
    let handle = manager.handle();

    assert!(manager.check_engine().await);
    assert!(manager.check_engine().await);
    assert_eq!(manager.id_name(), Some("Scripted 1.0"));
    assert!(manager.has_option("multipv"));

    manager.close().await;
    manager.close().await;
    assert!(manager.is_closed());
    assert!(handle.is_closed());
    assert_eq!(manager.state(), ManagerState::Closed);

    manager.stop();
    manager.set_option("Hash", "32");
    assert!(!manager.check_engine().await);
    assert!(!manager.go(START, &RunEngineParams::depth(2)).await);
    assert!(manager.get_current_mrm().is_none());
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn startup_failure_closes_the_manager() {
    let launcher = ScriptedLauncher::failing();
    let mut manager = launcher.manager(scripted_engine("ghost"), RunEngineParams::depth(2));
    assert!(!manager.check_engine().await);
    assert!(manager.is_closed());

    let engine = engine_manager::Engine::new("ghost", "/nonexistent/engines/ghost");
    let params = RunEngineParams::depth(2);
    let mut manager = EngineManager::new(engine, params, Arc::new(ProcessLauncher));
    assert!(!manager.check_engine().await);
    assert!(manager.is_closed());
    let result = manager.run_search(START, &params, None, |_, _| true).await;
    assert!(result.is_none());
}

#[tokio::test]
async fn options_wait_for_the_engine() {
    let launcher = ScriptedLauncher::new();
    let mut manager = launcher.manager(scripted_engine("sf"), RunEngineParams::depth(1));
    manager.set_option("Hash", "64");
    assert!(launcher.commands().is_empty());

    assert!(manager.check_engine().await);
    let commands = launcher.commands();
    let hash = commands
        .iter()
        .position(|c| c == "setoption name Hash value 64")
        .unwrap();
    let ready = commands.iter().position(|c| c == "isready").unwrap();
    assert!(hash < ready);

    manager.new_game();
    manager.set_option("Threads", "2");
    manager
        .run_search(START, &RunEngineParams::depth(1), None, |_, _| true)
        .await
        .unwrap();
    assert_eq!(launcher.count_commands("setoption name Threads value 2"), 1);
    assert_eq!(launcher.count_commands("ucinewgame"), 1);
    manager.close().await;
}

#[tokio::test]
async fn callbacks_follow_the_search() {
    let launcher = ScriptedLauncher::new();
    let mut manager = launcher.manager(scripted_engine("sf"), RunEngineParams::depth(3));
    let depths = Arc::new(Mutex::new(Vec::new()));
    let bestmoves = Arc::new(Mutex::new(Vec::new()));

    let seen = depths.clone();
    manager.connect_depthchanged(Some(Box::new(move |mrm: &MultiEngineResponse| {
        seen.lock().unwrap().push(mrm.max_depth());
    })));
    let seen = bestmoves.clone();
    manager.connect_bestmove(Some(Box::new(move |m: Option<&str>| {
        seen.lock().unwrap().push(m.map(str::to_string));
    })));

    let params = RunEngineParams::depth(3);
    let mrm = manager.run_search(START, &params, None, |_, _| true).await.unwrap();
    assert_eq!(mrm.max_depth(), 3);
    assert_eq!(*depths.lock().unwrap(), vec![1, 2]);
    assert_eq!(*bestmoves.lock().unwrap(), vec![Some("g1h3".to_string())]);

    // replaced, not accumulated
    manager.connect_bestmove(None);
    manager.run_search(START, &params, None, |_, _| true).await.unwrap();
    assert_eq!(bestmoves.lock().unwrap().len(), 1);
    assert_eq!(depths.lock().unwrap().len(), 4);
    manager.close().await;
}

#[tokio::test]
async fn current_mrm_is_a_copy() {
    let launcher = ScriptedLauncher::new();
    let params = RunEngineParams::depth(2).with_multipv(3);
    let mut manager = launcher.manager(scripted_engine("sf"), params);
    assert!(manager.get_current_mrm().is_none());

    manager.run_search(START, &params, None, |_, _| true).await.unwrap();
    let mut copy = manager.get_current_mrm().unwrap();
    copy.add_rm(engine_manager::EngineResponse::terminal("sf", true, "a2a3", 0));
    assert_eq!(copy.len(), 4);
    assert_eq!(manager.get_current_mrm().unwrap().len(), 3);
    manager.close().await;
}

#[tokio::test]
async fn emulated_movetime_is_stopped_by_the_manager() {
    let launcher = ScriptedLauncher::new();
    let mut engine = scripted_engine("slow");
    engine.emulate_movetime = true;
    let params = RunEngineParams::movetime(100);
    let mut manager = launcher.manager(engine, params);

    let mrm = manager.run_search(START, &params, None, |_, _| true).await.unwrap();
    assert!(!mrm.is_empty());
    assert_eq!(launcher.count_commands("go infinite"), 1);
    assert_eq!(launcher.count_commands("stop"), 1);
    assert!(manager.elapsed_ms() >= 100);
    manager.close().await;
}

#[tokio::test]
async fn registry_closes_a_waiting_manager() {
    let launcher = ScriptedLauncher::new();
    let mut manager = launcher.manager(scripted_engine("sf"), RunEngineParams::default());
    let mut registry = ListEngineManagers::new();
    registry.register(manager.handle());
    assert_eq!(registry.len(), 1);

    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.close_all();
        registry
    });
    let every = Some(Duration::from_millis(10));
    let result = manager
        .run_search(START, &RunEngineParams::default(), every, |_, _| true)
        .await;
    assert!(result.is_none());
    assert!(manager.is_closed());

    let mut registry = closer.await.unwrap();
    registry.cleanup();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn engine_dying_mid_search_ends_the_wait() {
    let launcher = ScriptedLauncher::dying();
    let mut manager = launcher.manager(scripted_engine("sf"), RunEngineParams::default());
    let handle = manager.handle();

    let every = Some(Duration::from_millis(10));
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        manager.run_search(START, &RunEngineParams::default(), every, |_, _| true),
    )
    .await
    .expect("wait outlived the engine");
    assert!(result.is_none());
    assert!(manager.is_closed());
    assert!(handle.is_closed());
    assert_eq!(launcher.searches(), vec![START.to_string()]);

    // nothing is restarted afterwards
    assert!(!manager.go(START, &RunEngineParams::depth(1)).await);
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn registry_stops_idle_engines_at_once() {
    let launcher = ScriptedLauncher::new();
    let mut manager = launcher.manager(scripted_engine("sf"), RunEngineParams::depth(1));
    assert!(manager.check_engine().await);
    let mut registry = ListEngineManagers::new();
    registry.register(manager.handle());

    registry.close_all();
    let mut waited = Duration::ZERO;
    while launcher.count_commands("quit") == 0 && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    // the engine got the message before the manager was touched again
    assert_eq!(launcher.count_commands("quit"), 1);
    assert!(!manager.is_closed());

    assert!(!manager.check_engine().await);
    assert!(manager.is_closed());
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn registry_switches_protocol_logs() {
    let dir = temp_dir("logs");
    let launcher = ScriptedLauncher::new();
    let mut manager = launcher
        .manager(scripted_engine("sf"), RunEngineParams::depth(1))
        .with_log_dir(&dir);
    let mut registry = ListEngineManagers::new();
    registry.active_logs(true);
    registry.register(manager.handle());

    assert!(manager.check_engine().await);
    let path = manager.log_path().unwrap();
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("sf_0000"));

    registry.active_logs(false);
    manager
        .run_search(START, &RunEngineParams::depth(1), None, |_, _| true)
        .await
        .unwrap();
    assert!(manager.log_path().is_none());
    manager.close().await;

    let transcript = std::fs::read_to_string(&path).unwrap();
    assert!(transcript.contains(">> uci"));
    assert!(transcript.contains("<< uciok"));
    assert!(!transcript.contains("go depth 1"));
    let _ = std::fs::remove_dir_all(dir);
}
