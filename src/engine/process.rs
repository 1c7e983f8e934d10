use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};

use super::{Engine, Priority};
use crate::error::EngineError;

/// Line transport to one running engine.
pub struct EngineConnection {
    commands: mpsc::UnboundedSender<String>,
    pub(crate) lines: mpsc::UnboundedReceiver<String>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineConnection {
    /// Connection over plain channels, for engines that are not OS processes.
    pub fn new(
        commands: mpsc::UnboundedSender<String>,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> EngineConnection {
        EngineConnection {
            commands,
            lines,
            child: None,
            tasks: Vec::new(),
        }
    }

    /// Ties a background task to the connection, aborted on shutdown.
    pub fn attach_task(mut self, task: JoinHandle<()>) -> EngineConnection {
        self.tasks.push(task);
        self
    }

    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<String> {
        self.commands.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn send(&self, command: &str) -> Result<(), EngineError> {
        self.commands
            .send(command.to_string())
            .map_err(|_| EngineError::NotRunning)
    }

    pub fn set_priority(&self, priority: Priority) {
        match self.pid() {
            Some(pid) => apply_priority(pid, priority),
            None => debug!("no OS process to apply {priority:?} to"),
        }
    }

    /// Asks the engine to quit, then makes sure the process is gone.
    pub async fn shutdown(&mut self) {
        let _ = self.send("quit");
        if let Some(child) = self.child.as_mut() {
            let waited =
                tokio::time::timeout(std::time::Duration::from_millis(500), child.wait()).await;
            if !matches!(waited, Ok(Ok(_))) {
                // Best effort to kill the child process
                let _ = child.start_kill();
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.lines.close();
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, engine: &Engine) -> Result<EngineConnection, EngineError>;
}

/// Starts engines as child processes talking UCI over stdin/stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, engine: &Engine) -> Result<EngineConnection, EngineError> {
        if !engine.path.is_file() {
            return Err(EngineError::InvalidExecutable(engine.path.clone()));
        }

        let mut command = Command::new(&engine.path);
        command
            .args(&engine.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // engines look for their networks and books next to the binary
        if let Some(dir) = engine.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let mut stdin = child.stdin.take().ok_or(EngineError::NotRunning)?;
        let stdout = child.stdout.take().ok_or(EngineError::NotRunning)?;

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<String>();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let written = stdin.write_all(format!("{command}\n").as_bytes()).await;
                if written.is_err() || stdin.flush().await.is_err() {
                    warn!("engine stdin closed while sending {command:?}");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });

        debug!(
            "spawned {} ({}) pid {:?}",
            engine.name,
            engine.path.display(),
            child.id()
        );

        Ok(EngineConnection {
            commands: command_tx,
            lines: line_rx,
            child: Some(child),
            tasks: vec![writer, reader],
        })
    }
}

#[cfg(unix)]
fn apply_priority(pid: u32, priority: Priority) {
    // SAFETY: setpriority only reads its integer arguments.
    let result = unsafe {
        libc::setpriority(
            libc::PRIO_PROCESS,
            pid as libc::id_t,
            priority.niceness() as libc::c_int,
        )
    };
    if result != 0 {
        warn!(
            "could not set priority {priority:?} on pid {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn apply_priority(pid: u32, priority: Priority) {
    debug!("process priority {priority:?} not supported here (pid {pid})");
}
