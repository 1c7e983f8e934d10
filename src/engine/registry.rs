use log::info;

use super::manager::ManagerHandle;

/// The live managers of the application, for bulk shutdown and for switching
/// protocol transcripts on and off everywhere at once.
#[derive(Debug, Default)]
pub struct ListEngineManagers {
    handles: Vec<ManagerHandle>,
    logs_active: bool,
}

impl ListEngineManagers {
    pub fn new() -> ListEngineManagers {
        ListEngineManagers::default()
    }

    pub fn register(&mut self, handle: ManagerHandle) {
        self.cleanup();
        if self.logs_active {
            handle.set_logging(true);
        }
        self.handles.push(handle);
    }

    /// Running engines are told to quit right away, every manager finishes
    /// closing at its next wake up or call, waits included.
    pub fn close_all(&mut self) {
        info!("closing {} engine manager(s)", self.handles.len());
        for handle in self.handles.drain(..) {
            handle.request_close();
        }
    }

    /// Managers open or close their transcript the next time they talk to the engine.
    pub fn active_logs(&mut self, active: bool) {
        self.cleanup();
        self.logs_active = active;
        for handle in &self.handles {
            handle.set_logging(active);
        }
    }

    pub fn logs_active(&self) -> bool {
        self.logs_active
    }

    /// Drops managers that closed on their own.
    pub fn cleanup(&mut self) {
        self.handles.retain(|handle| !handle.is_closed());
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
