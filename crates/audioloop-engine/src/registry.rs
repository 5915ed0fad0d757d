//! Single-instance registry for the process-wide controller.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use audioloop_audio::FocusArbiter;
use audioloop_ipc::ControlCommand;

/// Errors returned by the registry and controller handles.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a session controller is already installed")]
    AlreadyInstalled,

    #[error("no session controller is installed")]
    NotInstalled,

    #[error("session controller is no longer running")]
    Disconnected,
}

/// Handle to a controller running on its own thread.
pub struct ControllerHandle {
    commands: Sender<ControlCommand>,
    focus: Arc<FocusArbiter>,
    thread: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn new(
        commands: Sender<ControlCommand>,
        focus: Arc<FocusArbiter>,
        thread: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            focus,
            thread: Some(thread),
        }
    }

    /// Queue a command for the controller.
    pub fn send(&self, command: ControlCommand) -> Result<(), RegistryError> {
        self.commands
            .send(command)
            .map_err(|_| RegistryError::Disconnected)
    }

    /// Arbiter that external focus changes are delivered to.
    pub fn focus(&self) -> &Arc<FocusArbiter> {
        &self.focus
    }

    /// Sender side of the command channel.
    pub fn commands(&self) -> Sender<ControlCommand> {
        self.commands.clone()
    }

    /// Stop any session, end the controller loop and wait for it.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(thread) = self.thread.take() {
            // The controller may already be gone; joining still applies.
            let _ = self.commands.send(ControlCommand::Shutdown);
            if thread.join().is_err() {
                error!("Controller thread panicked");
            }
            debug!("Controller thread joined");
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Holds at most one installed controller.
pub struct SessionRegistry {
    slot: Mutex<Option<ControllerHandle>>,
}

static GLOBAL: SessionRegistry = SessionRegistry::new();

impl SessionRegistry {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(None),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static SessionRegistry {
        &GLOBAL
    }

    /// Install `handle` as the active controller.
    ///
    /// On `AlreadyInstalled` the rejected handle is shut down.
    pub fn install(&self, handle: ControllerHandle) -> Result<(), RegistryError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            drop(slot);
            handle.shutdown();
            return Err(RegistryError::AlreadyInstalled);
        }
        *slot = Some(handle);
        info!("Session controller installed");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Send a command to the installed controller.
    pub fn send(&self, command: ControlCommand) -> Result<(), RegistryError> {
        self.slot
            .lock()
            .as_ref()
            .ok_or(RegistryError::NotInstalled)?
            .send(command)
    }

    /// Arbiter of the installed controller.
    pub fn focus(&self) -> Option<Arc<FocusArbiter>> {
        self.slot.lock().as_ref().map(|h| Arc::clone(h.focus()))
    }

    /// Shut down and remove the installed controller.
    pub fn shutdown(&self) -> Result<(), RegistryError> {
        let handle = self.slot.lock().take().ok_or(RegistryError::NotInstalled)?;
        handle.shutdown();
        info!("Session controller removed");
        Ok(())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
