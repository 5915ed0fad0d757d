//! Session controller for audioloop.
//!
//! This crate sequences authorization, source and sink acquisition, the
//! mixer thread and teardown, driven by `ControlCommand`s and reporting
//! through `SessionEvent`s.

mod authorization;
mod error;
mod metrics;
mod orchestrator;
mod registry;
mod state;

pub use authorization::{
    grant, AuthorizationError, AuthorizationProvider, AuthorizedCaptureContext, RevocationHandle,
    TokenAuthorizationProvider,
};
pub use error::{SessionError, SessionResult};
pub use metrics::MetricsCollector;
pub use orchestrator::SessionController;
pub use registry::{ControllerHandle, RegistryError, SessionRegistry};
pub use state::{InitializedResources, ResourceManager, SessionPlan};

use std::sync::Arc;
use std::thread;

use audioloop_audio::AudioBackend;
use audioloop_ipc::{ControlCommand, SessionConfig, SessionEvent};
use crossbeam_channel::{Receiver, Sender};

/// Create a controller instance with IPC channels.
pub fn create_controller(
    command_rx: Receiver<ControlCommand>,
    event_tx: Sender<SessionEvent>,
    backend: Arc<dyn AudioBackend>,
    authorizer: Box<dyn AuthorizationProvider>,
    config: SessionConfig,
) -> SessionController {
    SessionController::new(command_rx, event_tx, backend, authorizer, config)
}

/// Run a controller on its own thread.
///
/// Returns the handle used to drive it and the receiving end of its events.
pub fn spawn_controller(
    backend: Arc<dyn AudioBackend>,
    authorizer: Box<dyn AuthorizationProvider>,
    config: SessionConfig,
) -> std::io::Result<(ControllerHandle, Receiver<SessionEvent>)> {
    let (command_tx, command_rx) = audioloop_ipc::command_channel();
    let (event_tx, event_rx) = audioloop_ipc::event_channel();

    let mut controller = create_controller(command_rx, event_tx, backend, authorizer, config);
    let focus = controller.focus();
    let thread = thread::Builder::new()
        .name("audioloop-controller".to_string())
        .spawn(move || controller.run())?;

    Ok((ControllerHandle::new(command_tx, focus, thread), event_rx))
}
