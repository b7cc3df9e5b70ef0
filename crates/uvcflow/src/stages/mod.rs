//! Pipeline stages. Each one runs on its own named thread through
//! `init → main → terminate`.
use std::{fmt, sync::Arc, thread};

use parking_lot::Mutex;

use crate::error::PipelineError;

pub mod capture;
pub mod delivery;
pub mod encode;
pub mod monitor;
pub mod supervisor;

pub use capture::{CaptureStage, CaptureState};
pub use delivery::{DeliveryStage, DeliveryState};
pub use encode::{EncodeStage, EncodeState};
pub use monitor::{MonitorReport, MonitorStage};
pub use supervisor::{EventOutcome, SupervisorStage};

/// Lifecycle outcome of a stage thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub enum StageStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// Thread started; `init` in progress or main loop running.
    Running,
    /// Main loop returned after shutdown.
    Exited,
    /// Init failed; the stage never entered its main loop.
    Failed(String),
}

/// Shared cell the stage thread writes its status into.
#[derive(Clone, Default)]
pub struct StatusCell(Arc<Mutex<StageStatus>>);

impl StatusCell {
    /// Snapshot of the current status.
    pub fn get(&self) -> StageStatus {
        self.0.lock().clone()
    }

    pub(crate) fn set(&self, status: StageStatus) {
        *self.0.lock() = status;
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusCell").field(&self.get()).finish()
    }
}

/// A pipeline stage driven by [`spawn_stage`].
pub trait Stage: Send {
    /// Name used for the thread and the `stage` log field.
    fn name(&self) -> &'static str;

    /// Configure devices and raise the stage's readiness bit.
    fn init(&mut self) -> Result<(), PipelineError>;

    /// Main loop; returns once shutdown is observed.
    fn run(&mut self);

    /// Clear readiness and log totals.
    fn terminate(&mut self);
}

/// Spawn `stage` on a thread named `uvcflow-<name>`.
pub fn spawn_stage<S>(mut stage: S, status: StatusCell) -> Result<thread::JoinHandle<()>, PipelineError>
where
    S: Stage + 'static,
{
    let name = stage.name();
    thread::Builder::new()
        .name(format!("uvcflow-{name}"))
        .spawn(move || {
            status.set(StageStatus::Running);
            if let Err(err) = stage.init() {
                tracing::error!(stage = name, code = err.code(), error = %err, "stage init failed");
                status.set(StageStatus::Failed(err.to_string()));
                return;
            }
            tracing::info!(stage = name, "stage running");
            stage.run();
            stage.terminate();
            status.set(StageStatus::Exited);
        })
        .map_err(|source| PipelineError::StageSpawn {
            stage: name,
            source,
        })
}
