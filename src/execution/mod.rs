//! Execution managers: own the lifecycle of one isolated execution context.
//!
//! Two variants share the [`ExecutionManager`] contract. [`ProcessExecution`]
//! runs the app in a worker process and can kill it; [`ThreadExecution`]
//! runs it on a dedicated thread inside the server.

pub(crate) mod pipe;
mod process;
mod thread;

pub use process::{ProcessExecution, WorkerCommand};
pub use thread::ThreadExecution;

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::app::{AppCatalog, LaunchSpec};
use crate::channel::{CommunicationManager, OverflowPolicy};
use crate::error::Result;

/// Lifecycle of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unstarted,
    Running,
    StopRequested,
    Joined,
}

pub trait ExecutionManager: Send {
    /// Launch the app entry. Fails with `AlreadyRunning` unless the
    /// manager is unstarted or has been joined.
    fn start(&mut self, launch: &LaunchSpec) -> Result<()>;

    /// Request shutdown. Fails with `NotRunning` if never started.
    fn stop(&mut self) -> Result<()>;

    /// Wait for the execution unit to exit and release it. Fails with
    /// `NotRunning` if never started.
    fn join(&mut self) -> Result<()>;

    fn is_alive(&mut self) -> bool;

    fn lifecycle(&self) -> Lifecycle;

    fn communication(&self) -> Arc<CommunicationManager>;
}

/// Which variant the registry builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Process,
    Thread,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Process => write!(f, "process"),
            ExecutionMode::Thread => write!(f, "thread"),
        }
    }
}

/// Settings shared by every execution context a registry creates.
#[derive(Clone)]
pub struct ExecutionSettings {
    pub mode: ExecutionMode,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub channel_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub catalog: Arc<AppCatalog>,
    pub worker: WorkerCommand,
}

impl ExecutionSettings {
    /// Build an unstarted manager for `session_id`.
    pub fn build(&self, session_id: &str) -> Box<dyn ExecutionManager> {
        let comm = self.new_communication(session_id);
        match self.mode {
            ExecutionMode::Thread => Box::new(ThreadExecution::new(
                comm,
                Arc::clone(&self.catalog),
                self.poll_interval,
            )),
            ExecutionMode::Process => Box::new(ProcessExecution::new(
                comm,
                self.worker.clone(),
                self.poll_interval,
                self.stop_grace,
            )),
        }
    }

    fn new_communication(&self, session_id: &str) -> Arc<CommunicationManager> {
        Arc::new(CommunicationManager::new(
            session_id,
            self.channel_capacity,
            self.overflow_policy,
        ))
    }
}

/// Replace a spent communication link when a joined manager is restarted;
/// a stop signal is never cleared once set.
pub(crate) fn fresh_link(comm: &Arc<CommunicationManager>) -> Arc<CommunicationManager> {
    if comm.stop_requested() {
        Arc::new(CommunicationManager::new(
            comm.session_id(),
            comm.to_execution.capacity(),
            comm.to_execution.policy(),
        ))
    } else {
        Arc::clone(comm)
    }
}
