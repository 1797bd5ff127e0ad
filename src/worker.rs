//! Entry point of a worker process: bridges stdin/stdout to an in-process
//! communication link and runs the app entry on it.

use anyhow::{anyhow, Context, Result};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

use crate::app::{run_app, AppCatalog, LaunchSpec};
use crate::channel::{CommunicationManager, OverflowPolicy};
use crate::execution::pipe::{read_lines, write_lines};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub session_id: String,
    pub launch: LaunchSpec,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

/// Run one session's app with stdin as the inbound channel and stdout as the
/// outbound one. Returns once the app entry exits and every outbound message
/// has been flushed. EOF on stdin is the stop signal.
pub fn run_worker(catalog: &AppCatalog, opts: WorkerOptions) -> Result<()> {
    let comm = Arc::new(CommunicationManager::new(
        opts.session_id.clone(),
        opts.channel_capacity,
        opts.overflow_policy,
    ));
    info!(session_id = %opts.session_id, module = %opts.launch.module_path, "worker starting");

    {
        let comm = Arc::clone(&comm);
        thread::Builder::new()
            .name("worker-stdin".to_string())
            .spawn(move || {
                read_lines(io::stdin(), &comm.to_execution);
                comm.request_stop();
            })
            .context("Failed to spawn stdin pump")?;
    }

    let writer = {
        let comm = Arc::clone(&comm);
        let poll = opts.poll_interval;
        thread::Builder::new()
            .name("worker-stdout".to_string())
            .spawn(move || {
                write_lines(&comm.from_execution, io::stdout(), || comm.stop_requested(), poll)
            })
            .context("Failed to spawn stdout pump")?
    };

    run_app(Arc::clone(&comm), catalog, &opts.launch, opts.poll_interval);
    comm.request_stop();
    writer
        .join()
        .map_err(|_| anyhow!("stdout pump panicked"))?;

    info!(session_id = %opts.session_id, "worker exiting");
    Ok(())
}
