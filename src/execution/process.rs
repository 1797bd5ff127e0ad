use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use super::pipe::{read_lines, write_lines};
use super::{fresh_link, ExecutionManager, Lifecycle};
use crate::app::LaunchSpec;
use crate::channel::CommunicationManager;
use crate::error::{Error, Result};

/// How to launch a worker process. The launch arguments (`--session-id`,
/// `--base-dir`, `--module`, `--template`, `--poll-ms`) are appended.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// The running executable's own `worker` subcommand.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["worker".to_string()],
        })
    }

    /// Build from an argv list; `None` when the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
        })
    }
}

/// Runs the app entry in a separate OS process. A crash or hang in app code
/// cannot take the server down, and `stop` kills the worker if it ignores
/// the cooperative shutdown.
pub struct ProcessExecution {
    comm: Arc<CommunicationManager>,
    worker: WorkerCommand,
    poll_interval: Duration,
    stop_grace: Duration,
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
    state: Lifecycle,
}

impl ProcessExecution {
    pub fn new(
        comm: Arc<CommunicationManager>,
        worker: WorkerCommand,
        poll_interval: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            comm,
            worker,
            poll_interval,
            stop_grace,
            child: None,
            pumps: Vec::new(),
            state: Lifecycle::Unstarted,
        }
    }

    /// OS process id of the running worker.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn spawn_pumps(&mut self, child: &mut Child) -> Result<()> {
        let missing = |what: &str| Error::Launch(io::Error::other(format!("worker {what} unavailable")));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let session_id = self.comm.session_id().to_string();

        // Closing stdin on exit is what tells the worker to stop.
        let comm = Arc::clone(&self.comm);
        let poll = self.poll_interval;
        let writer = thread::Builder::new()
            .name(format!("to-worker-{session_id}"))
            .spawn(move || {
                write_lines(&comm.to_execution, stdin, || comm.stop_requested(), poll)
            })
            .map_err(Error::Launch)?;

        let comm = Arc::clone(&self.comm);
        let reader = thread::Builder::new()
            .name(format!("from-worker-{session_id}"))
            .spawn(move || read_lines(stdout, &comm.from_execution))
            .map_err(Error::Launch)?;

        self.pumps = vec![writer, reader];
        Ok(())
    }
}

impl ExecutionManager for ProcessExecution {
    fn start(&mut self, launch: &LaunchSpec) -> Result<()> {
        if matches!(self.state, Lifecycle::Running | Lifecycle::StopRequested) {
            return Err(Error::AlreadyRunning);
        }
        self.comm = fresh_link(&self.comm);

        let mut child = Command::new(&self.worker.program)
            .args(&self.worker.args)
            .arg("--session-id")
            .arg(self.comm.session_id())
            .arg("--base-dir")
            .arg(&launch.base_dir)
            .arg("--module")
            .arg(&launch.module_path)
            .arg("--template")
            .arg(&launch.template)
            .arg("--poll-ms")
            .arg(self.poll_interval.as_millis().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(Error::Launch)?;

        if let Err(err) = self.spawn_pumps(&mut child) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        info!(
            session_id = %self.comm.session_id(),
            pid = child.id(),
            "started worker process"
        );
        self.child = Some(child);
        self.state = Lifecycle::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Unstarted => return Err(Error::NotRunning),
            Lifecycle::StopRequested | Lifecycle::Joined => return Ok(()),
            Lifecycle::Running => {}
        }
        self.comm.request_stop();
        self.state = Lifecycle::StopRequested;

        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        // Cooperative window: the stdin pump notices the stop signal within
        // one poll interval and closes the pipe.
        let window = self.stop_grace + self.poll_interval;
        match child.wait_timeout(window) {
            Ok(Some(status)) => {
                debug!(session_id = %self.comm.session_id(), %status, "worker exited");
            }
            Ok(None) => {
                warn!(
                    session_id = %self.comm.session_id(),
                    pid = child.id(),
                    "worker ignored shutdown, killing it"
                );
                let _ = child.kill();
            }
            Err(err) => {
                warn!(session_id = %self.comm.session_id(), "failed to wait for worker: {err}");
                let _ = child.kill();
            }
        }
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        if self.state == Lifecycle::Unstarted {
            return Err(Error::NotRunning);
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.wait() {
                warn!(session_id = %self.comm.session_id(), "failed to reap worker: {err}");
            }
        }
        // The writer ends once the stop signal is set. The reader ends at
        // EOF, which a grandchild holding stdout open can delay forever, so
        // it is detached after the grace period.
        self.comm.request_stop();
        let deadline = Instant::now() + self.stop_grace;
        for pump in self.pumps.drain(..) {
            while !pump.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if pump.is_finished() {
                let _ = pump.join();
            } else {
                debug!(session_id = %self.comm.session_id(), "detaching worker pipe pump");
            }
        }
        self.state = Lifecycle::Joined;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        self.state
    }

    fn communication(&self) -> Arc<CommunicationManager> {
        Arc::clone(&self.comm)
    }
}
