use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

use super::{fresh_link, ExecutionManager, Lifecycle};
use crate::app::{run_app, AppCatalog, LaunchSpec};
use crate::channel::CommunicationManager;
use crate::error::{Error, Result};

/// Runs the app entry on a dedicated OS thread. Cheaper than a process but
/// shares the server's address space, so only for trusted app code.
pub struct ThreadExecution {
    comm: Arc<CommunicationManager>,
    catalog: Arc<AppCatalog>,
    poll_interval: Duration,
    handle: Option<JoinHandle<()>>,
    state: Lifecycle,
}

impl ThreadExecution {
    pub fn new(
        comm: Arc<CommunicationManager>,
        catalog: Arc<AppCatalog>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            comm,
            catalog,
            poll_interval,
            handle: None,
            state: Lifecycle::Unstarted,
        }
    }
}

impl ExecutionManager for ThreadExecution {
    fn start(&mut self, launch: &LaunchSpec) -> Result<()> {
        if matches!(self.state, Lifecycle::Running | Lifecycle::StopRequested) {
            return Err(Error::AlreadyRunning);
        }
        self.comm = fresh_link(&self.comm);

        let comm = Arc::clone(&self.comm);
        let catalog = Arc::clone(&self.catalog);
        let launch = launch.clone();
        let poll = self.poll_interval;
        let handle = thread::Builder::new()
            .name(format!("app-{}", self.comm.session_id()))
            .spawn(move || run_app(comm, &catalog, &launch, poll))
            .map_err(Error::Launch)?;

        info!(session_id = %self.comm.session_id(), "started app thread");
        self.handle = Some(handle);
        self.state = Lifecycle::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Unstarted => Err(Error::NotRunning),
            Lifecycle::Running => {
                self.comm.request_stop();
                self.state = Lifecycle::StopRequested;
                Ok(())
            }
            Lifecycle::StopRequested | Lifecycle::Joined => Ok(()),
        }
    }

    fn join(&mut self) -> Result<()> {
        if self.state == Lifecycle::Unstarted {
            return Err(Error::NotRunning);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(session_id = %self.comm.session_id(), "app thread panicked");
            }
        }
        self.state = Lifecycle::Joined;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn lifecycle(&self) -> Lifecycle {
        self.state
    }

    fn communication(&self) -> Arc<CommunicationManager> {
        Arc::clone(&self.comm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OverflowPolicy;
    use crate::messages::Message;
    use crate::widgets::{number, WidgetGraph};
    use std::path::PathBuf;
    use std::time::Instant;

    fn manager() -> ThreadExecution {
        let catalog = AppCatalog::new().register("counter", |_| {
            let mut graph = WidgetGraph::new();
            graph.insert("counter", number("Counter", 0.0));
            Ok(graph)
        });
        ThreadExecution::new(
            Arc::new(CommunicationManager::new("t1", 32, OverflowPolicy::DropOldest)),
            Arc::new(catalog),
            Duration::from_millis(50),
        )
    }

    fn launch() -> LaunchSpec {
        LaunchSpec {
            base_dir: PathBuf::from("."),
            module_path: "counter".to_string(),
            template: "index.html".to_string(),
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut exec = manager();
        assert_eq!(exec.lifecycle(), Lifecycle::Unstarted);
        exec.start(&launch()).unwrap();
        assert_eq!(exec.lifecycle(), Lifecycle::Running);
        let msg = exec
            .communication()
            .from_execution
            .receive(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(msg, Message::InitConfig(_)));
        assert!(exec.is_alive());

        exec.stop().unwrap();
        exec.stop().unwrap();
        assert_eq!(exec.lifecycle(), Lifecycle::StopRequested);
        exec.join().unwrap();
        assert_eq!(exec.lifecycle(), Lifecycle::Joined);
        assert!(!exec.is_alive());
    }

    #[test]
    fn test_start_twice_fails() {
        let mut exec = manager();
        exec.start(&launch()).unwrap();
        assert!(matches!(exec.start(&launch()), Err(Error::AlreadyRunning)));
        exec.stop().unwrap();
        assert!(matches!(exec.start(&launch()), Err(Error::AlreadyRunning)));
        exec.join().unwrap();
    }

    #[test]
    fn test_stop_and_join_before_start_fail() {
        let mut exec = manager();
        assert!(matches!(exec.stop(), Err(Error::NotRunning)));
        assert!(matches!(exec.join(), Err(Error::NotRunning)));
    }

    #[test]
    fn test_restart_after_join_uses_fresh_link() {
        let mut exec = manager();
        exec.start(&launch()).unwrap();
        let first = exec.communication();
        exec.stop().unwrap();
        exec.join().unwrap();

        exec.start(&launch()).unwrap();
        let second = exec.communication();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.stop_requested());
        exec.stop().unwrap();
        exec.join().unwrap();
    }

    #[test]
    fn test_stop_is_prompt() {
        let mut exec = manager();
        exec.start(&launch()).unwrap();
        exec.communication()
            .from_execution
            .receive(Duration::from_secs(5))
            .unwrap();
        let started = Instant::now();
        exec.stop().unwrap();
        exec.join().unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
