//! App entry: the code that runs inside an execution context.
//!
//! It builds the session's widget graph from a catalog factory, mirrors
//! every synchronized property change onto the outbound channel, and applies
//! inbound updates until the stop signal is set.

use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::channel::CommunicationManager;
use crate::error::{Error, Result};
use crate::messages::{InitConfig, Message, WidgetUpdate};
use crate::widgets::{WidgetDescription, WidgetGraph};

/// What to launch inside an execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub base_dir: PathBuf,
    /// Name of the app in the catalog.
    pub module_path: String,
    /// UI template file, relative to `base_dir`.
    pub template: String,
}

/// Passed to app factories.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub session_id: String,
    pub base_dir: PathBuf,
    pub module_path: String,
    pub template: String,
}

pub type AppFactory = Arc<dyn Fn(&AppContext) -> anyhow::Result<WidgetGraph> + Send + Sync>;

/// Registered widget applications, keyed by module path.
#[derive(Clone, Default)]
pub struct AppCatalog {
    apps: HashMap<String, AppFactory>,
}

impl AppCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, module_path: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&AppContext) -> anyhow::Result<WidgetGraph> + Send + Sync + 'static,
    {
        self.apps.insert(module_path.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, module_path: &str) -> Option<&AppFactory> {
        self.apps.get(module_path)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.apps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

struct Failure {
    error_type: String,
    message: String,
    traceback: String,
}

impl Failure {
    fn into_message(self) -> Message {
        Message::error(self.error_type, self.message, self.traceback)
    }

    fn from_panic(payload: &(dyn Any + Send), module_path: &str) -> Self {
        Failure {
            error_type: "Panic".to_string(),
            message: panic_message(payload),
            traceback: format!("panic in app '{module_path}'"),
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::AppProcess {
            error_type: failure.error_type,
            message: failure.message,
            traceback: failure.traceback,
        }
    }
}

/// Run one session's app until the stop signal is set. Never panics: any
/// failure, including a panic in user code, is reported as an `Error`
/// message on the outbound channel before returning.
pub fn run_app(
    comm: Arc<CommunicationManager>,
    catalog: &AppCatalog,
    launch: &LaunchSpec,
    poll: Duration,
) {
    let session_id = comm.session_id().to_string();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        app_loop(Arc::clone(&comm), catalog, launch, poll)
    }));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(failure)) => Some(failure),
        Err(payload) => Some(Failure::from_panic(payload.as_ref(), &launch.module_path)),
    };
    if let Some(failure) = failure {
        error!(
            session_id = %session_id,
            error_type = %failure.error_type,
            "app failed: {}", failure.message
        );
        comm.from_execution.send(failure.into_message());
    }
    info!(session_id = %session_id, "app entry exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "app panicked".to_string()
    }
}

/// Describe the widgets `launch` builds, without starting a session.
/// Factory failures and panics surface as `Error::AppProcess`.
pub fn describe_app(
    catalog: &AppCatalog,
    launch: &LaunchSpec,
) -> Result<BTreeMap<String, WidgetDescription>> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| build_graph(catalog, launch, "describe")));
    match outcome {
        Ok(Ok(graph)) => Ok(graph.describe()),
        Ok(Err(failure)) => Err(failure.into()),
        Err(payload) => Err(Failure::from_panic(payload.as_ref(), &launch.module_path).into()),
    }
}

fn build_graph(
    catalog: &AppCatalog,
    launch: &LaunchSpec,
    session_id: &str,
) -> Result<WidgetGraph, Failure> {
    let factory = catalog.get(&launch.module_path).ok_or_else(|| Failure {
        error_type: "ModuleNotFound".to_string(),
        message: format!("no app registered as '{}'", launch.module_path),
        traceback: format!("available apps: {}", catalog.names().join(", ")),
    })?;

    let ctx = AppContext {
        session_id: session_id.to_string(),
        base_dir: launch.base_dir.clone(),
        module_path: launch.module_path.clone(),
        template: launch.template.clone(),
    };
    factory(&ctx).map_err(|err| Failure {
        error_type: "AppError".to_string(),
        message: err.to_string(),
        traceback: format!("{err:?}"),
    })
}

fn app_loop(
    comm: Arc<CommunicationManager>,
    catalog: &AppCatalog,
    launch: &LaunchSpec,
    poll: Duration,
) -> Result<(), Failure> {
    let session_id = comm.session_id().to_string();
    let mut graph = build_graph(catalog, launch, &session_id)?;

    install_emitters(&mut graph, &comm);
    comm.from_execution
        .send(Message::InitConfig(init_config(&graph, &launch.template, None)));
    info!(
        session_id = %session_id,
        widgets = graph.widget_ids().len(),
        "app initialized"
    );

    while !comm.stop_requested() {
        // Timeout just means another turn to check the stop signal.
        if let Ok(msg) = comm.to_execution.receive(poll) {
            handle_message(&mut graph, &comm, &launch.template, msg);
        }
    }
    Ok(())
}

/// Observe every synchronized property and forward its changes outbound.
/// Action properties are skipped so a pulse is never echoed.
fn install_emitters(graph: &mut WidgetGraph, comm: &Arc<CommunicationManager>) {
    for (widget_id, property, fire_once) in graph.synced_properties() {
        if fire_once {
            continue;
        }
        let comm = Arc::clone(comm);
        let installed = graph.observe(&widget_id, &property, move |change, _| {
            comm.from_execution.send(Message::WidgetUpdate(WidgetUpdate {
                widget_id: change.widget_id.clone(),
                property: change.property.clone(),
                value: change.new.clone(),
                client_id: change.origin.clone(),
            }));
        });
        if let Err(err) = installed {
            warn!("could not observe {widget_id}.{property}: {err}");
        }
    }
}

fn init_config(graph: &WidgetGraph, template: &str, client_id: Option<String>) -> InitConfig {
    InitConfig {
        widgets: graph.widget_ids().to_vec(),
        widget_configs: graph.configs(),
        template: template.to_string(),
        client_id,
    }
}

fn handle_message(
    graph: &mut WidgetGraph,
    comm: &CommunicationManager,
    template: &str,
    msg: Message,
) {
    match msg {
        Message::WidgetUpdate(update) => {
            debug!(
                widget_id = %update.widget_id,
                property = %update.property,
                "applying update"
            );
            let result = graph.set_from(
                update.client_id.as_deref(),
                &update.widget_id,
                &update.property,
                update.value,
            );
            if let Err(err) = result {
                warn!("dropping update: {err}");
            }
        }
        Message::GetState => {
            comm.from_execution
                .send(Message::InitConfig(init_config(graph, template, None)));
        }
        Message::GetWidgetStates { client_id } => {
            comm.from_execution
                .send(Message::InitConfig(init_config(graph, template, Some(client_id))));
        }
        other => debug!(kind = other.kind(), "ignoring message"),
    }
}

/// Read a numeric property, treating anything else as zero.
pub fn as_number(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}
