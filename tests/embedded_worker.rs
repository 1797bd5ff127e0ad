// A binary that embeds its own app catalog and serves it in process mode.
//
// Run without arguments this is the test; re-executed with `worker` it is
// the session's worker process, routed through `run_with` like an
// embedder's `main` would be.

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use numerous_apps::app::{as_number, AppCatalog, LaunchSpec};
use numerous_apps::channel::OverflowPolicy;
use numerous_apps::execution::{ExecutionSettings, WorkerCommand};
use numerous_apps::widgets::{button, number, WidgetGraph};
use numerous_apps::{ExecutionMode, Message, SessionRegistry};

fn custom_catalog() -> AppCatalog {
    AppCatalog::new().register("custom", |_| {
        let mut graph = WidgetGraph::new();
        graph.insert("total", number("Total", 10.0));
        graph.insert("add_five", button("Add five"));
        graph.observe("add_five", "clicked", |_, fx| {
            let next = as_number(fx.get("total", "value")) + 5.0;
            fx.set("total", "value", next);
        })?;
        Ok(graph)
    })
}

fn registry(mode: ExecutionMode) -> SessionRegistry {
    let settings = ExecutionSettings {
        mode,
        poll_interval: Duration::from_millis(20),
        stop_grace: Duration::from_secs(1),
        channel_capacity: 64,
        overflow_policy: OverflowPolicy::DropOldest,
        catalog: Arc::new(custom_catalog()),
        worker: WorkerCommand {
            program: std::env::current_exe().unwrap(),
            args: vec!["worker".to_string()],
        },
    };
    SessionRegistry::new(settings, Duration::from_secs(10), true)
}

async fn custom_app_runs_in(mode: ExecutionMode) {
    let registry = registry(mode);
    let launch = LaunchSpec {
        base_dir: PathBuf::from("app"),
        module_path: "custom".to_string(),
        template: "index.html".to_string(),
    };
    let session = match registry.get_or_create("embedded", &launch).await {
        Ok(session) => session,
        Err(err) => panic!("{mode} mode failed to start the custom app: {err}"),
    };
    let config = session.init_config().await;
    assert_eq!(config.widgets, ["total", "add_five"], "{mode} mode");
    assert_eq!(config.widget_configs["total"].defaults["value"], json!(10.0));

    session
        .comm()
        .to_execution
        .send(Message::widget_update("add_five", "clicked", json!(true)));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let value = session.init_config().await.widget_configs["total"].defaults["value"].clone();
        if value == json!(15.0) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{mode} mode never applied the click, total is {value}"
        );
    }
    registry.shutdown_all().await;
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    if std::env::args().nth(1).as_deref() == Some("worker") {
        return runtime.block_on(numerous_apps::run_with(custom_catalog()));
    }

    runtime.block_on(async {
        custom_app_runs_in(ExecutionMode::Thread).await;
        custom_app_runs_in(ExecutionMode::Process).await;
    });
    println!("test embedded_worker ... ok");
    Ok(())
}
