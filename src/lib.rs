use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;

pub mod app;
pub mod channel;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod demos;
pub mod error;
pub mod execution;
pub mod logging;
pub mod messages;
pub mod relay;
pub mod session;
pub mod utils;
pub mod widgets;
pub mod worker;

use cli::{Cli, Command, ServeArgs};

/// Run the application with the built-in demo apps.
pub async fn run() -> Result<()> {
    run_with(demos::builtin_catalog()).await
}

/// Run the application with `catalog`: load `.env`, load config, then serve
/// or run a worker.
///
/// Without a subcommand the server starts with settings from
/// `numerous.toml`. In process mode every session re-executes this binary
/// with the hidden `worker` subcommand, so a binary that embeds its own
/// catalog must call this from `main` for both the server and its workers
/// to see the same apps.
pub async fn run_with(catalog: AppCatalog) -> Result<()> {
    // Load environment variables from .env
    dotenv().ok();

    let cli = Cli::parse();
    let mut config = AppConfig::load();

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            args.apply(&mut config);
            logging::init(&config.log_level);
            serve(config, catalog).await
        }
        Command::Worker(args) => {
            logging::init(&config.log_level);
            let opts = args.into_options(&config);
            tokio::task::spawn_blocking(move || worker::run_worker(&catalog, opts))
                .await
                .context("Worker task failed")?
        }
    }
}

/// Serve `catalog` with `config` until Ctrl-C. Process-mode workers are
/// launched from `config.worker_command`, or this executable's `worker`
/// subcommand when that is empty; see [`run_with`].
pub async fn serve(config: AppConfig, catalog: AppCatalog) -> Result<()> {
    let state = dashboard::DashboardState::new(&config, catalog)
        .context("Failed to resolve the worker executable")?;
    tracing::info!(
        module = %config.module_path,
        mode = %config.execution_mode,
        "starting numerous-apps"
    );
    let addr = format!("{}:{}", config.host, config.port);
    dashboard::start_dashboard(Arc::new(state), &addr).await
}

// Re-exports for library consumers: common useful types
pub use app::{AppCatalog, AppContext, LaunchSpec};
pub use config::AppConfig;
pub use error::{Error, Result as NumerousResult};
pub use execution::{ExecutionManager, ExecutionMode};
pub use messages::Message;
pub use session::SessionRegistry;
pub use widgets::WidgetGraph;
