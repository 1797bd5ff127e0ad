use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::app::LaunchSpec;
use crate::config::AppConfig;
use crate::execution::ExecutionMode;
use crate::worker::WorkerOptions;

#[derive(Parser, Debug)]
#[command(name = "numerous-apps")]
#[command(version, about = "Serve widget dashboards with one isolated app instance per session", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve an app over HTTP (the default)
    Serve(ServeArgs),
    /// Run one session's app over stdin/stdout
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// App to serve, by name
    #[arg(short, long)]
    pub module: Option<String>,

    /// Page template, relative to the base directory
    #[arg(short, long)]
    pub template: Option<String>,

    /// Directory holding the app's templates
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// Show error details in the browser
    #[arg(long)]
    pub dev: bool,

    /// Run apps on threads instead of worker processes
    #[arg(long)]
    pub threaded: bool,

    /// Log level or filter directive (RUST_LOG wins)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ServeArgs {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply(self, config: &mut AppConfig) {
        if let Some(module) = self.module {
            config.module_path = module;
        }
        if let Some(template) = self.template {
            config.template = template;
        }
        if let Some(base_dir) = self.base_dir {
            config.base_dir = base_dir;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.dev_mode |= self.dev;
        if self.threaded {
            config.execution_mode = ExecutionMode::Thread;
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub session_id: String,

    #[arg(long)]
    pub base_dir: PathBuf,

    #[arg(long)]
    pub module: String,

    #[arg(long)]
    pub template: String,

    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
}

impl WorkerArgs {
    pub fn into_options(self, config: &AppConfig) -> WorkerOptions {
        WorkerOptions {
            session_id: self.session_id,
            launch: LaunchSpec {
                base_dir: self.base_dir,
                module_path: self.module,
                template: self.template,
            },
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
            channel_capacity: config.channel_capacity,
            overflow_policy: config.overflow_policy,
        }
    }
}
