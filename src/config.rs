use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::app::{AppCatalog, LaunchSpec};
use crate::channel::OverflowPolicy;
use crate::execution::{ExecutionMode, ExecutionSettings, WorkerCommand};

/// Application configuration, loaded from `numerous.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub base_dir: PathBuf,
    /// App to serve, by catalog name.
    pub module_path: String,
    pub template: String,
    /// Show error details in the browser.
    pub dev_mode: bool,
    pub execution_mode: ExecutionMode,
    pub poll_interval_ms: u64,
    pub init_timeout_secs: u64,
    pub stop_grace_ms: u64,
    pub channel_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Send widget updates back to the connection that made them.
    pub echo_to_origin: bool,
    pub idle_session_secs: u64,
    /// Worker argv; empty means this executable's `worker` subcommand.
    pub worker_command: Vec<String>,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            base_dir: PathBuf::from("app"),
            module_path: "counter".to_string(),
            template: "index.html".to_string(),
            dev_mode: false,
            execution_mode: ExecutionMode::Process,
            poll_interval_ms: 100,
            init_timeout_secs: 10,
            stop_grace_ms: 1000,
            channel_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            echo_to_origin: true,
            idle_session_secs: 300,
            worker_command: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration with the chain: `./numerous.toml` -> `~/numerous.toml` -> defaults.
    pub fn load() -> Self {
        let candidates = Self::config_paths();
        for path in &candidates {
            if let Ok(contents) = fs::read_to_string(path) {
                match toml::from_str::<AppConfig>(&contents) {
                    Ok(cfg) => return cfg,
                    Err(e) => {
                        eprintln!("Warning: failed to parse {}: {}", path.display(), e);
                    }
                }
            }
        }
        Self::default()
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("numerous.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("numerous.toml"));
        }
        paths
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn idle_session_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_session_secs)
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            base_dir: self.base_dir.clone(),
            module_path: self.module_path.clone(),
            template: self.template.clone(),
        }
    }

    /// The worker to launch in process mode.
    pub fn worker(&self) -> std::io::Result<WorkerCommand> {
        match WorkerCommand::from_argv(&self.worker_command) {
            Some(cmd) => Ok(cmd),
            None => WorkerCommand::current_exe(),
        }
    }

    pub fn execution_settings(&self, catalog: Arc<AppCatalog>) -> std::io::Result<ExecutionSettings> {
        Ok(ExecutionSettings {
            mode: self.execution_mode,
            poll_interval: self.poll_interval(),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            channel_capacity: self.channel_capacity,
            overflow_policy: self.overflow_policy,
            catalog,
            worker: self.worker()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.base_dir, PathBuf::from("app"));
        assert_eq!(cfg.module_path, "counter");
        assert_eq!(cfg.template, "index.html");
        assert!(!cfg.dev_mode);
        assert_eq!(cfg.execution_mode, ExecutionMode::Process);
        assert_eq!(cfg.poll_interval_ms, 100);
        assert_eq!(cfg.channel_capacity, 1024);
        assert_eq!(cfg.overflow_policy, OverflowPolicy::DropOldest);
        assert!(cfg.echo_to_origin);
        assert!(cfg.worker_command.is_empty());
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            module_path = "tabs"
            port = 9000
        "#;
        let cfg: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.module_path, "tabs");
        assert_eq!(cfg.port, 9000);
        // Other fields should be defaults
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.stop_grace_ms, 1000);
    }

    #[test]
    fn test_full_toml_deserialize() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 8080
            base_dir = "/srv/app"
            module_path = "tabs"
            template = "dash.html"
            dev_mode = true
            execution_mode = "thread"
            poll_interval_ms = 25
            init_timeout_secs = 3
            stop_grace_ms = 500
            channel_capacity = 16
            overflow_policy = "reject_new"
            echo_to_origin = false
            idle_session_secs = 60
            worker_command = ["/usr/bin/numerous-apps", "worker"]
            log_level = "debug"
        "#;
        let cfg: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.base_dir, PathBuf::from("/srv/app"));
        assert!(cfg.dev_mode);
        assert_eq!(cfg.execution_mode, ExecutionMode::Thread);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(25));
        assert_eq!(cfg.init_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.overflow_policy, OverflowPolicy::RejectNew);
        assert!(!cfg.echo_to_origin);
        assert_eq!(cfg.idle_session_timeout(), Duration::from_secs(60));
        let worker = cfg.worker().unwrap();
        assert_eq!(worker.program, PathBuf::from("/usr/bin/numerous-apps"));
        assert_eq!(worker.args, ["worker"]);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(toml::from_str::<AppConfig>(r#"execution_mode = "fork""#).is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let cfg = AppConfig {
            execution_mode: ExecutionMode::Thread,
            channel_capacity: 8,
            ..AppConfig::default()
        };
        let settings = cfg.execution_settings(Arc::new(AppCatalog::new())).unwrap();
        assert_eq!(settings.mode, ExecutionMode::Thread);
        assert_eq!(settings.channel_capacity, 8);
        assert_eq!(settings.stop_grace, Duration::from_millis(1000));
        assert_eq!(cfg.launch_spec().module_path, "counter");
    }

    #[test]
    fn test_load_falls_back_to_defaults() {
        // When no config file exists, load() returns defaults
        let cfg = AppConfig::load();
        assert_eq!(cfg.channel_capacity, AppConfig::default().channel_capacity);
    }
}
