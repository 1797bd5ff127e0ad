use std::sync::Arc;
use std::time::Duration;

use super::templates::{FileTemplateRenderer, TemplateRenderer};
use crate::app::{AppCatalog, LaunchSpec};
use crate::config::AppConfig;
use crate::session::SessionRegistry;

/// Shared state for all request handlers.
pub struct DashboardState {
    pub registry: Arc<SessionRegistry>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub launch: LaunchSpec,
    pub dev_mode: bool,
    pub idle_timeout: Duration,
}

impl DashboardState {
    pub fn new(config: &AppConfig, catalog: AppCatalog) -> std::io::Result<Self> {
        let settings = config.execution_settings(Arc::new(catalog))?;
        let registry = SessionRegistry::new(settings, config.init_timeout(), config.echo_to_origin);
        Ok(Self {
            registry: Arc::new(registry),
            renderer: Arc::new(FileTemplateRenderer),
            launch: config.launch_spec(),
            dev_mode: config.dev_mode,
            idle_timeout: config.idle_session_timeout(),
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Client-side log level handed to the browser runtime.
    pub fn client_log_level(&self) -> &'static str {
        if self.dev_mode {
            "DEBUG"
        } else {
            "ERROR"
        }
    }
}
