//! Web front: serves the app page, the browser runtime, the widget config
//! API and the per-connection websocket relay.

pub mod routes;
pub mod server;
pub mod state;
pub mod templates;
pub mod websocket;

pub use server::{router, start_dashboard};
pub use state::DashboardState;
pub use templates::{FileTemplateRenderer, TemplateRenderer};
