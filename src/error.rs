use thiserror::Error;

/// Errors raised by the session execution and communication core.
#[derive(Debug, Error)]
pub enum Error {
    /// No message arrived within the receive timeout.
    #[error("timed out waiting for a message")]
    Timeout,

    #[error("execution context is already running")]
    AlreadyRunning,

    #[error("execution context was never started")]
    NotRunning,

    /// The execution context never produced a usable `InitConfig`.
    #[error("app failed to initialize: {0}")]
    AppInit(String),

    /// The execution context reported an explicit `Error` message.
    #[error("{error_type}: {message}")]
    AppProcess {
        error_type: String,
        message: String,
        traceback: String,
    },

    /// The execution unit could not be launched at all.
    #[error("failed to launch execution context: {0}")]
    Launch(#[source] std::io::Error),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("template error: {0}")]
    Template(String),

    #[error("unknown widget property {widget_id}.{property}")]
    UnknownTarget { widget_id: String, property: String },

    #[error("no live session '{0}'")]
    UnknownSession(String),
}

impl Error {
    /// Short kind name shown on error pages and in logs.
    pub fn kind(&self) -> &str {
        match self {
            Error::Timeout => "Timeout",
            Error::AlreadyRunning => "AlreadyRunning",
            Error::NotRunning => "NotRunning",
            Error::AppInit(_) => "AppInitError",
            Error::AppProcess { error_type, .. } => error_type,
            Error::Launch(_) => "LaunchError",
            Error::Codec(_) => "CodecError",
            Error::Template(_) => "TemplateError",
            Error::UnknownTarget { .. } => "UnknownTarget",
            Error::UnknownSession(_) => "UnknownSession",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
