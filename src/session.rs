//! Session registry: one execution context per session id, shared by every
//! browser connection of that session.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::app::{self, LaunchSpec};
use crate::channel::CommunicationManager;
use crate::error::{Error, Result};
use crate::execution::{ExecutionManager, ExecutionMode, ExecutionSettings};
use crate::messages::{InitConfig, Message, WidgetUpdate};
use crate::relay;
use crate::widgets::WidgetDescription;

/// Encoded frames queued for one websocket connection. Bounded: a client
/// that lets it fill up is disconnected.
pub type Outbox = mpsc::Sender<String>;

struct Connection {
    token: u64,
    outbox: Outbox,
}

pub struct Session {
    id: String,
    mode: ExecutionMode,
    comm: Arc<CommunicationManager>,
    execution: Mutex<Box<dyn ExecutionManager>>,
    init_config: RwLock<InitConfig>,
    connections: RwLock<HashMap<String, Connection>>,
    next_token: AtomicU64,
    ever_connected: AtomicBool,
    created: Instant,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub connections: usize,
    pub execution_mode: String,
    pub alive: bool,
    pub created_at: String,
}

impl Session {
    fn new(
        id: String,
        mode: ExecutionMode,
        execution: Box<dyn ExecutionManager>,
        init_config: InitConfig,
    ) -> Self {
        Self {
            id,
            mode,
            comm: execution.communication(),
            execution: Mutex::new(execution),
            init_config: RwLock::new(init_config),
            connections: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            ever_connected: AtomicBool::new(false),
            created: Instant::now(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn comm(&self) -> &Arc<CommunicationManager> {
        &self.comm
    }

    /// Latest widget configuration reported by the app.
    pub async fn init_config(&self) -> InitConfig {
        self.init_config.read().await.clone()
    }

    pub(crate) async fn set_init_config(&self, mut config: InitConfig) {
        config.client_id = None;
        *self.init_config.write().await = config;
    }

    /// Mirror a property change reported by the app into the cached
    /// configuration. Properties the browser never sees are not cached.
    pub(crate) async fn apply_update(&self, update: &WidgetUpdate) {
        let mut config = self.init_config.write().await;
        if let Some(value) = config
            .widget_configs
            .get_mut(&update.widget_id)
            .and_then(|w| w.defaults.get_mut(&update.property))
        {
            *value = update.value.clone();
        }
    }

    /// Last known value of a browser-visible property.
    pub async fn trait_value(&self, widget_id: &str, property: &str) -> Result<Value> {
        self.init_config
            .read()
            .await
            .widget_configs
            .get(widget_id)
            .and_then(|w| w.defaults.get(property))
            .cloned()
            .ok_or_else(|| Error::UnknownTarget {
                widget_id: widget_id.to_string(),
                property: property.to_string(),
            })
    }

    /// Queue a property change for the app. It is applied like a change
    /// from a client with no connection, so every connection sees the echo.
    pub async fn set_trait(&self, widget_id: &str, property: &str, value: Value) -> Result<()> {
        self.trait_value(widget_id, property).await?;
        self.comm
            .to_execution
            .send(Message::widget_update(widget_id, property, value));
        Ok(())
    }

    /// Whether the execution unit is still running. A manager that is busy
    /// being stopped counts as alive; callers never block on it.
    pub fn is_alive(&self) -> bool {
        match self.execution.try_lock() {
            Some(mut execution) => execution.is_alive(),
            None => true,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Register a connection. A reconnect under the same client id replaces
    /// the old outbox; the returned token identifies this attachment.
    async fn attach(&self, client_id: &str, outbox: Outbox) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.ever_connected.store(true, Ordering::Relaxed);
        self.connections
            .write()
            .await
            .insert(client_id.to_string(), Connection { token, outbox });
        token
    }

    /// Remove a connection if `token` still owns it. Returns true when no
    /// connections remain.
    async fn detach(&self, client_id: &str, token: u64) -> bool {
        let mut connections = self.connections.write().await;
        if connections.get(client_id).is_some_and(|c| c.token == token) {
            connections.remove(client_id);
        }
        connections.is_empty()
    }

    /// Queue `msg` for every attached connection except `skip`. Returns the
    /// number of connections it was queued for.
    pub async fn broadcast(&self, msg: &Message, skip: Option<&str>) -> usize {
        let Ok(text) = msg.encode() else {
            warn!(session_id = %self.id, kind = msg.kind(), "failed to encode broadcast");
            return 0;
        };
        let mut sent = 0;
        let mut lagging = Vec::new();
        {
            let connections = self.connections.read().await;
            for (client_id, conn) in connections.iter() {
                if Some(client_id.as_str()) == skip {
                    continue;
                }
                match conn.outbox.try_send(text.clone()) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(_)) => lagging.push((client_id.clone(), conn.token)),
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
        self.drop_lagging(lagging).await;
        sent
    }

    /// Queue `msg` for a single connection.
    pub async fn send_to(&self, client_id: &str, msg: &Message) -> bool {
        let Ok(text) = msg.encode() else {
            return false;
        };
        let outcome = {
            let connections = self.connections.read().await;
            connections
                .get(client_id)
                .map(|conn| (conn.token, conn.outbox.try_send(text)))
        };
        match outcome {
            Some((_, Ok(()))) => true,
            Some((token, Err(TrySendError::Full(_)))) => {
                self.drop_lagging(vec![(client_id.to_string(), token)]).await;
                false
            }
            _ => false,
        }
    }

    /// Disconnect clients whose outbox is full. Dropping the outbox ends
    /// the connection's send loop once it drains what is already queued.
    async fn drop_lagging(&self, lagging: Vec<(String, u64)>) {
        if lagging.is_empty() {
            return;
        }
        let mut connections = self.connections.write().await;
        for (client_id, token) in lagging {
            if connections.get(&client_id).is_some_and(|c| c.token == token) {
                connections.remove(&client_id);
                warn!(session_id = %self.id, %client_id, "outbox full, disconnecting slow client");
            }
        }
    }

    /// Stop and join the execution context. Blocking.
    fn shutdown(&self) {
        self.comm.request_stop();
        let mut execution = self.execution.lock();
        if let Err(err) = execution.stop() {
            debug!(session_id = %self.id, "stop: {err}");
        }
        if let Err(err) = execution.join() {
            debug!(session_id = %self.id, "join: {err}");
        }
        info!(session_id = %self.id, "session torn down");
    }

    async fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            connections: self.connection_count().await,
            execution_mode: self.mode.to_string(),
            alive: self.is_alive(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Owns every live session. Created once by the server and shared with the
/// request handlers.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    settings: ExecutionSettings,
    init_timeout: Duration,
    echo_to_origin: bool,
}

impl SessionRegistry {
    pub fn new(settings: ExecutionSettings, init_timeout: Duration, echo_to_origin: bool) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            init_timeout,
            echo_to_origin,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    pub fn mode(&self) -> ExecutionMode {
        self.settings.mode
    }

    /// Frames a connection may have queued before it counts as stalled.
    pub fn outbox_capacity(&self) -> usize {
        self.settings.channel_capacity.max(1)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Return the live session for `session_id`, creating it if needed.
    /// Creation blocks until the app reports its configuration, reports an
    /// error, exits, or the init timeout elapses.
    pub async fn get_or_create(&self, session_id: &str, launch: &LaunchSpec) -> Result<Arc<Session>> {
        if let Some(session) = self.get(session_id).await {
            if session.is_alive() {
                return Ok(session);
            }
            warn!(session_id, "execution context died, replacing session");
            self.remove(session_id).await;
        }

        let execution = self.settings.build(session_id);
        let launch = launch.clone();
        let timeout = self.init_timeout;
        let poll = self.settings.poll_interval;
        let (execution, config) =
            tokio::task::spawn_blocking(move || handshake(execution, &launch, timeout, poll))
                .await
                .map_err(|e| Error::AppInit(format!("startup task failed: {e}")))??;

        let session = Arc::new(Session::new(
            session_id.to_string(),
            self.settings.mode,
            execution,
            config,
        ));
        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(session_id).cloned() {
                drop(sessions);
                debug!(session_id, "lost creation race, discarding duplicate");
                teardown(session).await;
                return Ok(existing);
            }
            sessions.insert(session_id.to_string(), Arc::clone(&session));
        }

        tokio::spawn(relay::pump_outbound(
            Arc::clone(&session),
            self.settings.poll_interval,
            self.echo_to_origin,
        ));
        info!(session_id, mode = %self.settings.mode, "session created");
        Ok(session)
    }

    /// Describe the widgets `launch` builds, without starting a session.
    pub async fn describe_widgets(
        &self,
        launch: &LaunchSpec,
    ) -> Result<BTreeMap<String, WidgetDescription>> {
        let catalog = Arc::clone(&self.settings.catalog);
        let launch = launch.clone();
        tokio::task::spawn_blocking(move || app::describe_app(&catalog, &launch))
            .await
            .map_err(|e| Error::AppInit(format!("describe task failed: {e}")))?
    }

    async fn live(&self, session_id: &str) -> Result<Arc<Session>> {
        self.get(session_id)
            .await
            .filter(|s| s.is_alive())
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))
    }

    pub async fn get_trait(&self, session_id: &str, widget_id: &str, property: &str) -> Result<Value> {
        self.live(session_id).await?.trait_value(widget_id, property).await
    }

    pub async fn set_trait(
        &self,
        session_id: &str,
        widget_id: &str,
        property: &str,
        value: Value,
    ) -> Result<()> {
        self.live(session_id)
            .await?
            .set_trait(widget_id, property, value)
            .await
    }

    /// Attach a connection to an existing session.
    pub async fn attach(
        &self,
        session_id: &str,
        client_id: &str,
        outbox: Outbox,
    ) -> Option<(Arc<Session>, u64)> {
        // Holding the map lock keeps a concurrent teardown from evicting
        // the session between lookup and insert.
        let sessions = self.sessions.read().await;
        let session = Arc::clone(sessions.get(session_id)?);
        let token = session.attach(client_id, outbox).await;
        info!(session_id, client_id, "client attached");
        Some((session, token))
    }

    /// Detach a connection; the last one out tears the session down.
    pub async fn detach(&self, session: &Arc<Session>, client_id: &str, token: u64) {
        info!(session_id = %session.id, client_id, "client detached");
        if session.detach(client_id, token).await {
            self.remove_if_unused(session).await;
        }
    }

    async fn remove_if_unused(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            // The id may already belong to a replacement session.
            let unused = match sessions.get(&session.id) {
                Some(s) if Arc::ptr_eq(s, session) => s.connections.read().await.is_empty(),
                _ => false,
            };
            if unused {
                sessions.remove(&session.id)
            } else {
                None
            }
        };
        if let Some(session) = removed {
            teardown(session).await;
        }
    }

    /// Evict a session unconditionally and tear it down.
    pub async fn remove(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed {
            teardown(session).await;
        }
    }

    /// Tear down sessions that never got a connection within `max_idle`.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let mut ids = Vec::new();
            for (id, s) in sessions.iter() {
                if !s.ever_connected.load(Ordering::Relaxed)
                    && s.created.elapsed() >= max_idle
                    && s.connections.read().await.is_empty()
                {
                    ids.push(id.clone());
                }
            }
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        let count = stale.len();
        for session in stale {
            info!(session_id = %session.id, "reaping session that was never connected");
            teardown(session).await;
        }
        count
    }

    pub async fn stats(&self) -> Vec<SessionStats> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(sessions.len());
        for session in sessions {
            stats.push(session.stats().await);
        }
        stats.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        stats
    }

    /// Tear down every session; used on server shutdown.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        futures::future::join_all(sessions.into_iter().map(teardown)).await;
    }
}

async fn teardown(session: Arc<Session>) {
    let id = session.id.clone();
    if tokio::task::spawn_blocking(move || session.shutdown())
        .await
        .is_err()
    {
        warn!(session_id = %id, "teardown task panicked");
    }
}

/// Start the execution context and wait for its first message.
fn handshake(
    mut execution: Box<dyn ExecutionManager>,
    launch: &LaunchSpec,
    timeout: Duration,
    poll: Duration,
) -> Result<(Box<dyn ExecutionManager>, InitConfig)> {
    execution.start(launch)?;
    let comm = execution.communication();
    let deadline = Instant::now() + timeout;
    let mut exit_seen = false;

    let outcome = loop {
        if Instant::now() >= deadline {
            break Err(Error::AppInit(format!(
                "no configuration received within {}ms",
                timeout.as_millis()
            )));
        }
        match comm.from_execution.receive(poll) {
            Ok(Message::InitConfig(config)) => break Ok(config),
            Ok(Message::Error(err)) => {
                break Err(Error::AppProcess {
                    error_type: err.error_type,
                    message: err.message,
                    traceback: err.traceback,
                })
            }
            Ok(other) => debug!(kind = other.kind(), "ignoring message before init"),
            Err(_) if !execution.is_alive() => {
                // One more poll lets output already in flight arrive.
                if exit_seen && comm.from_execution.is_empty() {
                    break Err(Error::AppInit(
                        "execution context exited before reporting its configuration".to_string(),
                    ));
                }
                exit_seen = true;
            }
            Err(_) => {}
        }
    };

    match outcome {
        Ok(config) => Ok((execution, config)),
        Err(err) => {
            let _ = execution.stop();
            let _ = execution.join();
            Err(err)
        }
    }
}
