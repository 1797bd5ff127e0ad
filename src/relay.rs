//! Relay between a session's execution context and its websocket clients.
//!
//! One outbound pump per session drains the from-execution channel and fans
//! messages out to the connections' outboxes, so no single connection can
//! starve the others by draining the shared channel. Inbound frames are
//! decoded per connection and tagged with the sender's client id.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::messages::Message;
use crate::session::Session;
use crate::utils::preview;

/// Drain the session's outbound channel until its stop signal is set.
pub async fn pump_outbound(session: Arc<Session>, poll: Duration, echo_to_origin: bool) {
    let comm = Arc::clone(session.comm());
    let mut death_reported = false;
    while !comm.stop_requested() {
        match comm.from_execution.receive_nowait() {
            Some(msg) => dispatch(&session, msg, echo_to_origin).await,
            None => {
                if !death_reported && !session.is_alive() {
                    death_reported = true;
                    error!(session_id = %session.id(), "execution context exited unexpectedly");
                    session.broadcast(&Message::SessionError, None).await;
                }
                tokio::time::sleep(poll).await;
            }
        }
    }
    debug!(session_id = %session.id(), "outbound pump stopped");
}

async fn dispatch(session: &Session, msg: Message, echo_to_origin: bool) {
    match msg {
        Message::WidgetUpdate(ref update) => {
            session.apply_update(update).await;
            let skip = if echo_to_origin {
                None
            } else {
                update.client_id.clone()
            };
            let sent = session.broadcast(&msg, skip.as_deref()).await;
            debug!(
                session_id = %session.id(),
                widget_id = %update.widget_id,
                property = %update.property,
                sent,
                "fan-out"
            );
        }
        Message::InitConfig(config) => {
            let target = config.client_id.clone();
            session.set_init_config(config.clone()).await;
            // Only a handshake reply is delivered; it goes to its requester.
            if let Some(client_id) = target {
                if !session.send_to(&client_id, &Message::InitConfig(config)).await {
                    debug!(session_id = %session.id(), %client_id, "handshake target gone");
                }
            }
        }
        Message::Error(err) => {
            error!(
                session_id = %session.id(),
                error_type = %err.error_type,
                traceback = %err.traceback,
                "app error: {}", err.message
            );
            session.broadcast(&Message::Error(err), None).await;
        }
        other => debug!(kind = other.kind(), "ignoring outbound message"),
    }
}

/// Decode one inbound frame and forward it to the execution context tagged
/// with `client_id`. Malformed frames are logged and dropped. Returns
/// whether anything was forwarded.
pub fn forward_inbound(session: &Session, client_id: &str, frame: &str) -> bool {
    let msg = match Message::decode(frame) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(
                session_id = %session.id(),
                client_id,
                "dropping malformed frame {:?}: {err}",
                preview(frame, 120)
            );
            return false;
        }
    };
    let tagged = match msg {
        Message::WidgetUpdate(mut update) => {
            update.client_id = Some(client_id.to_string());
            Message::WidgetUpdate(update)
        }
        // A client may only ask for its own state, and the reply goes back
        // to it alone.
        Message::GetWidgetStates { .. } | Message::GetState => Message::GetWidgetStates {
            client_id: client_id.to_string(),
        },
        other => {
            debug!(client_id, kind = other.kind(), "ignoring client message");
            return false;
        }
    };
    session.comm().to_execution.send(tagged);
    true
}
