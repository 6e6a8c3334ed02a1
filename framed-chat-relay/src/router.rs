//! The single task that owns the [`Registry`].
//!
//! Connection tasks never touch shared state. They report what happened on
//! their socket as [`Event`]s and the router applies them one at a time, so
//! registry and log updates are serialized without a lock.

use std::{net::SocketAddr, ops::ControlFlow};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    envelope::{ClientEnvelope, ServerEnvelope},
    error::RelayError,
    registry::Registry,
    session::{Outbox, Session, SessionId},
};

#[derive(Debug)]
pub enum Event {
    Connected {
        id: SessionId,
        peer: Option<SocketAddr>,
        outbox: Outbox,
    },
    Frame {
        id: SessionId,
        payload: Bytes,
    },
    Disconnected {
        id: SessionId,
        error: Option<String>,
    },
    /// Tells every registered user the server is going away, then stops.
    Shutdown,
}

#[derive(Debug, Default)]
pub struct Router {
    registry: Registry,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Applies events until the channel closes or a shutdown arrives.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }
        debug!("router stopped");
    }

    pub fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Connected { id, peer, outbox } => {
                debug!(session = id, ?peer, "session attached");
                self.registry.attach(Session::new(id, peer, outbox));
            }
            Event::Frame { id, payload } => self.handle_frame(id, &payload),
            Event::Disconnected { id, error } => self.handle_disconnect(id, error.as_deref()),
            Event::Shutdown => {
                info!("router shutting down");
                self.registry
                    .broadcast(&ServerEnvelope::error("server shutting down"), None);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Interprets one complete frame from session `id`.
    ///
    /// A payload that is not JSON closes the session. JSON of the wrong shape
    /// only earns an error reply.
    pub fn handle_frame(&mut self, id: SessionId, payload: &[u8]) {
        let envelope = match ClientEnvelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(session = id, %error, "closing session after protocol error");
                self.registry.remove(id);
                return;
            }
        };

        match envelope {
            Some(ClientEnvelope::Register { username }) => {
                if let Err(error) = self.registry.register(id, &username) {
                    self.reject(id, error);
                }
            }
            Some(ClientEnvelope::Batch { messages }) => {
                for message in messages {
                    if let Err(error) = self.registry.route(id, message) {
                        self.reject(id, error);
                    }
                }
            }
            None => self.reject(id, RelayError::Malformed),
        }
    }

    pub fn handle_disconnect(&mut self, id: SessionId, error: Option<&str>) {
        match (self.registry.remove(id), error) {
            (Some(session), Some(error)) => {
                info!(session = id, peer = ?session.peer(), error, "connection failed")
            }
            (Some(session), None) => info!(session = id, peer = ?session.peer(), "connection closed"),
            (None, _) => debug!(session = id, "disconnect for session already removed"),
        }
    }

    fn reject(&self, id: SessionId, error: RelayError) {
        debug!(session = id, %error, "request rejected");
        let reply = if error.is_registration_rejection() {
            ServerEnvelope::rejected(error.to_string())
        } else {
            ServerEnvelope::error(error.to_string())
        };
        self.registry.send_to(id, &reply);
    }
}
