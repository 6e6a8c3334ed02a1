//! Username registry and message log.
//!
//! The registry is owned by the router task and is never shared, so every
//! method runs to completion before the next event is looked at. Each
//! mutating method is one whole transition: no caller can observe a
//! half-registered user or a log entry that was never delivered.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::{
    envelope::{self, ChatMessage, ServerEnvelope},
    error::RelayError,
    session::{Session, SessionId},
};

/// Where relayed messages get their timestamp from.
pub type Clock = fn() -> i64;

#[derive(Debug)]
pub struct Registry {
    sessions: HashMap<SessionId, Session>,
    usernames: BTreeMap<String, SessionId>,
    log: Vec<ChatMessage>,
    clock: Clock,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_clock(envelope::unix_now)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            sessions: HashMap::new(),
            usernames: BTreeMap::new(),
            log: Vec::new(),
            clock,
        }
    }

    /// Tracks a freshly accepted, still unregistered connection.
    pub fn attach(&mut self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.usernames.contains_key(username)
    }

    /// Registered usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        self.usernames.keys().cloned().collect()
    }

    /// Every accepted message, oldest first.
    pub fn log(&self) -> &[ChatMessage] {
        &self.log
    }

    /// Logged messages addressed to `username` or to everyone, in log order.
    pub fn backlog_for(&self, username: &str) -> Vec<ChatMessage> {
        self.log
            .iter()
            .filter(|message| message.is_visible_to(username))
            .cloned()
            .collect()
    }

    /// Claims `username` for session `id`.
    ///
    /// Everyone already registered hears about the new user, then the new
    /// user gets the user list and its backlog.
    pub fn register(&mut self, id: SessionId, username: &str) -> Result<(), RelayError> {
        let Some(session) = self.sessions.get(&id) else {
            debug!(session = id, "registration from unknown session ignored");
            return Ok(());
        };
        if session.is_registered() {
            return Err(RelayError::AlreadyRegistered(session.username().to_string()));
        }
        if username.trim().is_empty() {
            return Err(RelayError::EmptyUsername);
        }
        if self.contains(username) {
            return Err(RelayError::UsernameTaken);
        }

        self.broadcast(&ServerEnvelope::joined(username), Some(id));
        self.usernames.insert(username.to_string(), id);

        let backlog = self.backlog_for(username);
        let users = self.usernames();
        if let Some(session) = self.sessions.get_mut(&id) {
            session.set_username(username.to_string());
            info!(session = id, peer = ?session.peer(), username, "user joined");
            session.send(&ServerEnvelope::accepted(users, backlog));
        }
        Ok(())
    }

    /// Validates, stamps, logs and delivers one message from session `id`.
    ///
    /// The client's timestamp is replaced with the registry clock, and the
    /// stamped copy is both logged and relayed. A message whose destination
    /// resolves to nobody is taken back out of the log before the error is
    /// returned.
    pub fn route(&mut self, id: SessionId, message: ChatMessage) -> Result<(), RelayError> {
        let Some(session) = self.sessions.get(&id) else {
            debug!(session = id, "message from unknown session ignored");
            return Ok(());
        };
        if !session.is_registered() {
            return Err(RelayError::NotRegistered);
        }
        if message.sender != session.username() {
            warn!(
                session = id,
                username = session.username(),
                claimed = %message.sender,
                "rejecting spoofed message"
            );
            return Err(RelayError::Spoofed);
        }

        let message = ChatMessage {
            timestamp: (self.clock)(),
            ..message
        };
        self.log.push(message.clone());

        if message.is_broadcast() {
            let delivered = self.broadcast(&ServerEnvelope::relay(message), None);
            debug!(session = id, delivered, "broadcast relayed");
            return Ok(());
        }

        match self.usernames.get(&message.destination) {
            Some(target) => {
                debug!(session = id, destination = %message.destination, "private message relayed");
                let target = *target;
                self.send_to(target, &ServerEnvelope::relay(message));
                Ok(())
            }
            None => {
                self.log.pop();
                Err(RelayError::UnknownDestination(message.destination))
            }
        }
    }

    /// Drops session `id`. If it was registered, its username is released
    /// and everyone left is told. Unknown ids are ignored, so a session can
    /// safely be removed twice.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        if session.is_registered() && self.usernames.get(session.username()) == Some(&id) {
            self.usernames.remove(session.username());
            info!(session = id, username = session.username(), "user left");
            self.broadcast(&ServerEnvelope::left(session.username()), None);
        }
        Some(session)
    }

    /// Sends `envelope` to every registered session except `except`.
    /// Returns how many sessions it was queued for.
    pub fn broadcast(&self, envelope: &ServerEnvelope, except: Option<SessionId>) -> usize {
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to encode broadcast");
                return 0;
            }
        };

        self.usernames
            .values()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.sessions.get(id))
            .filter(|session| session.deliver(frame.clone()))
            .count()
    }

    pub fn send_to(&self, id: SessionId, envelope: &ServerEnvelope) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|session| session.send(envelope))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::frame;

    const NOW: i64 = 1_800_000_000;

    fn stamped(registry: &mut Registry, id: SessionId, message: ChatMessage) -> ChatMessage {
        registry.route(id, message.clone()).expect("routed");
        ChatMessage {
            timestamp: NOW,
            ..message
        }
    }

    fn attach(registry: &mut Registry, id: SessionId) -> UnboundedReceiver<Bytes> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        registry.attach(Session::new(id, None, outbox));
        inbox
    }

    fn drain(inbox: &mut UnboundedReceiver<Bytes>) -> Vec<ServerEnvelope> {
        let mut envelopes = Vec::new();
        while let Ok(bytes) = inbox.try_recv() {
            let (payload, rest) = frame::decode(&bytes);
            assert!(rest.is_empty());
            let payload = payload.expect("complete frame");
            envelopes.push(ServerEnvelope::parse(payload).expect("valid envelope"));
        }
        envelopes
    }

    #[test]
    fn backlog_keeps_log_order_and_filters_by_destination() {
        let mut registry = Registry::with_clock(|| NOW);
        let _alice = attach(&mut registry, 1);
        let _bob = attach(&mut registry, 2);
        registry.register(1, "alice").expect("alice");
        registry.register(2, "bob").expect("bob");

        let m1 = stamped(&mut registry, 1, ChatMessage::new("alice", "ALL", 1, "hi all"));
        let m2 = stamped(&mut registry, 1, ChatMessage::new("alice", "bob", 2, "hi bob"));
        let m3 = stamped(&mut registry, 2, ChatMessage::new("bob", "alice", 3, "hi alice"));

        assert_eq!(registry.backlog_for("bob"), vec![m1.clone(), m2]);
        assert_eq!(registry.backlog_for("carol"), vec![m1.clone()]);
        assert_eq!(registry.backlog_for("alice"), vec![m1, m3]);
    }

    #[test]
    fn relayed_and_logged_copies_carry_the_registry_clock() {
        let mut registry = Registry::with_clock(|| NOW);
        let mut alice = attach(&mut registry, 1);
        let mut bob = attach(&mut registry, 2);
        registry.register(1, "alice").expect("alice");
        registry.register(2, "bob").expect("bob");
        drain(&mut alice);
        drain(&mut bob);

        registry
            .route(1, ChatMessage::new("alice", "bob", 42, "what time is it"))
            .expect("routed");

        let expected = ChatMessage::new("alice", "bob", NOW, "what time is it");
        assert_eq!(registry.log(), &[expected.clone()]);
        assert_eq!(drain(&mut bob), vec![ServerEnvelope::relay(expected)]);
    }

    #[test]
    fn default_clock_is_wall_time() {
        let mut registry = Registry::new();
        let _alice = attach(&mut registry, 1);
        registry.register(1, "alice").expect("alice");

        let before = envelope::unix_now();
        registry
            .route(1, ChatMessage::new("alice", "ALL", 0, "now"))
            .expect("routed");
        let after = envelope::unix_now();

        let timestamp = registry.log()[0].timestamp;
        assert!((before..=after).contains(&timestamp));
    }

    #[test]
    fn unknown_destination_is_rolled_back() {
        let mut registry = Registry::new();
        let mut alice = attach(&mut registry, 1);
        registry.register(1, "alice").expect("alice");
        drain(&mut alice);

        let result = registry.route(1, ChatMessage::new("alice", "dave", 1, "anyone?"));
        assert_eq!(result, Err(RelayError::UnknownDestination("dave".into())));
        assert!(registry.log().is_empty());
        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn spoofed_sender_is_neither_logged_nor_delivered() {
        let mut registry = Registry::new();
        let mut alice = attach(&mut registry, 1);
        let mut bob = attach(&mut registry, 2);
        registry.register(1, "alice").expect("alice");
        registry.register(2, "bob").expect("bob");
        drain(&mut alice);
        drain(&mut bob);

        let result = registry.route(2, ChatMessage::new("alice", "ALL", 1, "it's me"));
        assert_eq!(result, Err(RelayError::Spoofed));
        assert!(registry.log().is_empty());
        assert!(drain(&mut alice).is_empty());
        assert!(drain(&mut bob).is_empty());
    }

    #[test]
    fn remove_is_idempotent_and_releases_username() {
        let mut registry = Registry::new();
        let _alice = attach(&mut registry, 1);
        let mut bob = attach(&mut registry, 2);
        registry.register(1, "alice").expect("alice");
        registry.register(2, "bob").expect("bob");
        drain(&mut bob);

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(!registry.contains("alice"));
        assert_eq!(drain(&mut bob), vec![ServerEnvelope::left("alice")]);

        let _again = attach(&mut registry, 3);
        assert!(registry.register(3, "alice").is_ok());
    }

    #[test]
    fn removing_unregistered_session_is_silent() {
        let mut registry = Registry::new();
        let mut alice = attach(&mut registry, 1);
        let _lurker = attach(&mut registry, 2);
        registry.register(1, "alice").expect("alice");
        drain(&mut alice);

        assert!(registry.remove(2).is_some());
        assert!(drain(&mut alice).is_empty());
        assert_eq!(registry.usernames(), vec!["alice".to_string()]);
    }

    #[test]
    fn broadcast_skips_unregistered_and_excluded_sessions() {
        let mut registry = Registry::new();
        let mut alice = attach(&mut registry, 1);
        let mut bob = attach(&mut registry, 2);
        let mut lurker = attach(&mut registry, 3);
        registry.register(1, "alice").expect("alice");
        registry.register(2, "bob").expect("bob");
        drain(&mut alice);
        drain(&mut bob);

        let sent = registry.broadcast(&ServerEnvelope::error("notice"), Some(2));
        assert_eq!(sent, 1);
        assert_eq!(drain(&mut alice), vec![ServerEnvelope::error("notice")]);
        assert!(drain(&mut bob).is_empty());
        assert!(drain(&mut lurker).is_empty());
    }
}
