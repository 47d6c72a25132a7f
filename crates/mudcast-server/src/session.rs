//! Logged-in sessions as channel receivers.
//!
//! A session turns channel lines and plain text into outbound frames on an
//! unbounded queue; the socket task drains the queue.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mudcast_core::{
    Channel, ChannelMessage, DeliveryError, Directory, EntityId, Receiver, ReceiverRef,
    SendContext,
};
use mudcast_protocol::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Longest accepted player name.
pub const MAX_NAME_LENGTH: usize = 32;

/// Login failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid name: {0}")]
    InvalidName(&'static str),

    #[error("Name already connected: {0}")]
    NameInUse(String),

    #[error("Server full")]
    Full,
}

/// Check a login name.
///
/// # Errors
///
/// Returns a reason if the name is empty, too long, or has characters other
/// than ASCII letters, digits, `_` and `-`.
pub fn validate_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty() {
        return Err(SessionError::InvalidName("name cannot be empty"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(SessionError::InvalidName("name too long"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SessionError::InvalidName("name has invalid characters"));
    }
    Ok(())
}

/// One logged-in player.
#[derive(Debug)]
pub struct Session {
    id: EntityId,
    outbox: mpsc::UnboundedSender<Frame>,
    online: AtomicBool,
}

impl Session {
    /// Create an online session that queues frames on `outbox`.
    #[must_use]
    pub fn new(id: EntityId, outbox: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id,
            outbox,
            online: AtomicBool::new(true),
        }
    }

    /// Queue a frame for the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket task is gone.
    pub fn push(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbox
            .send(frame)
            .map_err(|_| DeliveryError::Disconnected(self.id.clone()))
    }

    /// Mark the session gone. Later deliveries are refused.
    pub fn close(&self) {
        self.online.store(false, Ordering::SeqCst);
    }
}

impl Receiver for Session {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst) && !self.outbox.is_closed()
    }

    fn msg(&self, text: &str) -> Result<(), DeliveryError> {
        self.push(Frame::notice(text))
    }

    fn channel_msg(
        &self,
        message: &ChannelMessage,
        channel: &Channel,
        _ctx: &SendContext,
    ) -> Result<(), DeliveryError> {
        self.push(Frame::channel_line(channel.key(), message.render(channel)))
    }
}

/// Directory key for a login name. Names differing only in case collide.
fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// All logged-in sessions, keyed by case-folded name.
pub struct SessionDirectory {
    sessions: DashMap<String, Arc<Session>>,
    max_sessions: usize,
}

impl SessionDirectory {
    /// Create an empty directory holding at most `max_sessions`.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    /// Register a new session under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, taken in any letter case, or
    /// the server is full.
    pub fn claim(
        &self,
        name: &str,
        outbox: mpsc::UnboundedSender<Frame>,
    ) -> Result<Arc<Session>, SessionError> {
        validate_name(name)?;
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::Full);
        }

        match self.sessions.entry(fold(name)) {
            Entry::Occupied(_) => Err(SessionError::NameInUse(name.to_string())),
            Entry::Vacant(slot) => {
                let session = Arc::new(Session::new(EntityId::new(name), outbox));
                slot.insert(session.clone());
                debug!(session = %name, "Session claimed");
                Ok(session)
            }
        }
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub fn release(&self, id: &EntityId) -> bool {
        self.sessions
            .remove_if(&fold(id.as_str()), |_, session| session.id() == id)
            .is_some()
    }

    /// Identity for a name typed by a player: the logged-in spelling if one
    /// matches ignoring case, otherwise the name as given.
    #[must_use]
    pub fn resolve(&self, name: &str) -> EntityId {
        self.sessions
            .get(&fold(name))
            .map_or_else(|| EntityId::new(name), |entry| entry.value().id().clone())
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

impl Directory for SessionDirectory {
    fn connected(&self) -> Vec<ReceiverRef> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| entry.value().clone() as ReceiverRef)
            .collect()
    }
}
