//! Entities that can receive channel messages and presence notices.
//!
//! The engines never own entities. The hosting game keeps them alive and hands
//! the core `Arc` handles (or `Weak` ones, for channel subscriptions).

use crate::channel::Channel;
use crate::message::{ChannelMessage, SendContext};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity of an entity (the character or account key).
///
/// Comparisons are exact; two handles with the same id are the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Create a new entity ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Errors raised by a receiver while handling a message.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The receiver's connection went away.
    #[error("Receiver disconnected: {0}")]
    Disconnected(EntityId),

    /// The receiver refused the message.
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Anything that can receive channel messages and plain text.
///
/// The three channel hooks run in order for every delivery:
/// [`at_pre_channel_msg`](Receiver::at_pre_channel_msg) may rewrite or drop the
/// message for this receiver, [`channel_msg`](Receiver::channel_msg) hands it
/// over, and [`at_post_channel_msg`](Receiver::at_post_channel_msg) runs after.
pub trait Receiver: Send + Sync {
    /// The entity's identity.
    fn id(&self) -> &EntityId;

    /// Name shown to other players.
    fn display_name(&self) -> &str {
        self.id().as_str()
    }

    /// Whether the entity currently has a live session.
    fn is_connected(&self) -> bool;

    /// Send plain text to the entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the text could not be handed to the session.
    fn msg(&self, text: &str) -> Result<(), DeliveryError>;

    /// Per-receiver transform. Returning `Ok(None)` (or an empty message)
    /// skips this receiver without counting as a failure.
    ///
    /// # Errors
    ///
    /// Errors are logged by the router and only affect this receiver.
    fn at_pre_channel_msg(
        &self,
        message: ChannelMessage,
        _channel: &Channel,
        _ctx: &SendContext,
    ) -> Result<Option<ChannelMessage>, DeliveryError> {
        Ok(Some(message))
    }

    /// Channel-message intake point.
    ///
    /// # Errors
    ///
    /// Errors are logged by the router and only affect this receiver.
    fn channel_msg(
        &self,
        message: &ChannelMessage,
        channel: &Channel,
        _ctx: &SendContext,
    ) -> Result<(), DeliveryError> {
        self.msg(&message.render(channel))
    }

    /// Runs after a successful [`channel_msg`](Receiver::channel_msg).
    ///
    /// # Errors
    ///
    /// Errors are logged by the router and only affect this receiver.
    fn at_post_channel_msg(
        &self,
        _message: &ChannelMessage,
        _channel: &Channel,
        _ctx: &SendContext,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Shared handle to a receiver.
pub type ReceiverRef = Arc<dyn Receiver>;

/// Source of the currently connected entities.
pub trait Directory: Send + Sync {
    /// Snapshot of every connected entity at call time.
    fn connected(&self) -> Vec<ReceiverRef>;
}

impl Directory for Vec<ReceiverRef> {
    fn connected(&self) -> Vec<ReceiverRef> {
        self.iter()
            .filter(|r| r.is_connected())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_entity_id_from_str() {
        let id: EntityId = "Alice".into();
        assert_eq!(id.as_str(), "Alice");
        assert_eq!(id.to_string(), "Alice");
    }

    #[test]
    fn test_entity_id_borrow_lookup() {
        let mut ids = HashSet::new();
        ids.insert(EntityId::new("Bob"));
        assert!(ids.contains("Bob"));
        assert!(!ids.contains("bob"));
    }
}
