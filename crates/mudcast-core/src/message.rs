//! Channel message and send-context types.

use crate::channel::Channel;
use crate::entity::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    (now_nanos() as u64).wrapping_add(counter)
}

/// A message sent to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Unique message identifier.
    pub id: MessageId,
    /// Message body.
    pub text: String,
    /// Entities the message is sent on behalf of.
    pub senders: Vec<EntityId>,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: u64,
}

impl ChannelMessage {
    /// Create a new message with no senders.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            text: text.into(),
            senders: Vec::new(),
            timestamp: (now_nanos() / 1_000_000) as u64,
        }
    }

    /// Add a sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<EntityId>) -> Self {
        self.senders.push(sender.into());
        self
    }

    /// Replace the body, keeping id, senders, and timestamp.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// A message with a blank body counts as "nothing to send".
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Format the message the way a player sees it on `channel`.
    #[must_use]
    pub fn render(&self, channel: &Channel) -> String {
        if self.senders.is_empty() {
            return format!("{}{}", channel.prefix(), self.text);
        }
        let names: Vec<&str> = self.senders.iter().map(EntityId::as_str).collect();
        format!("{}{}: {}", channel.prefix(), names.join(", "), self.text)
    }
}

/// Context passed along every hook of one send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendContext {
    /// Entities sending the message.
    pub senders: Vec<EntityId>,
    /// Deliver to muted subscribers too.
    pub bypass_mute: bool,
    /// Extra options for hooks.
    pub options: Map<String, Value>,
}

impl SendContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<EntityId>) -> Self {
        self.senders.push(sender.into());
        self
    }

    /// Set whether mutes are ignored.
    #[must_use]
    pub fn bypass_mute(mut self, bypass: bool) -> Self {
        self.bypass_mute = bypass;
        self
    }

    /// Attach an extra option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up an extra option.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = ChannelMessage::new("hello");
        assert_eq!(msg.text, "hello");
        assert!(msg.senders.is_empty());
        assert!(!msg.is_empty());
    }

    #[test]
    fn test_blank_message_is_empty() {
        assert!(ChannelMessage::new("").is_empty());
        assert!(ChannelMessage::new("   \n").is_empty());
    }

    #[test]
    fn test_render_with_and_without_sender() {
        let channel = Channel::new("Public");
        let msg = ChannelMessage::new("hi all");
        assert_eq!(msg.render(&channel), "[Public] hi all");

        let msg = msg.with_sender("Alice");
        assert_eq!(msg.render(&channel), "[Public] Alice: hi all");
    }

    #[test]
    fn test_with_text_keeps_identity() {
        let msg = ChannelMessage::new("one").with_sender("Alice");
        let id = msg.id;
        let msg = msg.with_text("two");
        assert_eq!(msg.id, id);
        assert_eq!(msg.text, "two");
        assert_eq!(msg.senders, vec![EntityId::new("Alice")]);
    }

    #[test]
    fn test_context_options() {
        let ctx = SendContext::new()
            .with_sender("Alice")
            .bypass_mute(true)
            .with_option("emote", true);
        assert!(ctx.bypass_mute);
        assert_eq!(ctx.option("emote"), Some(&Value::Bool(true)));
        assert!(ctx.option("missing").is_none());
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
    }
}
