//! Channel abstraction for mudcast.
//!
//! A channel is a named broadcast group. It holds non-owning references to its
//! subscribers, a mute set keyed by entity identity, and the access rules the
//! default policy checks.

use crate::entity::{EntityId, Receiver, ReceiverRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 64;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel key or alias.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err("Channel name contains invalid characters");
    }
    if name.trim() != name {
        return Err("Channel name cannot start or end with whitespace");
    }
    Ok(())
}

/// Actions an entity may perform on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Receive messages.
    Listen,
    /// Send messages.
    Send,
    /// Administer the channel.
    Control,
}

impl Capability {
    /// Lock name of the capability.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Listen => "listen",
            Capability::Send => "send",
            Capability::Control => "control",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a single capability is granted to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "ids", rename_all = "lowercase")]
pub enum AccessRule {
    /// Everyone.
    #[default]
    All,
    /// No one.
    Nobody,
    /// Only the listed entities.
    Only(BTreeSet<EntityId>),
    /// Everyone except the listed entities.
    Except(BTreeSet<EntityId>),
}

impl AccessRule {
    /// Check whether the rule grants access to `id`.
    #[must_use]
    pub fn allows(&self, id: &EntityId) -> bool {
        match self {
            AccessRule::All => true,
            AccessRule::Nobody => false,
            AccessRule::Only(ids) => ids.contains(id),
            AccessRule::Except(ids) => !ids.contains(id),
        }
    }
}

/// Per-capability access rules of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLocks {
    #[serde(default)]
    pub listen: AccessRule,
    #[serde(default)]
    pub send: AccessRule,
    #[serde(default)]
    pub control: AccessRule,
}

impl ChannelLocks {
    /// Replace the rule for one capability.
    #[must_use]
    pub fn with(mut self, capability: Capability, rule: AccessRule) -> Self {
        match capability {
            Capability::Listen => self.listen = rule,
            Capability::Send => self.send = rule,
            Capability::Control => self.control = rule,
        }
        self
    }

    /// Get the rule for one capability.
    #[must_use]
    pub fn rule(&self, capability: Capability) -> &AccessRule {
        match capability {
            Capability::Listen => &self.listen,
            Capability::Send => &self.send,
            Capability::Control => &self.control,
        }
    }

    /// Check whether `id` holds `capability`.
    #[must_use]
    pub fn allows(&self, id: &EntityId, capability: Capability) -> bool {
        self.rule(capability).allows(id)
    }
}

/// Capability check consulted by the router and the registry.
pub trait AccessPolicy: Send + Sync {
    /// Whether `entity` may perform `capability` on `channel`.
    fn has_capability(
        &self,
        entity: &dyn Receiver,
        channel: &Channel,
        capability: Capability,
    ) -> bool;
}

/// Policy that evaluates the channel's own [`ChannelLocks`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LockPolicy;

impl AccessPolicy for LockPolicy {
    fn has_capability(
        &self,
        entity: &dyn Receiver,
        channel: &Channel,
        capability: Capability,
    ) -> bool {
        channel.locks().allows(entity.id(), capability)
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(&dyn Receiver, &Channel, Capability) -> bool + Send + Sync,
{
    fn has_capability(
        &self,
        entity: &dyn Receiver,
        channel: &Channel,
        capability: Capability,
    ) -> bool {
        self(entity, channel, capability)
    }
}

/// One subscription record.
#[derive(Clone)]
struct Subscription {
    id: EntityId,
    receiver: Weak<dyn Receiver>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("alive", &(self.receiver.strong_count() > 0))
            .finish()
    }
}

/// A broadcast channel.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel key, as created.
    key: ChannelId,
    /// Lowercased aliases.
    aliases: BTreeSet<String>,
    /// Free-text description.
    description: String,
    /// Subscriptions in the order they were made.
    subscriptions: Vec<Subscription>,
    /// Muted subscriber identities.
    muted: HashSet<EntityId>,
    /// Deliver only to connected subscribers.
    online_only: bool,
    /// Access rules.
    locks: ChannelLocks,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(key: impl Into<ChannelId>) -> Self {
        Self {
            key: key.into(),
            aliases: BTreeSet::new(),
            description: String::new(),
            subscriptions: Vec::new(),
            muted: HashSet::new(),
            online_only: true,
            locks: ChannelLocks::default(),
        }
    }

    /// Add aliases.
    #[must_use]
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.aliases
            .extend(aliases.into_iter().map(|a| a.as_ref().to_lowercase()));
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set whether only connected subscribers receive messages.
    #[must_use]
    pub fn with_online_only(mut self, online_only: bool) -> Self {
        self.online_only = online_only;
        self
    }

    /// Set the access rules.
    #[must_use]
    pub fn with_locks(mut self, locks: ChannelLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Get the channel key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the aliases (lowercased).
    #[must_use]
    pub fn aliases(&self) -> &BTreeSet<String> {
        &self.aliases
    }

    /// Get the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether delivery is limited to connected subscribers.
    #[must_use]
    pub fn is_online_only(&self) -> bool {
        self.online_only
    }

    /// Get the access rules.
    #[must_use]
    pub fn locks(&self) -> &ChannelLocks {
        &self.locks
    }

    /// Replace the access rules.
    pub fn set_locks(&mut self, locks: ChannelLocks) {
        self.locks = locks;
    }

    /// Case-insensitive match against the key and aliases.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.key.to_lowercase() == lower || self.aliases.contains(&lower)
    }

    /// Prefix put in front of rendered messages.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("[{}] ", self.key)
    }

    /// Get the number of subscription records.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Check if an entity is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, id: &EntityId) -> bool {
        self.subscriptions.iter().any(|s| &s.id == id)
    }

    /// Check if the channel has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Subscribe an entity.
    ///
    /// Returns `false` if an entity with the same identity is already
    /// subscribed.
    pub fn subscribe(&mut self, receiver: &ReceiverRef) -> bool {
        let id = receiver.id().clone();
        if self.is_subscribed(&id) {
            return false;
        }
        debug!(channel = %self.key, entity = %id, "Entity subscribed");
        self.subscriptions.push(Subscription {
            id,
            receiver: Arc::downgrade(receiver),
        });
        true
    }

    /// Unsubscribe an entity. Its mute entry goes with it.
    ///
    /// Returns `true` if the entity was subscribed.
    pub fn unsubscribe(&mut self, id: &EntityId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| &s.id != id);
        let removed = self.subscriptions.len() != before;
        if removed {
            self.muted.remove(id);
            debug!(channel = %self.key, entity = %id, "Entity unsubscribed");
        }
        removed
    }

    /// Drop subscriptions whose entity no longer exists.
    ///
    /// Returns the number of records removed.
    pub fn prune(&mut self) -> usize {
        let before = self.subscriptions.len();
        let muted = &mut self.muted;
        self.subscriptions.retain(|s| {
            let alive = s.receiver.strong_count() > 0;
            if !alive {
                muted.remove(&s.id);
            }
            alive
        });
        before - self.subscriptions.len()
    }

    /// Mute the channel for a subscriber.
    ///
    /// Returns `false` if the entity is not subscribed or already muted.
    pub fn mute(&mut self, id: &EntityId) -> bool {
        if !self.is_subscribed(id) {
            return false;
        }
        self.muted.insert(id.clone())
    }

    /// Unmute the channel for a subscriber.
    ///
    /// Returns `true` if the entity was muted.
    pub fn unmute(&mut self, id: &EntityId) -> bool {
        self.muted.remove(id)
    }

    /// Check if an entity has muted the channel.
    #[must_use]
    pub fn is_muted(&self, id: &EntityId) -> bool {
        self.muted.contains(id)
    }

    /// Identities of every subscription record.
    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<EntityId> {
        self.subscriptions.iter().map(|s| s.id.clone()).collect()
    }

    /// Live subscribers, in subscription order.
    #[must_use]
    pub fn subscribers(&self) -> Vec<ReceiverRef> {
        self.subscriptions
            .iter()
            .filter_map(|s| s.receiver.upgrade())
            .collect()
    }

    /// Subscribers eligible for delivery before mute and capability
    /// filtering: connected ones for online-only channels, else all.
    #[must_use]
    pub fn candidates(&self) -> Vec<ReceiverRef> {
        let subscribers = self.subscribers();
        if self.online_only {
            subscribers.into_iter().filter(|r| r.is_connected()).collect()
        } else {
            subscribers
        }
    }
}
