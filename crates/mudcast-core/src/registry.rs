//! Channel registry for mudcast.
//!
//! The registry owns every channel, resolves names and aliases, manages
//! subscriptions and mutes, and hands sends to the [`BroadcastRouter`].

use crate::channel::{validate_channel_name, Capability, Channel, ChannelId};
use crate::entity::{EntityId, Receiver, ReceiverRef};
use crate::message::{ChannelMessage, SendContext};
use crate::router::{BroadcastRouter, RouteReport};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Channel not found.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// A channel already uses the key or alias.
    #[error("Channel name already in use: {0}")]
    NameTaken(String),

    /// Not subscribed to channel.
    #[error("Not subscribed to channel: {0}")]
    NotSubscribed(String),

    /// Already subscribed to channel.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// Already muted.
    #[error("Channel already muted: {0}")]
    AlreadyMuted(String),

    /// Not muted.
    #[error("Channel not muted: {0}")]
    NotMuted(String),

    /// Missing capability.
    #[error("Permission denied: cannot {capability} on {channel}")]
    PermissionDenied {
        capability: Capability,
        channel: String,
    },

    /// Maximum channels reached.
    #[error("Maximum channels reached")]
    MaxChannelsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_channels: 1_000,
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of channels.
    pub channel_count: usize,
    /// Total number of subscription records.
    pub total_subscriptions: usize,
}

/// All channels of a game.
pub struct ChannelRegistry {
    /// Channels indexed by lowercased key.
    channels: DashMap<ChannelId, Channel>,
    /// Router used for sends.
    router: BroadcastRouter,
    /// Configuration.
    config: RegistryConfig,
}

impl ChannelRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new(router: BroadcastRouter) -> Self {
        Self::with_config(router, RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(router: BroadcastRouter, config: RegistryConfig) -> Self {
        info!("Creating channel registry with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            router,
            config,
        }
    }

    /// Get the router.
    #[must_use]
    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.channels.len(),
            total_subscriptions: self
                .channels
                .iter()
                .map(|entry| entry.value().subscriber_count())
                .sum(),
        }
    }

    /// Add a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid or taken, or the limit is hit.
    pub fn create(&self, channel: Channel) -> Result<(), RegistryError> {
        validate_channel_name(channel.key()).map_err(RegistryError::InvalidChannel)?;
        for alias in channel.aliases() {
            validate_channel_name(alias).map_err(RegistryError::InvalidChannel)?;
        }

        if self.channels.len() >= self.config.max_channels {
            return Err(RegistryError::MaxChannelsReached);
        }

        let names = std::iter::once(channel.key().to_string())
            .chain(channel.aliases().iter().cloned());
        for name in names {
            if self.resolve(&name).is_some() {
                return Err(RegistryError::NameTaken(name));
            }
        }

        debug!(channel = %channel.key(), "Creating channel");
        self.channels.insert(channel.key().to_lowercase(), channel);
        Ok(())
    }

    /// Delete a channel, returning it.
    ///
    /// # Errors
    ///
    /// Returns an error if no channel matches.
    pub fn remove(&self, name: &str) -> Result<Channel, RegistryError> {
        let key = self.require(name)?;
        self.channels
            .remove(&key)
            .map(|(_, channel)| {
                debug!(channel = %channel.key(), "Deleted channel");
                channel
            })
            .ok_or_else(|| RegistryError::ChannelNotFound(name.to_string()))
    }

    /// Resolve a key or alias (case-insensitive) to the registry key.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ChannelId> {
        let lower = name.to_lowercase();
        if self.channels.contains_key(&lower) {
            return Some(lower);
        }
        self.channels
            .iter()
            .find(|entry| entry.value().aliases().contains(&lower))
            .map(|entry| entry.key().clone())
    }

    fn require(&self, name: &str) -> Result<ChannelId, RegistryError> {
        self.resolve(name)
            .ok_or_else(|| RegistryError::ChannelNotFound(name.to_string()))
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Snapshot of a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if no channel matches.
    pub fn get(&self, name: &str) -> Result<Channel, RegistryError> {
        let key = self.require(name)?;
        self.channels
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::ChannelNotFound(name.to_string()))
    }

    /// Snapshot of a channel, if any matches.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Channel> {
        self.get(name).ok()
    }

    /// Get all channel keys, as created.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .map(|entry| entry.value().key().to_string())
            .collect();
        names.sort();
        names
    }

    fn with_channel_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Channel) -> Result<R, RegistryError>,
    ) -> Result<R, RegistryError> {
        let key = self.require(name)?;
        let mut entry = self
            .channels
            .get_mut(&key)
            .ok_or_else(|| RegistryError::ChannelNotFound(name.to_string()))?;
        entry.prune();
        f(entry.value_mut())
    }

    /// Subscribe an entity. Requires `listen`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is unknown, access is denied, or the
    /// entity is already subscribed.
    pub fn connect(&self, receiver: &ReceiverRef, name: &str) -> Result<(), RegistryError> {
        let policy = self.router.policy().clone();
        self.with_channel_mut(name, |channel| {
            if !policy.has_capability(&**receiver, channel, Capability::Listen) {
                return Err(RegistryError::PermissionDenied {
                    capability: Capability::Listen,
                    channel: channel.key().to_string(),
                });
            }
            if !channel.subscribe(receiver) {
                return Err(RegistryError::AlreadySubscribed(channel.key().to_string()));
            }
            Ok(())
        })
    }

    /// Unsubscribe an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is unknown or the entity is not
    /// subscribed.
    pub fn disconnect(&self, id: &EntityId, name: &str) -> Result<(), RegistryError> {
        self.with_channel_mut(name, |channel| {
            if channel.unsubscribe(id) {
                Ok(())
            } else {
                Err(RegistryError::NotSubscribed(channel.key().to_string()))
            }
        })
    }

    /// Unsubscribe an entity from every channel.
    ///
    /// Returns the keys of the channels it left.
    pub fn disconnect_all(&self, id: &EntityId) -> Vec<String> {
        let mut left = Vec::new();
        for mut entry in self.channels.iter_mut() {
            if entry.value_mut().unsubscribe(id) {
                left.push(entry.value().key().to_string());
            }
        }
        debug!(entity = %id, channels = left.len(), "Unsubscribed from all channels");
        left
    }

    /// Mute a channel for a subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed or already muted.
    pub fn mute(&self, id: &EntityId, name: &str) -> Result<(), RegistryError> {
        self.with_channel_mut(name, |channel| {
            if !channel.is_subscribed(id) {
                return Err(RegistryError::NotSubscribed(channel.key().to_string()));
            }
            if !channel.mute(id) {
                return Err(RegistryError::AlreadyMuted(channel.key().to_string()));
            }
            Ok(())
        })
    }

    /// Unmute a channel for a subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel was not muted.
    pub fn unmute(&self, id: &EntityId, name: &str) -> Result<(), RegistryError> {
        self.with_channel_mut(name, |channel| {
            if channel.unmute(id) {
                Ok(())
            } else {
                Err(RegistryError::NotMuted(channel.key().to_string()))
            }
        })
    }

    /// Keys of the channels an entity is subscribed to.
    #[must_use]
    pub fn subscriptions(&self, id: &EntityId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_subscribed(id))
            .map(|entry| entry.value().key().to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Send a message from `sender`. Requires `send`.
    ///
    /// Routing runs on a snapshot of the channel, so receiver hooks may call
    /// back into the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is unknown or access is denied.
    pub fn send(
        &self,
        name: &str,
        sender: &dyn Receiver,
        text: impl Into<String>,
        ctx: SendContext,
    ) -> Result<RouteReport, RegistryError> {
        let channel = self.get(name)?;
        if !self
            .router
            .policy()
            .has_capability(sender, &channel, Capability::Send)
        {
            return Err(RegistryError::PermissionDenied {
                capability: Capability::Send,
                channel: channel.key().to_string(),
            });
        }

        let ctx = if ctx.senders.is_empty() {
            ctx.with_sender(sender.id().clone())
        } else {
            ctx
        };
        let message = ChannelMessage::new(text);
        Ok(self.router.route(message, &channel, &ctx))
    }

    /// Send a system message with no sender and no capability check.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is unknown.
    pub fn announce(
        &self,
        name: &str,
        text: impl Into<String>,
        ctx: SendContext,
    ) -> Result<RouteReport, RegistryError> {
        let channel = self.get(name)?;
        Ok(self.router.route(ChannelMessage::new(text), &channel, &ctx))
    }
}
