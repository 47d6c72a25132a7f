//! Per-entity attribute storage consulted by the watch engine.
//!
//! Attributes are loose JSON values keyed by name. The engine reads them into
//! typed records once per event; see [`crate::presence`].

use crate::entity::EntityId;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Observer is receiving notifications at all.
pub const WATCH_ACTIVE: &str = "watch_active";
/// Observer watches every subject.
pub const WATCH_ALL: &str = "watch_all";
/// Subjects the observer watches.
pub const WATCH_LIST: &str = "watch_list";
/// Subject hides its connection changes.
pub const WATCH_HIDDEN: &str = "watch_hidden";
/// Observers still told about a hidden subject.
pub const WATCH_PERMITTED: &str = "watch_permitted";

/// Attribute lookup errors.
#[derive(Debug, Error)]
pub enum AttributeError {
    /// Stored value has the wrong shape.
    #[error("Malformed attribute {key} on {entity}: {source}")]
    Malformed {
        entity: EntityId,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Value could not be encoded for storage.
    #[error("Cannot encode attribute {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Backing store failed.
    #[error("Attribute store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed attribute lookup.
pub trait AttributeStore: Send + Sync {
    /// Fetch a raw attribute. `Ok(None)` means "not set".
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, entity: &EntityId, key: &str) -> Result<Option<Value>, AttributeError>;
}

/// Read a typed attribute, falling back to `default` when unset.
///
/// # Errors
///
/// Returns an error if the store fails or the value has the wrong type.
pub fn load_or<T>(
    store: &dyn AttributeStore,
    entity: &EntityId,
    key: &str,
    default: T,
) -> Result<T, AttributeError>
where
    T: DeserializeOwned,
{
    match store.get(entity, key)? {
        None | Some(Value::Null) => Ok(default),
        Some(value) => serde_json::from_value(value).map_err(|source| AttributeError::Malformed {
            entity: entity.clone(),
            key: key.to_string(),
            source,
        }),
    }
}

/// In-memory attribute store.
#[derive(Debug, Default)]
pub struct MemoryAttributes {
    entries: DashMap<EntityId, Map<String, Value>>,
}

impl MemoryAttributes {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded as JSON.
    pub fn set<T: Serialize>(
        &self,
        entity: &EntityId,
        key: &str,
        value: &T,
    ) -> Result<(), AttributeError> {
        let value = serde_json::to_value(value).map_err(|source| AttributeError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(entity, key, value);
        Ok(())
    }

    /// Store a raw JSON value.
    pub fn set_raw(&self, entity: &EntityId, key: &str, value: Value) {
        self.entries
            .entry(entity.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Remove one attribute. Returns the old value, if any.
    pub fn remove(&self, entity: &EntityId, key: &str) -> Option<Value> {
        self.entries
            .get_mut(entity)
            .and_then(|mut attrs| attrs.remove(key))
    }

    /// Remove every attribute of an entity.
    pub fn clear(&self, entity: &EntityId) {
        self.entries.remove(entity);
    }

    /// Number of entities with at least one attribute.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AttributeStore for MemoryAttributes {
    fn get(&self, entity: &EntityId, key: &str) -> Result<Option<Value>, AttributeError> {
        Ok(self
            .entries
            .get(entity)
            .and_then(|attrs| attrs.get(key).cloned()))
    }
}
