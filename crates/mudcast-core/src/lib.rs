//! # mudcast-core
//!
//! Channel broadcast routing and presence-watch fan-out for multiplayer text
//! games.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Channel** - Named broadcast group with subscribers, mutes, and locks
//! - **Registry** - Channel lookup by key or alias, subscription management
//! - **Router** - Filtered fan-out with global and per-receiver hooks
//! - **Presence** - Connect/disconnect notices for watching observers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│  Registry   │────▶│   Router    │────▶ receivers
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │
//!        ▼ connect / disconnect
//! ┌─────────────┐     ┌─────────────┐
//! │ WatchEngine │◀────│ Attributes  │
//! └─────────────┘     └─────────────┘
//! ```
//!
//! The engines own no entities. Callers pass in snapshots of the connected
//! entities and the core only reads them and sends text.

pub mod attributes;
pub mod channel;
pub mod entity;
pub mod hooks;
pub mod message;
pub mod presence;
pub mod registry;
pub mod router;

pub use attributes::{AttributeError, AttributeStore, MemoryAttributes};
pub use channel::{AccessPolicy, AccessRule, Capability, Channel, ChannelId, ChannelLocks, LockPolicy};
pub use entity::{DeliveryError, Directory, EntityId, Receiver, ReceiverRef};
pub use hooks::{HistoryHook, HookChain, MaxLengthHook, SendHook};
pub use message::{ChannelMessage, SendContext};
pub use presence::{ConnectionEvent, Transition, VisibilitySpec, WatchEngine, WatchSpec};
pub use registry::{ChannelRegistry, RegistryConfig, RegistryError, RegistryStats};
pub use router::{BroadcastRouter, RouteReport};
