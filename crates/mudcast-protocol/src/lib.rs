//! # mudcast-protocol
//!
//! Wire protocol between mudcast clients and the channel server.
//!
//! ## Frame Types
//!
//! - `Login` / `Welcome` - Session handshake
//! - `Join` / `Leave` / `Mute` / `Unmute` - Channel membership
//! - `Say` / `ChannelLine` / `History` - Channel traffic
//! - `Watch` / `Hide` / `Permit` and friends - Presence watching
//! - `Notice` - Free-form server text, including watch notices
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use mudcast_protocol::{codec, Frame};
//!
//! let frame = Frame::say("Public", "Hello, world!");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_from, encode, encode_into, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{codes, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
