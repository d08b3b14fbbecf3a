//! Beacon pipeline simulation
//!
//! Stand-ins for the collaborators the upstream engine needs, so the whole
//! pipeline runs without radios or a broker:
//!
//! - **SimBroker / SimTransport**: in-memory broker recording every publish
//! - **SimResolver**: scriptable resolver that counts calls
//! - **FrameBuilder**: well-formed advertisements for every packet kind
//!
//! # Example
//!
//! ```rust
//! use beacon_protocol::PacketKind;
//! use beacon_sim::FrameBuilder;
//!
//! let tag = FrameBuilder::random().rssi(-48);
//! let frame = tag.pixel([0x01, 0x02, 0x03, 0x04]);
//! assert_eq!(frame.kind(), PacketKind::Pixel);
//! assert_eq!(frame.suffix_hex().as_deref(), Some("01020304"));
//! ```

pub mod frames;
pub mod resolver;
pub mod transport;

pub use frames::{FrameBuilder, PacketId, SensorInfo, FRAME_LEN};
pub use resolver::SimResolver;
pub use transport::{PublishedMessage, SimBroker, SimConnection, SimTransport};
