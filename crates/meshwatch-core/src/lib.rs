//! # Mesh Observer and Injector Engine
//!
//! This crate is the core of a mesh radio observer: it ingests protobuf
//! frames from gateway transports (MQTT, serial, TCP), decrypts and decodes
//! them, and maintains a relational picture of the mesh — nodes, channels,
//! packets, directed edges, and per-node latency history. It can also talk
//! back: crafting and injecting packets directly, reactively (traceroutes at
//! newly-heard nodes), or on a periodic schedule.
//!
//! ## Data Flow
//!
//! ```text
//! RX: transport -> ingest (normalize) -> handler (decrypt/decode/upsert)
//!       -> route reconstruction + probe correlation -> store
//! TX: crafter (payload) -> crypto (seal) -> publisher -> coordinator -> transport
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshwatch_core::handler::PacketHandler;
//! use meshwatch_core::ingest::{ingest_packet, IngestMeta};
//! use meshwatch_core::publisher::Publisher;
//! use meshwatch_core::store::Store;
//! use meshwatch_core::transport::Coordinator;
//!
//! let store = Store::shared();
//! let coordinator = Arc::new(Coordinator::new());
//! let handler = PacketHandler::new(store.clone(), None);
//! let publisher = Publisher::new(store.clone(), coordinator, None);
//!
//! # let raw_frame: Vec<u8> = vec![];
//! let meta = IngestMeta {
//!     topic: Some("msh/2/e/LongFast/!deadbeef".into()),
//!     interface_id: Some("mqtt-0".into()),
//! };
//! let frame = ingest_packet("mqtt", raw_frame, &meta).unwrap();
//! let processed = handler.handle_frame(&frame).unwrap();
//! publisher.on_packet_received(&processed).unwrap();
//! ```

pub mod crafter;
pub mod crypto;
pub mod handler;
pub mod identity;
pub mod ingest;
pub mod proto;
pub mod publisher;
pub mod route;
pub mod store;
pub mod transport;

// Re-export main types
pub use crafter::{CraftError, EnvelopeParams, TelemetryValues};
pub use crypto::{ChannelKey, CryptoError, PkiCapability};
pub use handler::{HandleError, PacketHandler, ProcessedPacket};
pub use identity::{canonical_id, parse_id, BROADCAST_ID, BROADCAST_NUM};
pub use ingest::{ingest_packet, IngestError, IngestMeta, NormalizedFrame, SourceKind};
pub use publisher::{PublishError, PublishRequest, Publisher};
pub use store::{PacketKey, ReactiveConfig, SharedStore, Store};
pub use transport::{Coordinator, MemoryTransport, Transport, TransportError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::handler::{PacketHandler, ProcessedPacket};
    pub use crate::ingest::{ingest_packet, IngestMeta};
    pub use crate::publisher::{PublishRequest, Publisher};
    pub use crate::store::{SharedStore, Store};
    pub use crate::transport::{Coordinator, Transport};
}
