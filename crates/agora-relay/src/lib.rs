//! # agora-relay
//!
//! The transport-agnostic runtime core of the Agora relay:
//!
//! - Connection registry and subscription index with handle-based access
//! - Per-connection batching with zlib compression and size/time flush
//! - Memory guardian with tri-state pressure and slow-consumer eviction
//! - Scale-out backbone adapter for cross-instance fan-out
//! - Migration coordinator for zero-downtime drain/handoff
//! - Statistics snapshots for the operational surface
//!
//! Everything here speaks [`TransportAdapter`]; the wire protocol lives in
//! the server crate.
//!
//! [`TransportAdapter`]: transport::TransportAdapter

#![deny(unsafe_code)]

pub mod backbone;
pub mod connection;
pub mod hub;
pub mod memory;
pub mod migration;
pub mod pipeline;
pub mod registry;
pub mod stats;
pub mod subscriptions;
pub mod transport;

pub use connection::{Connection, HealthState, Identity};
pub use hub::{HubConfig, RelayHub};
pub use memory::PressureLevel;
pub use transport::{ChannelTransport, OutboundFrame, TransportAdapter, TransportKind};
