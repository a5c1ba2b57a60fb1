//! # agora-core
//!
//! Foundation types for the Agora real-time relay:
//!
//! - Branded ID newtypes ([`ids`])
//! - Client/server wire protocol frames and the batch codec ([`protocol`])
//! - The error hierarchy ([`errors`])
//! - Tracing subscriber initialization ([`logging`])

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{InvariantError, ProtocolError, RelayError, ResourceError, TransportError};
pub use ids::ConnectionId;
