//! # agora-server
//!
//! HTTP and WebSocket front end for the Agora relay. Owns the operational
//! surface (`/health`, `/stats`, `/metrics`) and the `/ws` upgrade path;
//! everything behind the socket is `agora-relay`.

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod ws;
