//! WebSocket front end: session lifecycle and token authentication.

pub mod auth;
pub mod session;
