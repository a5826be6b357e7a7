//! Realtime presence and message-delivery core.
//!
//! One WebSocket connection per authenticated session. The [`registry::Registry`]
//! is the only process-wide mutable resource; everything durable lives in
//! parley-db and is reached through blocking calls hopped off the runtime.

pub mod auth;
pub mod connection;
pub mod handlers;
pub mod registry;
