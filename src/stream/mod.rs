//! Realtime notification stream modules.
//!
//! - `client`: websocket transport, reconnect worker, and error type.
//! - `lifecycle`: connection state machine that decides what the worker does.
//! - `proto`: notification payloads pushed by the server.
//! - `feed`: caller-side event history and subscription helper.

/// Websocket client that keeps one notification subscription alive.
pub mod client;
/// Caller-owned notification history.
pub mod feed;
/// Connection lifecycle state machine.
pub mod lifecycle;
/// Notification payload types.
pub mod proto;
