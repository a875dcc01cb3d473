//! Realtime notification transport for the job portal.
//!
//! The crate is organized by concern:
//! - `config`: stream endpoint, credentials, and reconnect settings.
//! - `stream`: reconnecting websocket client, lifecycle state machine, and
//!   notification payloads.
//! - `retry`: reconnect backoff and timeout utilities.

/// Stream client configuration.
pub mod config;
/// Backoff and timeout helpers.
pub mod retry;
/// Notification stream client, lifecycle, and payload types.
pub mod stream;

pub use config::StreamConfig;
pub use retry::ReconnectPolicy;
pub use stream::client::{NotificationClient, StreamClientError};
pub use stream::feed::{NotificationFeed, NotificationSubscription};
pub use stream::lifecycle::{ConnectionState, NotificationHandler};
pub use stream::proto::NotificationEvent;
