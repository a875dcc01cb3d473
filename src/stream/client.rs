//! Notification stream client.
//!
//! Each client spawns one worker task that owns the websocket and the single
//! reconnect timer. The worker only executes commands; every state decision is
//! made by [`ConnectionLifecycle`] behind a mutex that [`NotificationClient::close`]
//! also takes, so nothing is delivered once `close` has returned.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::config::StreamConfig;
use crate::retry::with_timeout;
use crate::stream::lifecycle::{
    AttemptId, ConnectionLifecycle, ConnectionState, LifecycleCommand, NotificationHandler,
};
use crate::stream::proto::NotificationEvent;

const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BoxedHandler = Box<dyn FnMut(NotificationEvent) + Send>;

/// Errors produced by the notification stream client.
///
/// Only configuration and environment errors are returned to callers. The
/// remaining variants describe failed attempts; the worker logs them and
/// retries.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// The config has no stream path.
    #[error("stream path is missing")]
    MissingPath,

    /// The stream path or base URL is not a valid URL.
    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// The resolved URL uses a scheme other than ws, wss, http or https.
    #[error("unsupported stream url scheme: {0}")]
    UnsupportedScheme(String),

    /// Some other config value is out of range.
    #[error("invalid stream config: {0}")]
    InvalidConfig(String),

    /// `connect` was called outside a tokio runtime.
    #[error("no tokio runtime is running")]
    NoRuntime,

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The server answered the upgrade request with a non-101 status.
    #[error("handshake rejected with http status {0}")]
    HandshakeRejected(u16),

    /// The handshake did not finish in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

impl StreamClientError {
    fn from_handshake(err: WsError) -> Self {
        match err {
            WsError::Http(response) => Self::HandshakeRejected(response.status().as_u16()),
            other => Self::WebSocket(other),
        }
    }
}

struct Shared {
    lifecycle: Mutex<ConnectionLifecycle<BoxedHandler>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Thread currently running the handler, if any.
    delivering_on: Mutex<Option<ThreadId>>,
    /// Set by a `close` issued from inside the handler; applied when the
    /// handler returns.
    close_requested: AtomicBool,
}

impl Shared {
    /// Runs `f` against the lifecycle and publishes the resulting state.
    fn update<T>(&self, f: impl FnOnce(&mut ConnectionLifecycle<BoxedHandler>) -> T) -> T {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let output = f(&mut lifecycle);
        if self.close_requested.swap(false, Ordering::AcqRel) {
            lifecycle.close();
        }
        self.publish(lifecycle.state());
        output
    }

    /// Hands one frame to the lifecycle, recording which thread runs the
    /// handler.
    fn deliver(&self, attempt: AttemptId, payload: &[u8]) {
        self.update(|lifecycle| {
            let _delivering = DeliveryGuard::enter(&self.delivering_on);
            lifecycle.frame_received(attempt, payload);
        });
    }

    fn delivering_on_current_thread(&self) -> bool {
        let delivering = self
            .delivering_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *delivering == Some(thread::current().id())
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

struct DeliveryGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DeliveryGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        Self { slot }
    }
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Reconnecting, token-authenticated notification stream client.
///
/// Dropping the client closes it.
pub struct NotificationClient {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
    path: String,
}

impl fmt::Debug for NotificationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationClient")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl NotificationClient {
    /// Validates `config` and starts connecting in the background.
    ///
    /// Returns immediately; the client is in [`ConnectionState::Connecting`]
    /// when this returns. Must be called from within a tokio runtime.
    /// `handler` receives every notification that arrives while the
    /// connection is open, one call at a time and in arrival order.
    pub fn connect<H>(config: StreamConfig, handler: H) -> Result<Self, StreamClientError>
    where
        H: NotificationHandler,
    {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;

        let mut handler = handler;
        let handler: BoxedHandler =
            Box::new(move |event: NotificationEvent| handler.on_notification(event));
        let (lifecycle, first) =
            ConnectionLifecycle::start(config.reconnect_policy().clone(), handler);
        let (state_tx, _) = watch::channel(lifecycle.state());
        let shared = Arc::new(Shared {
            lifecycle: Mutex::new(lifecycle),
            state_tx,
            delivering_on: Mutex::new(None),
            close_requested: AtomicBool::new(false),
        });

        let path = endpoint.path().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = runtime.spawn(connection_worker(
            Arc::clone(&shared),
            endpoint,
            config.handshake_timeout(),
            shutdown_rx,
            first,
        ));
        debug!(
            event = "notification_client_started",
            path = %path,
            authenticated = config.has_token()
        );

        Ok(Self {
            shared,
            shutdown_tx,
            worker,
            path,
        })
    }

    /// Closes the client. Idempotent.
    ///
    /// Cancels any pending reconnect and releases the connection. Once this
    /// returns the handler is never invoked again. When called from inside
    /// the handler, the close takes effect as soon as the handler returns
    /// and the current notification is the last one delivered.
    pub fn close(&self) {
        if self.shared.delivering_on_current_thread() {
            self.close_from_handler();
            return;
        }
        let cancelled = self.shared.update(|lifecycle| lifecycle.close());
        if cancelled.is_empty() {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        debug!(
            event = "notification_client_closed",
            path = %self.path,
            cancelled = cancelled.len()
        );
    }

    fn close_from_handler(&self) {
        if self.shared.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.publish(ConnectionState::Closed);
        let _ = self.shutdown_tx.send(true);
        debug!(
            event = "notification_client_closed",
            path = %self.path,
            from_handler = true
        );
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Returns a receiver that observes lifecycle state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Path of the stream endpoint, without query parameters.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns `true` once the background worker has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connection_worker(
    shared: Arc<Shared>,
    endpoint: Url,
    handshake_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    first: LifecycleCommand,
) {
    let mut next = Some(first);

    while let Some(command) = next.take() {
        next = match command {
            LifecycleCommand::Connect { attempt } => {
                run_attempt(
                    &shared,
                    &endpoint,
                    handshake_timeout,
                    attempt,
                    &mut shutdown_rx,
                )
                .await
            }
            LifecycleCommand::ScheduleReconnect { timer, delay } => {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown_rx) => None,
                    _ = tokio::time::sleep(delay) => {
                        shared.update(|lifecycle| lifecycle.timer_elapsed(timer))
                    }
                }
            }
            LifecycleCommand::CancelReconnect { .. } | LifecycleCommand::Disconnect { .. } => None,
        };
    }

    debug!(event = "notification_worker_stopped", path = endpoint.path());
}

async fn run_attempt(
    shared: &Shared,
    endpoint: &Url,
    handshake_timeout: Duration,
    attempt: AttemptId,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<LifecycleCommand> {
    let request = match endpoint.as_str().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            let reason = StreamClientError::from_handshake(err).to_string();
            return shared.update(|lifecycle| lifecycle.handshake_failed(attempt, &reason));
        }
    };

    let handshake = tokio::select! {
        biased;
        _ = shutdown_requested(shutdown_rx) => return None,
        result = with_timeout(handshake_timeout, connect_async(request)) => result,
    };

    let mut socket = match handshake {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(err)) => {
            let reason = StreamClientError::from_handshake(err).to_string();
            return shared.update(|lifecycle| lifecycle.handshake_failed(attempt, &reason));
        }
        Err(_) => {
            let reason = StreamClientError::HandshakeTimeout(handshake_timeout).to_string();
            return shared.update(|lifecycle| lifecycle.handshake_failed(attempt, &reason));
        }
    };

    if let Some(LifecycleCommand::Disconnect { .. }) =
        shared.update(|lifecycle| lifecycle.handshake_succeeded(attempt))
    {
        release_socket(&mut socket).await;
        return None;
    }

    run_open_session(shared, attempt, &mut socket, shutdown_rx).await
}

async fn run_open_session(
    shared: &Shared,
    attempt: AttemptId,
    socket: &mut Socket,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<LifecycleCommand> {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown_rx) => None,
            inbound = socket.next() => Some(inbound),
        };
        let Some(inbound) = inbound else {
            release_socket(socket).await;
            return None;
        };

        let lost_reason = match inbound {
            Some(Ok(Message::Text(text))) => {
                shared.deliver(attempt, text.as_bytes());
                None
            }
            Some(Ok(Message::Binary(payload))) => {
                shared.deliver(attempt, &payload);
                None
            }
            Some(Ok(Message::Ping(payload))) => socket
                .send(Message::Pong(payload))
                .await
                .err()
                .map(|err| err.to_string()),
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => None,
            Some(Ok(Message::Close(frame))) => Some(describe_close(frame.as_ref())),
            Some(Err(err)) => Some(err.to_string()),
            None => Some("stream ended".to_string()),
        };

        if let Some(reason) = lost_reason {
            return shared.update(|lifecycle| lifecycle.connection_lost(attempt, &reason));
        }
    }
}

/// Resolves once `close` was called or the client handle is gone.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|closed| *closed).await;
}

async fn release_socket(socket: &mut Socket) {
    let _ = with_timeout(CLOSE_FRAME_TIMEOUT, socket.close(None)).await;
}

fn describe_close(frame: Option<&CloseFrame<'_>>) -> String {
    match frame {
        Some(frame) if frame.reason.is_empty() => {
            format!("closed by server ({})", u16::from(frame.code))
        }
        Some(frame) => format!(
            "closed by server ({}: {})",
            u16::from(frame.code),
            frame.reason
        ),
        None => "closed by server".to_string(),
    }
}
