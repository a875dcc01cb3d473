//! Connection lifecycle state machine.
//!
//! `ConnectionLifecycle` holds no sockets or timers. It consumes connection
//! events, decides what happens next, and returns a [`LifecycleCommand`] for
//! the driver to execute. Every connection attempt and every reconnect timer
//! carries a generation number; events that reference an attempt or timer
//! that is no longer current are ignored, which is how cancelled work is
//! invalidated rather than merely forgotten.

use std::fmt;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::retry::ReconnectPolicy;
use crate::stream::proto::NotificationEvent;

/// Lifecycle state of a notification stream client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// A connection attempt is in flight.
    Connecting,
    /// The handshake succeeded; inbound notifications are delivered.
    Open,
    /// The last attempt failed or dropped; a reconnect timer is pending.
    ReconnectWait,
    /// Closed by the caller. Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns `true` while notifications are being delivered.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` once the client has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::ReconnectWait => "reconnect_wait",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Generation number of one connection attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Generation number of one reconnect timer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Work the driver must perform after a lifecycle transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LifecycleCommand {
    /// Open a new connection for the given attempt.
    Connect { attempt: AttemptId },
    /// Arm the single reconnect timer.
    ScheduleReconnect { timer: TimerId, delay: Duration },
    /// Disarm the pending reconnect timer.
    CancelReconnect { timer: TimerId },
    /// Release the connection belonging to the given attempt.
    Disconnect { attempt: AttemptId },
}

/// Receives notifications delivered by a stream client.
///
/// Invocations for one client are strictly sequential and in arrival order.
pub trait NotificationHandler: Send + 'static {
    fn on_notification(&mut self, event: NotificationEvent);
}

impl<F> NotificationHandler for F
where
    F: FnMut(NotificationEvent) + Send + 'static,
{
    fn on_notification(&mut self, event: NotificationEvent) {
        self(event)
    }
}

/// Outcome of handing an inbound frame to the lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameOutcome {
    /// The frame parsed and was passed to the handler.
    Delivered,
    /// The frame was not a notification and was dropped.
    Malformed,
    /// The frame belongs to a connection that is no longer delivering.
    Ignored,
}

/// Sans-IO state machine for one notification subscription.
pub struct ConnectionLifecycle<H> {
    state: ConnectionState,
    policy: ReconnectPolicy,
    handler: H,
    attempt: AttemptId,
    retry_attempt: u32,
    pending_timer: Option<TimerId>,
    next_timer: u64,
    last_delay: Option<Duration>,
}

impl<H> fmt::Debug for ConnectionLifecycle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLifecycle")
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("retry_attempt", &self.retry_attempt)
            .field("pending_timer", &self.pending_timer)
            .finish_non_exhaustive()
    }
}

impl<H: NotificationHandler> ConnectionLifecycle<H> {
    /// Creates a lifecycle in `Connecting` and returns the first connect
    /// command alongside it.
    pub fn start(policy: ReconnectPolicy, handler: H) -> (Self, LifecycleCommand) {
        let attempt = AttemptId(1);
        let lifecycle = Self {
            state: ConnectionState::Connecting,
            policy,
            handler,
            attempt,
            retry_attempt: 0,
            pending_timer: None,
            next_timer: 1,
            last_delay: None,
        };
        debug!(event = "stream_connecting", attempt = attempt.get());
        (lifecycle, LifecycleCommand::Connect { attempt })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the reconnect timer currently armed, if any.
    pub fn pending_timer(&self) -> Option<TimerId> {
        self.pending_timer
    }

    /// Number of consecutive failed or dropped attempts since the last open.
    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    /// The attempt that is in flight or open.
    pub fn current_attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Delay chosen for the most recently scheduled reconnect.
    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Records a completed handshake.
    ///
    /// Returns a `Disconnect` command when the connection is no longer wanted
    /// (the client was closed or a newer attempt superseded it).
    pub fn handshake_succeeded(&mut self, attempt: AttemptId) -> Option<LifecycleCommand> {
        if self.state != ConnectionState::Connecting || attempt != self.attempt {
            debug!(
                event = "stream_stale_handshake_released",
                attempt = attempt.get(),
                state = %self.state
            );
            return Some(LifecycleCommand::Disconnect { attempt });
        }

        self.state = ConnectionState::Open;
        self.retry_attempt = 0;
        debug!(event = "stream_open", attempt = attempt.get());
        None
    }

    /// Records a failed, rejected, or timed out handshake.
    pub fn handshake_failed(
        &mut self,
        attempt: AttemptId,
        reason: &str,
    ) -> Option<LifecycleCommand> {
        if self.state != ConnectionState::Connecting || attempt != self.attempt {
            return None;
        }
        warn!(
            event = "stream_handshake_failed",
            attempt = attempt.get(),
            reason
        );
        Some(self.enter_reconnect_wait())
    }

    /// Records that an open connection dropped.
    pub fn connection_lost(
        &mut self,
        attempt: AttemptId,
        reason: &str,
    ) -> Option<LifecycleCommand> {
        if self.state != ConnectionState::Open || attempt != self.attempt {
            return None;
        }
        warn!(
            event = "stream_connection_lost",
            attempt = attempt.get(),
            reason
        );
        Some(self.enter_reconnect_wait())
    }

    /// Handles one inbound frame payload.
    ///
    /// Malformed payloads are dropped without touching connection state.
    pub fn frame_received(&mut self, attempt: AttemptId, payload: &[u8]) -> FrameOutcome {
        if self.state != ConnectionState::Open || attempt != self.attempt {
            return FrameOutcome::Ignored;
        }
        match NotificationEvent::parse(payload) {
            Some(event) => {
                self.handler.on_notification(event);
                FrameOutcome::Delivered
            }
            None => {
                trace!(
                    event = "stream_malformed_frame_dropped",
                    attempt = attempt.get(),
                    len = payload.len()
                );
                FrameOutcome::Malformed
            }
        }
    }

    /// Records that a reconnect timer fired.
    pub fn timer_elapsed(&mut self, timer: TimerId) -> Option<LifecycleCommand> {
        if self.state != ConnectionState::ReconnectWait || self.pending_timer != Some(timer) {
            return None;
        }
        self.pending_timer = None;
        self.attempt = AttemptId(self.attempt.0 + 1);
        self.state = ConnectionState::Connecting;
        debug!(
            event = "stream_connecting",
            attempt = self.attempt.get(),
            retry_attempt = self.retry_attempt
        );
        Some(LifecycleCommand::Connect {
            attempt: self.attempt,
        })
    }

    /// Moves to `Closed`. Idempotent.
    ///
    /// Returns the commands needed to cancel whatever was pending; empty when
    /// the lifecycle was already closed.
    pub fn close(&mut self) -> Vec<LifecycleCommand> {
        let previous = self.state;
        if previous == ConnectionState::Closed {
            return Vec::new();
        }
        self.state = ConnectionState::Closed;

        let mut commands = Vec::with_capacity(1);
        if let Some(timer) = self.pending_timer.take() {
            commands.push(LifecycleCommand::CancelReconnect { timer });
        }
        if matches!(
            previous,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            commands.push(LifecycleCommand::Disconnect {
                attempt: self.attempt,
            });
        }
        debug!(event = "stream_closed", previous = %previous);
        commands
    }

    fn enter_reconnect_wait(&mut self) -> LifecycleCommand {
        self.retry_attempt = self.retry_attempt.saturating_add(1);
        let delay = self.policy.delay_for_attempt(self.retry_attempt);
        let timer = TimerId(self.next_timer);
        self.next_timer += 1;
        self.pending_timer = Some(timer);
        self.last_delay = Some(delay);
        self.state = ConnectionState::ReconnectWait;
        debug!(
            event = "stream_reconnect_scheduled",
            timer = timer.get(),
            retry_attempt = self.retry_attempt,
            delay_ms = delay.as_millis() as u64
        );
        LifecycleCommand::ScheduleReconnect { timer, delay }
    }
}
