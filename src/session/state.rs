//! Session lifecycle states and the events published on transitions.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::pdu::Opcode;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Engines started on a fresh transport; only the immediate queue flows
    /// while login is negotiated.
    Starting,
    /// Full-feature phase: commands and write data flow.
    Running,
    /// The link was lost. Engines are stopped, the transport is released and
    /// in-flight requests wait on the command queue.
    Draining,
    /// A replacement transport is attached and login is being redone.
    Restarting,
    /// Terminal: every request has been failed and resources released.
    Stopped,
}

impl SessionState {
    /// Whether the session can still accept new requests.
    #[must_use]
    pub fn accepts_requests(self) -> bool { !matches!(self, Self::Stopped) }

    /// Whether engines are running on a live transport.
    #[must_use]
    pub fn has_link(self) -> bool { matches!(self, Self::Starting | Self::Running | Self::Restarting) }

    /// Whether commands and write data may flow.
    #[must_use]
    pub fn is_full_feature(self) -> bool { matches!(self, Self::Running) }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Ordered teardown steps, reported as they complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStep {
    /// The receive engine has exited (or was aborted).
    ReceiveStopped,
    /// The transport's read side is shut down.
    ReadShutdown,
    /// The transmit engine has exited (or was aborted).
    TransmitStopped,
    /// The transport is closed and released.
    TransportClosed,
    /// Queues and held requests are flushed.
    QueuesFlushed,
    /// Registry entry and gauges are released.
    ResourcesReleased,
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReceiveStopped => "receive stopped",
            Self::ReadShutdown => "read shut down",
            Self::TransmitStopped => "transmit stopped",
            Self::TransportClosed => "transport closed",
            Self::QueuesFlushed => "queues flushed",
            Self::ResourcesReleased => "resources released",
        };
        f.write_str(name)
    }
}

/// Notifications broadcast to session observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The lifecycle state changed.
    StateChanged(SessionState),
    /// The connection failed; the reason is the engine's error text.
    LinkDown {
        /// Description of the failure.
        reason: String,
    },
    /// Automatic recovery attached a new transport.
    Reconnected {
        /// One-based attempt number that succeeded.
        attempt: u32,
    },
    /// An asynchronous message not tied to a request.
    AsyncMessage {
        /// AsyncEvent code.
        event: u8,
        /// Attached data segment (sense data or parameters).
        data: Bytes,
    },
    /// A Login, Text or Logout request queued with
    /// [`send_control`](crate::Session::send_control) was dropped with the
    /// connection it belonged to. It is not resent on the next connection.
    ControlDiscarded {
        /// Initiator Task Tag returned by `send_control`.
        itt: u32,
        /// Opcode of the dropped request.
        opcode: Opcode,
    },
    /// A teardown step completed.
    Shutdown(ShutdownStep),
}
