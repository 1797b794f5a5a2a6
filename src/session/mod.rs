//! Session lifecycle and the public session handle.
//!
//! A [`Session`] multiplexes SCSI requests onto one connection to a target.
//! It is started by [`SessionBuilder`], survives connection restarts, and
//! ends with an ordered [`shutdown`](Session::shutdown). Handles are cheap to
//! clone; the session shuts down when the last handle is dropped.

mod builder;
mod connection;
mod controller;
pub mod registry;
mod shared;
mod shutdown;
mod state;
mod stats;

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

pub use builder::SessionBuilder;
use bytes::Bytes;
use controller::Command;
pub use registry::{SessionId, SessionRegistry};
pub(crate) use shared::Shared;
pub use shutdown::ShutdownReport;
pub use state::{SessionEvent, SessionState, ShutdownStep};
pub use stats::{SessionStats, StatsSnapshot, active_session_count};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    completion::RequestHandle,
    config::SessionConfig,
    error::SessionError,
    pdu::{Location, Pdu, PduId},
    sequence::WindowSnapshot,
    transmit::nop_out,
    transport::Transport,
};

pub(crate) struct SessionInner {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
}

/// Handle to a running session.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start configuring a session.
    #[must_use]
    pub fn builder() -> SessionBuilder { SessionBuilder::new() }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self { Self(inner) }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> { Arc::downgrade(&self.0) }

    fn shared(&self) -> &Shared { &self.0.shared }

    #[must_use]
    pub fn id(&self) -> SessionId { self.shared().id }

    #[must_use]
    pub fn config(&self) -> &SessionConfig { &self.shared().config }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState { self.shared().state() }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> { self.shared().subscribe_state() }

    /// Subscribe to session events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> { self.shared().subscribe() }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot { self.shared().stats.snapshot() }

    /// Current command-window counters.
    #[must_use]
    pub fn window(&self) -> WindowSnapshot { self.shared().tracker().snapshot() }

    /// Requests sent and awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize { self.shared().held.len() }

    /// Pool slots in use: received PDUs not yet released plus the slot the
    /// receive engine reserves for its next read.
    #[must_use]
    pub fn pool_in_use(&self) -> usize { self.shared().pool.in_use() }

    /// Every queued or held PDU with its location.
    #[must_use]
    pub fn census(&self) -> Vec<(PduId, Location)> {
        let mut census = self.shared().queues.census();
        census.extend(self.shared().held.census());
        census
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.shared().closed.is_cancelled() {
            Err(SessionError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Queue `pdu` unless the session stopped in the meantime.
    fn enqueue_checked(&self, pdu: Pdu) {
        let shared = self.shared();
        shared.enqueue(pdu);
        if shared.closed.is_cancelled() {
            shared.flush(&shared.flush_error());
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.0
            .commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Leave the login phase; commands and write data start to flow.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidState`] while the link is down and
    /// [`SessionError::Stopped`] once the session has stopped.
    pub async fn enter_full_feature(&self) -> Result<(), SessionError> {
        self.call(Command::FullFeature).await?
    }

    /// Submit a tracked request.
    ///
    /// A fresh Initiator Task Tag is written into `pdu`. The returned handle
    /// resolves with the final response and any Data-In payload.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] once the session has stopped.
    pub fn submit(&self, pdu: Pdu) -> Result<RequestHandle, SessionError> { self.track(pdu, None) }

    /// Submit a write whose payload is sent in Data-Out PDUs as the target
    /// solicits it with R2T.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] once the session has stopped.
    pub fn submit_write(&self, pdu: Pdu, payload: Bytes) -> Result<RequestHandle, SessionError> {
        self.track(pdu, Some(payload))
    }

    fn track(&self, mut pdu: Pdu, payload: Option<Bytes>) -> Result<RequestHandle, SessionError> {
        self.ensure_open()?;
        let itt = self.shared().tracker().next_itt();
        pdu.header_mut().set_itt(itt);
        let handle = pdu.track(payload);
        self.enqueue_checked(pdu);
        Ok(handle)
    }

    /// Send an untracked control PDU such as a Login, Text or Logout
    /// request. Its response arrives through
    /// [`recv_response`](Self::recv_response).
    ///
    /// Returns the Initiator Task Tag assigned to the PDU.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] once the session has stopped.
    pub fn send_control(&self, mut pdu: Pdu) -> Result<u32, SessionError> {
        self.ensure_open()?;
        let itt = self.shared().tracker().next_itt();
        pdu.header_mut().set_itt(itt);
        self.enqueue_checked(pdu);
        Ok(itt)
    }

    /// Wait for the next Login, Text or Logout response.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConnectionLost`] if the link goes down while
    /// waiting and [`SessionError::Stopped`] once the session has stopped and
    /// no response remains.
    pub async fn recv_response(&self) -> Result<Pdu, SessionError> {
        let shared = self.shared();
        let mut state = shared.subscribe_state();
        let mut pdu = tokio::select! {
            biased;
            pdu = shared.queues.response.pop_wait() => pdu,
            () = shared.closed.cancelled() => shared.queues.response.pop().ok_or(SessionError::Stopped)?,
            () = link_down(&mut state) => return Err(SessionError::ConnectionLost),
        };
        pdu.release_slot();
        Ok(pdu)
    }

    /// Measure a NOP-Out/NOP-In round trip.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PingTimeout`] if no reply arrives within
    /// `timeout`, [`SessionError::ConnectionLost`] if the link goes down
    /// first, and [`SessionError::Stopped`] once the session has stopped.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, SessionError> {
        self.ensure_open()?;
        let shared = self.shared();
        let itt = shared.tracker().next_itt();
        let (tx, rx) = oneshot::channel();
        shared.pings.insert(itt, tx);
        let started = tokio::time::Instant::now();
        self.enqueue_checked(nop_out(itt));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(_reply)) => Ok(started.elapsed()),
            Ok(Err(_)) if shared.closed.is_cancelled() => Err(SessionError::Stopped),
            Ok(Err(_)) => Err(SessionError::ConnectionLost),
            Err(_) => {
                shared.pings.remove(&itt);
                Err(SessionError::PingTimeout)
            }
        }
    }

    /// Attach a new transport after link loss, or replace a live one.
    ///
    /// In-flight requests are resent on the new connection once
    /// [`enter_full_feature`](Self::enter_full_feature) is called again.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] once the session has stopped.
    pub async fn restart(&self, transport: impl Transport + 'static) -> Result<(), SessionError> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        self.call(|reply| Command::Restart(transport, reply)).await?
    }

    /// Tear the session down in order and fail every outstanding request.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] if the session already stopped.
    pub async fn shutdown(&self) -> Result<ShutdownReport, SessionError> {
        self.call(Command::Shutdown).await
    }

    /// Wait until the session reaches [`SessionState::Stopped`].
    pub async fn stopped(&self) { self.shared().closed.cancelled().await; }
}

/// Resolves once the session enters [`SessionState::Draining`].
async fn link_down(state: &mut watch::Receiver<SessionState>) {
    loop {
        if *state.borrow_and_update() == SessionState::Draining {
            return;
        }
        if state.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
