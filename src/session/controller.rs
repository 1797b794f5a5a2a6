//! The session controller actor.
//!
//! The controller task owns the transport and the engine tasks. Session
//! handles talk to it through a command channel; engines report connection
//! failure by cancelling the connection's link token. Every lifecycle
//! transition therefore happens on this one task.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{
    SessionEvent,
    SessionRegistry,
    SessionState,
    Shared,
    connection::{self, Connection},
    shutdown::ShutdownReport,
    stats::SessionLease,
    state::ShutdownStep,
};
use crate::{
    config::CmdSnPolicy,
    error::SessionError,
    pdu::{Opcode, Pdu},
    transport::{Connector, Transport},
};

pub(super) enum Command {
    FullFeature(oneshot::Sender<Result<(), SessionError>>),
    Restart(Arc<dyn Transport>, oneshot::Sender<Result<(), SessionError>>),
    Shutdown(oneshot::Sender<ShutdownReport>),
}

enum Recovery {
    /// A new transport is attached.
    Restored,
    /// No connector; wait for an explicit restart or shutdown.
    Waiting,
    /// A restart or shutdown arrived while backing off.
    Interrupted(Option<Command>),
    /// Every attempt failed and the session has stopped.
    Exhausted,
}

pub(super) struct Controller {
    pub(super) shared: Arc<Shared>,
    pub(super) commands: mpsc::Receiver<Command>,
    pub(super) connection: Option<Connection>,
    pub(super) connector: Option<Arc<dyn Connector>>,
    pub(super) registry: Option<Arc<SessionRegistry>>,
    pub(super) lease: Option<SessionLease>,
}

async fn link_lost(link: Option<tokio_util::sync::CancellationToken>) {
    match link {
        Some(token) => token.cancelled_owned().await,
        None => std::future::pending().await,
    }
}

impl Controller {
    pub(super) async fn run(mut self) {
        loop {
            let link = self.connection.as_ref().map(Connection::link);
            let next = tokio::select! {
                biased;
                command = self.commands.recv() => command,
                () = link_lost(link) => match self.recover().await {
                    Recovery::Restored | Recovery::Waiting => continue,
                    Recovery::Interrupted(command) => command,
                    Recovery::Exhausted => return,
                },
            };
            match next {
                Some(Command::FullFeature(reply)) => {
                    let _ = reply.send(self.enter_full_feature());
                }
                Some(Command::Restart(transport, reply)) => {
                    let result = self.restart(transport).await;
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown(reply)) => {
                    let report = self.shutdown().await;
                    let _ = reply.send(report);
                    return;
                }
                None => {
                    log::debug!("all session handles dropped: session_id={}", self.shared.id);
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    fn enter_full_feature(&self) -> Result<(), SessionError> {
        match self.shared.state() {
            SessionState::Starting | SessionState::Restarting => {
                self.shared.set_full_feature(true);
                self.shared.set_state(SessionState::Running);
                Ok(())
            }
            SessionState::Running => Ok(()),
            other => Err(SessionError::InvalidState(other)),
        }
    }

    /// Stop the engines, release the transport and park in-flight work.
    async fn detach(&mut self) {
        self.shared.set_full_feature(false);
        let mut report = ShutdownReport::default();
        connection::teardown(self.connection.take(), &self.shared, &mut report).await;
        self.requeue_in_flight();
        self.shared.set_state(SessionState::Draining);
    }

    /// Move held requests back to the head of their queues and discard
    /// traffic that only made sense on the old connection.
    ///
    /// Data-Out is solicited again by R2T once the command is resent.
    /// Dropped control requests are announced; ping waiters fail.
    fn requeue_in_flight(&self) {
        let stale = self.shared.queues.write_data.drain().len();
        let mut pending = self.shared.held.drain();
        let (tracked, untracked): (Vec<Pdu>, Vec<Pdu>) = self
            .shared
            .queues
            .immediate
            .drain()
            .into_iter()
            .partition(Pdu::is_tracked);
        pending.extend(tracked);
        self.shared.pings.clear();
        log::debug!(
            "requeueing in-flight requests: session_id={}, requeued={}, discarded={}",
            self.shared.id,
            pending.len(),
            stale + untracked.len(),
        );
        for pdu in &untracked {
            if let Ok(opcode @ (Opcode::Login | Opcode::Text | Opcode::Logout)) = pdu.opcode() {
                log::warn!(
                    "control request dropped with the link: session_id={}, itt={}, opcode={opcode}",
                    self.shared.id,
                    pdu.itt()
                );
                self.shared.emit(SessionEvent::ControlDiscarded { itt: pdu.itt(), opcode });
            }
        }
        self.shared.requeue_front(pending);
    }

    async fn on_link_lost(&mut self) {
        let reason = self
            .shared
            .link_error()
            .take()
            .unwrap_or_else(|| "connection lost".to_owned());
        log::warn!("link down: session_id={}, reason={reason}", self.shared.id);
        self.shared.mark_link_lost(true);
        self.detach().await;
        self.shared.emit(SessionEvent::LinkDown { reason });
    }

    async fn recover(&mut self) -> Recovery {
        self.on_link_lost().await;
        let Some(connector) = self.connector.clone() else {
            return Recovery::Waiting;
        };
        let delays = self.shared.config.reconnect.delays();
        for (attempt, delay) in (1u32..).zip(delays) {
            if let Some(command) = self.back_off(delay).await {
                return Recovery::Interrupted(command);
            }
            match connector.connect().await {
                Ok(transport) => {
                    log::info!(
                        "reconnected: session_id={}, attempt={attempt}",
                        self.shared.id
                    );
                    self.attach(transport);
                    self.shared.emit(SessionEvent::Reconnected { attempt });
                    return Recovery::Restored;
                }
                Err(err) => log::warn!(
                    "reconnect attempt failed: session_id={}, attempt={attempt}, error={err}",
                    self.shared.id
                ),
            }
        }
        log::warn!("reconnect attempts exhausted: session_id={}", self.shared.id);
        let mut report = ShutdownReport::default();
        connection::teardown(None, &self.shared, &mut report).await;
        self.finish(&mut report);
        Recovery::Exhausted
    }

    /// Sleep for `delay`, answering commands that leave the back-off
    /// schedule intact. Returns a command that ends it: a restart, a
    /// shutdown, or `None` once every handle is gone.
    async fn back_off(&mut self, delay: std::time::Duration) -> Option<Option<Command>> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::FullFeature(reply)) => {
                        let _ = reply.send(self.enter_full_feature());
                    }
                    other => return Some(other),
                },
                () = &mut sleep => return None,
            }
        }
    }

    /// Start engines on `transport` and re-enter the login phase.
    fn attach(&mut self, transport: Arc<dyn Transport>) {
        for queue in [&self.shared.queues.immediate, &self.shared.queues.command] {
            let mut pending = queue.drain();
            for pdu in &mut pending {
                pdu.mark_sequenced(false);
            }
            queue.push_front_all(pending);
        }
        if self.shared.config.cmd_sn_policy == CmdSnPolicy::ResyncToTarget {
            self.shared.tracker().resync_to_target();
        }
        self.shared.mark_link_lost(false);
        self.shared.stats.record_restart();
        self.connection = Some(Connection::start(&self.shared, transport));
        self.shared.set_state(SessionState::Restarting);
    }

    async fn restart(&mut self, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        let state = self.shared.state();
        if !state.accepts_requests() {
            return Err(SessionError::Stopped);
        }
        if state.has_link() {
            self.detach().await;
        }
        self.attach(transport);
        Ok(())
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        connection::teardown(self.connection.take(), &self.shared, &mut report).await;
        self.finish(&mut report);
        log::info!(
            "session stopped: session_id={}, flushed={}",
            self.shared.id,
            report.flushed
        );
        report
    }

    /// Fail outstanding work and release session resources.
    fn finish(&mut self, report: &mut ShutdownReport) {
        self.shared.set_full_feature(false);
        // Refuse new submissions before flushing so none slip in behind.
        self.shared.closed.cancel();
        let err = self.shared.flush_error();
        report.flushed = self.shared.flush(&err);
        self.shared.pool.close();
        report.record(&self.shared, ShutdownStep::QueuesFlushed);

        if let Some(registry) = self.registry.take() {
            registry.remove(&self.shared.id);
        }
        self.lease.take();
        report.record(&self.shared, ShutdownStep::ResourcesReleased);
        self.shared.set_state(SessionState::Stopped);
    }
}
