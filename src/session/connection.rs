//! Engines bound to one transport, and their ordered teardown.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Shared, shutdown::ShutdownReport, state::ShutdownStep};
use crate::{receive::Receiver, transmit::Transmitter, transport::Transport};

struct EngineTask {
    name: &'static str,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl EngineTask {
    /// Request a stop and wait up to `limit`, aborting the task on expiry.
    ///
    /// Returns `true` when the task exited by itself.
    async fn stop(self, limit: Duration) -> bool {
        self.stop.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(limit, self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                log::warn!("engine task failed: engine={}, error={err}", self.name);
                true
            }
            Err(_) => {
                abort.abort();
                log::warn!("engine did not stop in time; aborted: engine={}", self.name);
                false
            }
        }
    }
}

/// A live transport with its receive and transmit engines.
pub(super) struct Connection {
    transport: Arc<dyn Transport>,
    link: CancellationToken,
    receive: EngineTask,
    transmit: EngineTask,
}

impl Connection {
    pub(super) fn start(shared: &Arc<Shared>, transport: Arc<dyn Transport>) -> Self {
        let link = CancellationToken::new();
        let receive_stop = CancellationToken::new();
        let transmit_stop = CancellationToken::new();
        let receiver = Receiver::new(
            Arc::clone(shared),
            Arc::clone(&transport),
            receive_stop.clone(),
            link.clone(),
        );
        let transmitter = Transmitter::new(
            Arc::clone(shared),
            Arc::clone(&transport),
            transmit_stop.clone(),
            link.clone(),
        );
        Self {
            receive: EngineTask {
                name: "receive",
                stop: receive_stop,
                handle: tokio::spawn(receiver.run()),
            },
            transmit: EngineTask {
                name: "transmit",
                stop: transmit_stop,
                handle: tokio::spawn(transmitter.run()),
            },
            transport,
            link,
        }
    }

    /// Token cancelled by either engine when the connection fails.
    pub(super) fn link(&self) -> CancellationToken { self.link.clone() }
}

/// Stop the engines and release the transport, in order: receive engine,
/// transport read side, transmit engine, transport.
///
/// Every step is reported even when there is no connection left to act on.
pub(super) async fn teardown(connection: Option<Connection>, shared: &Shared, report: &mut ShutdownReport) {
    let limit = shared.config.stop_timeout;
    let Some(Connection {
        transport,
        receive,
        transmit,
        ..
    }) = connection
    else {
        for step in [
            ShutdownStep::ReceiveStopped,
            ShutdownStep::ReadShutdown,
            ShutdownStep::TransmitStopped,
            ShutdownStep::TransportClosed,
        ] {
            report.record(shared, step);
        }
        return;
    };

    report.receive_aborted = !receive.stop(limit).await;
    report.record(shared, ShutdownStep::ReceiveStopped);

    if let Err(err) = transport.shutdown_read().await {
        log::debug!("read shutdown failed: session_id={}, error={err}", shared.id);
    }
    report.record(shared, ShutdownStep::ReadShutdown);

    report.transmit_aborted = !transmit.stop(limit).await;
    report.record(shared, ShutdownStep::TransmitStopped);

    if let Err(err) = transport.close().await {
        log::debug!("transport close failed: session_id={}, error={err}", shared.id);
    }
    drop(transport);
    report.record(shared, ShutdownStep::TransportClosed);
}
