//! Transmit engine: drains the send queues onto the transport.
//!
//! Each iteration picks one PDU in strict priority order:
//!
//! 1. the immediate queue,
//! 2. the write-data queue (full-feature phase only),
//! 3. the command queue (full-feature phase only), gated by the command
//!    window unless the head already carries a CmdSN from an earlier
//!    attempt.
//!
//! Tracked requests move into the held-request table before they are
//! written so a response can never arrive for an unknown task. When nothing
//! is eligible the engine parks until woken or until the idle interval
//! elapses, at which point it asks the target to reopen a closed window with a NOP-Out.

use std::sync::Arc;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{ErrorClass, TransportError},
    pdu::{Bhs, Opcode, Pdu, codec, opcode::FINAL_FLAG},
    queue::QueueSet,
    sequence::{RESERVED_TAG, SequenceTracker},
    session::Shared,
    transport::Transport,
};

/// Result of handing one PDU to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written in full.
    Sent,
    /// Put back at the head of its queue; the link is still usable.
    Requeued,
    /// The connection is unusable; the PDU was requeued or failed.
    LinkDown,
}

pub(crate) struct Transmitter {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    stop: CancellationToken,
    link: CancellationToken,
}

impl Transmitter {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: Arc<dyn Transport>,
        stop: CancellationToken,
        link: CancellationToken,
    ) -> Self {
        Self {
            shared,
            transport,
            stop,
            link,
        }
    }

    pub(crate) async fn run(self) {
        debug!(session_id = %self.shared.id, "transmit engine started");
        while !self.stop.is_cancelled() {
            if let Some(pdu) = next_eligible(&self.shared) {
                match send_one(&self.shared, self.transport.as_ref(), pdu).await {
                    SendOutcome::Sent => {}
                    SendOutcome::Requeued => tokio::task::yield_now().await,
                    SendOutcome::LinkDown => {
                        self.link.cancel();
                        break;
                    }
                }
                continue;
            }
            let idle = timeout(self.shared.config.idle_interval, self.shared.wake.notified());
            tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                woken = idle => {
                    if woken.is_err() {
                        self.on_idle();
                    }
                }
            }
        }
        debug!(session_id = %self.shared.id, "transmit engine stopped");
    }

    /// Nudge a closed window open by asking the target to re-advertise it.
    fn on_idle(&self) {
        if self.link.is_cancelled() || self.shared.tracker().window() != 0 {
            return;
        }
        let itt = self.shared.tracker().next_itt();
        self.shared.enqueue(nop_out(itt));
        self.shared.stats.record_idle_nop();
        debug!(session_id = %self.shared.id, itt, "window closed while idle; sent nop-out");
    }
}

/// Build an immediate NOP-Out soliciting a NOP-In reply under `itt`.
pub(crate) fn nop_out(itt: u32) -> Pdu {
    let mut header = Bhs::new(Opcode::NopOut);
    header.set_immediate(true);
    header.set_flags(FINAL_FLAG);
    header.set_itt(itt);
    header.set_ttt(RESERVED_TAG);
    Pdu::new(header)
}

/// Pop the next PDU the session is allowed to send and stamp it.
pub(crate) fn next_eligible(shared: &Shared) -> Option<Pdu> {
    let mut tracker = shared.tracker();
    let mut pdu = shared.queues.immediate.pop().or_else(|| {
        if !shared.is_full_feature() {
            return None;
        }
        shared.queues.write_data.pop().or_else(|| {
            let open = tracker.window_open();
            shared.queues.command.pop_if(|head| head.is_sequenced() || open)
        })
    })?;
    stamp(&mut pdu, &mut tracker);
    Some(pdu)
}

/// Assign CmdSN once per connection and refresh ExpStatSN.
fn stamp(pdu: &mut Pdu, tracker: &mut SequenceTracker) {
    let is_command = pdu.opcode().is_ok_and(Opcode::is_command);
    if is_command && !pdu.is_sequenced() {
        let immediate = pdu.header().is_immediate();
        let sn = tracker.admit_command(immediate);
        pdu.header_mut().set_cmd_sn(sn);
        pdu.mark_sequenced(true);
    }
    let exp_stat_sn = tracker.exp_stat_sn();
    pdu.header_mut().set_exp_stat_sn(exp_stat_sn);
}

/// Frame `pdu` and write it, applying the recovery table on failure.
pub(crate) async fn send_one(shared: &Shared, transport: &dyn Transport, pdu: Pdu) -> SendOutcome {
    let frame = codec::encode(&pdu, &shared.config.digests);
    let itt = pdu.itt();
    let tracked = pdu.is_tracked();
    let mut local = if tracked {
        if let Some(displaced) = shared.held.insert(pdu) {
            warn!(itt, "initiator task tag reused while in flight");
            displaced.fail(crate::completion::RequestError::RetryRequired);
        }
        None
    } else {
        Some(pdu)
    };

    let err = match transport.send(frame.segments()).await {
        Ok(()) => {
            shared.stats.record_sent(frame.len());
            trace!(itt, len = frame.len(), "pdu sent");
            return SendOutcome::Sent;
        }
        Err(err) => err,
    };

    if tracked {
        local = shared.held.remove(itt);
    }
    let class = err.class();
    log_send_failure(shared, itt, &err, class);
    let Some(pdu) = local else {
        // The response arrived before the write reported failure.
        return outcome_for(class);
    };
    if class == ErrorClass::Hard && pdu.is_tracked() {
        pdu.fail(crate::completion::RequestError::RetryRequired);
    } else {
        let kind = QueueSet::route(&pdu);
        shared.queues.get(kind).push_front(pdu);
    }
    outcome_for(class)
}

fn outcome_for(class: ErrorClass) -> SendOutcome {
    match class {
        ErrorClass::Ephemeral => SendOutcome::Requeued,
        ErrorClass::BrokenPipe | ErrorClass::Hard => SendOutcome::LinkDown,
    }
}

fn log_send_failure(shared: &Shared, itt: u32, err: &TransportError, class: ErrorClass) {
    if class == ErrorClass::Ephemeral {
        debug!(session_id = %shared.id, itt, error = %err, "transient send failure; requeued");
    } else {
        crate::metrics::inc_errors();
        warn!(session_id = %shared.id, itt, error = %err, ?class, "send failed; link down");
        *shared.link_error() = Some(err.to_string());
    }
}
