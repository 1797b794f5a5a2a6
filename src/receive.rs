//! Receive engine: reads PDUs from the transport and dispatches them.
//!
//! Every PDU is read with exactly two transport reads: the 48-byte BHS, then
//! the remainder whose length [`FrameLayout`] derives from that header. The
//! window fields are applied before dispatch; each dispatch branch consumes
//! the PDU, which returns its pool slot when it is finally dropped.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    byte_order::read_network_u32,
    completion::RequestError,
    error::{FramingError, TransportError},
    pdu::{
        BHS_LEN,
        Bhs,
        Opcode,
        Pdu,
        PoolClosed,
        codec::{self, FrameLayout},
    },
    sequence::{RESERVED_TAG, WindowUpdate},
    session::{SessionEvent, Shared},
    transport::Transport,
};

/// Byte offset of the AsyncEvent code in an Async Message BHS.
const ASYNC_EVENT_OFFSET: usize = 36;
/// Byte offset of the reason code in a Reject BHS.
const REJECT_REASON_OFFSET: usize = 2;
/// Byte offset of the ITT within a BHS echoed in a Reject data segment.
const REJECTED_ITT_OFFSET: usize = 16;

/// Connection-fatal failures of the receive path.
#[derive(Debug, Error)]
pub(crate) enum ReceiveError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),
}

pub(crate) struct Receiver {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    stop: CancellationToken,
    link: CancellationToken,
}

impl Receiver {
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
        debug!(session_id = %self.shared.id, "receive engine started");
        loop {
            let received = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                received = receive_one(&self.shared, self.transport.as_ref()) => received,
            };
            match received {
                Ok(pdu) => dispatch(&self.shared, pdu),
                Err(err) => {
                    if !self.stop.is_cancelled() {
                        crate::metrics::inc_errors();
                        warn!(session_id = %self.shared.id, error = %err, "receive failed; link down");
                        *self.shared.link_error() = Some(err.to_string());
                        self.link.cancel();
                    }
                    break;
                }
            }
        }
        debug!(session_id = %self.shared.id, "receive engine stopped");
    }
}

/// Read and decode one PDU, holding a pool slot for its lifetime.
pub(crate) async fn receive_one(shared: &Shared, transport: &dyn Transport) -> Result<Pdu, ReceiveError> {
    let slot = shared.pool.acquire().await?;
    let mut raw = [0u8; BHS_LEN];
    transport.recv_exact(&mut raw).await?;
    let header = Bhs::from(raw);
    let digests = &shared.config.digests;
    let layout = FrameLayout::from_header(&header, digests);
    layout.check_limit(shared.config.max_recv_data_segment_length as usize)?;

    let body = if layout.body_len() == 0 {
        Bytes::new()
    } else {
        let mut body = BytesMut::zeroed(layout.body_len());
        transport.recv_exact(&mut body).await?;
        body.freeze()
    };
    let mut pdu = codec::decode(header, body, digests)?;
    pdu.attach_slot(slot);
    shared.stats.record_received(layout.total_len());
    Ok(pdu)
}

/// Apply the window fields of `pdu`, then route it by opcode.
pub(crate) fn dispatch(shared: &Shared, pdu: Pdu) {
    let decoded = pdu.opcode();
    if !apply_window(shared, &pdu, decoded.ok()) {
        return;
    }
    let opcode = match decoded {
        Ok(op) if op.is_target_opcode() => op,
        Ok(op) => {
            warn!(opcode = %op, "unimplemented opcode");
            return;
        }
        Err(err) => {
            warn!(opcode = err.0, "unimplemented opcode");
            return;
        }
    };
    trace!(%opcode, itt = pdu.itt(), "pdu received");

    match opcode {
        Opcode::LoginResponse | Opcode::TextResponse | Opcode::LogoutResponse => {
            shared.queues.response.push_back(pdu);
        }
        Opcode::NopIn => on_nop_in(shared, pdu),
        Opcode::ScsiResponse | Opcode::TaskManagementResponse => {
            let itt = pdu.itt();
            match shared.held.remove(itt) {
                Some(request) => request.complete_with(pdu),
                None => unmatched(shared, opcode, itt),
            }
        }
        Opcode::DataIn => on_data_in(shared, pdu),
        Opcode::ReadyToTransfer => on_r2t(shared, &pdu),
        Opcode::Reject => on_reject(shared, &pdu),
        Opcode::AsyncMessage => on_async(shared, pdu),
        _ => warn!(opcode = %opcode, "unimplemented opcode"),
    }
}

/// Every inbound PDU carries ExpCmdSN and MaxCmdSN, whatever its opcode.
fn apply_window(shared: &Shared, pdu: &Pdu, opcode: Option<Opcode>) -> bool {
    let header = pdu.header();
    let carries_stat = opcode.is_some_and(|op| {
        op.is_target_opcode() && (op.carries_stat_sn() || (op == Opcode::DataIn && header.has_status()))
    });
    let update = WindowUpdate {
        max_cmd_sn: header.max_cmd_sn(),
        exp_cmd_sn: header.exp_cmd_sn(),
        stat_sn: carries_stat.then(|| header.stat_sn()),
    };
    let result = shared.tracker().observe_response(update);
    match result {
        Ok(window) => {
            if window > 0 {
                shared.wake.notify_one();
            }
            true
        }
        Err(err) => {
            shared.stats.record_window_rejection();
            warn!(?opcode, itt = pdu.itt(), error = %err, "dropping pdu with regressive window");
            false
        }
    }
}

fn unmatched(shared: &Shared, opcode: Opcode, itt: u32) {
    shared.stats.record_unmatched();
    warn!(%opcode, itt, "unmatched response");
}

fn on_nop_in(shared: &Shared, pdu: Pdu) {
    let (itt, ttt) = (pdu.itt(), pdu.header().ttt());
    match (itt == RESERVED_TAG, ttt == RESERVED_TAG) {
        (true, false) => {
            trace!(ttt, "answering target ping");
            shared.queues.immediate.push_back(pdu.into_nop_out_reply());
            shared.wake.notify_one();
        }
        (true, true) => trace!("discarding nop-in without tags"),
        (false, _) => match shared.pings.remove(&itt) {
            Some((_, waiter)) => {
                let mut reply = pdu;
                reply.release_slot();
                // The pinger may have timed out already.
                let _ = waiter.send(reply);
            }
            None => trace!(itt, "nop-in reply without waiter"),
        },
    }
}

fn on_data_in(shared: &Shared, pdu: Pdu) {
    let itt = pdu.itt();
    {
        let Some(mut request) = shared.held.get_mut(itt) else {
            unmatched(shared, Opcode::DataIn, itt);
            return;
        };
        if let Some(ctx) = request.context_mut() {
            ctx.append_data_in(pdu.data());
        }
    }
    // Without S the status follows in a SCSI Response.
    let header = pdu.header();
    if header.is_final() && header.has_status() {
        if let Some(request) = shared.held.remove(itt) {
            request.complete_with(pdu);
        }
    }
}

fn on_r2t(shared: &Shared, r2t: &Pdu) {
    let itt = r2t.itt();
    let payload = match shared.held.get_mut(itt) {
        Some(request) => request.context().and_then(|ctx| ctx.write_data().cloned()),
        None => {
            unmatched(shared, Opcode::ReadyToTransfer, itt);
            return;
        }
    };
    let Some(payload) = payload else {
        warn!(itt, "r2t for a request without write data");
        return;
    };
    let header = r2t.header();
    let burst = header.desired_length().min(shared.config.max_burst_length);
    let pdus = data_out_sequence(
        &payload,
        header,
        burst,
        shared.config.max_send_data_segment_length,
    );
    if pdus.is_empty() {
        warn!(itt, offset = header.buffer_offset(), "r2t outside the write payload");
        return;
    }
    debug!(itt, count = pdus.len(), "queueing data-out for r2t");
    for pdu in pdus {
        shared.queues.write_data.push_back(pdu);
    }
    shared.wake.notify_one();
}

/// Split the solicited range of `payload` into Data-Out PDUs.
///
/// The range starts at the R2T's buffer offset and spans `burst` bytes,
/// clipped to the payload; PDUs carry at most `max_segment` bytes each,
/// DataSN counts from zero and the last PDU has F set.
pub(crate) fn data_out_sequence(payload: &Bytes, r2t: &Bhs, burst: u32, max_segment: u32) -> Vec<Pdu> {
    let total = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let start = r2t.buffer_offset();
    let end = start.saturating_add(burst).min(total);
    let mut pdus = Vec::new();
    let mut pos = start;
    let mut data_sn = 0;
    while pos < end {
        let next = pos.saturating_add(max_segment.max(1)).min(end);
        let mut header = Bhs::new(Opcode::DataOut);
        header.set_final(next == end);
        header.set_lun(r2t.lun());
        header.set_itt(r2t.itt());
        header.set_ttt(r2t.ttt());
        header.set_data_sn(data_sn);
        header.set_buffer_offset(pos);
        match Pdu::new(header).with_data(payload.slice(pos as usize..next as usize)) {
            Ok(pdu) => pdus.push(pdu),
            Err(err) => {
                warn!(error = %err, "cannot frame data-out");
                return Vec::new();
            }
        }
        data_sn += 1;
        pos = next;
    }
    pdus
}

fn on_reject(shared: &Shared, pdu: &Pdu) {
    let data = pdu.data();
    let itt = if data.len() >= BHS_LEN {
        let mut field = [0u8; 4];
        field.copy_from_slice(&data[REJECTED_ITT_OFFSET..REJECTED_ITT_OFFSET + 4]);
        read_network_u32(field)
    } else {
        pdu.itt()
    };
    let reason = pdu.header().as_bytes()[REJECT_REASON_OFFSET];
    match shared.held.remove(itt) {
        Some(request) => {
            debug!(itt, reason, "request rejected by target");
            request.fail(RequestError::Rejected { reason });
        }
        None => unmatched(shared, Opcode::Reject, itt),
    }
}

fn on_async(shared: &Shared, pdu: Pdu) {
    let itt = pdu.itt();
    let event = pdu.header().as_bytes()[ASYNC_EVENT_OFFSET];
    if itt == RESERVED_TAG {
        debug!(event, "asynchronous message");
        shared.emit(SessionEvent::AsyncMessage {
            event,
            data: pdu.data().clone(),
        });
        return;
    }
    match shared.held.remove(itt) {
        Some(request) => request.fail(RequestError::Aborted { event }),
        None => unmatched(shared, Opcode::AsyncMessage, itt),
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        completion::RequestHandle,
        config::SessionConfig,
        pdu::PduPool,
        queue::QueueKind,
        session::SessionId,
    };

    #[fixture]
    fn shared() -> Shared {
        let shared = Shared::new(SessionId::next(), SessionConfig::default());
        shared
            .tracker()
            .observe_response(WindowUpdate {
                max_cmd_sn: 16,
                exp_cmd_sn: 1,
                stat_sn: Some(0),
            })
            .expect("initial window");
        shared
    }

    fn target_pdu(op: Opcode, itt: u32) -> Bhs {
        let mut header = Bhs::new(op);
        header.set_itt(itt);
        header.set_exp_cmd_sn(1);
        header.set_max_cmd_sn(16);
        header
    }

    fn hold(shared: &Shared, itt: u32, write_data: Option<Bytes>) -> RequestHandle {
        let mut request = Pdu::new(target_pdu(Opcode::ScsiCommand, itt));
        let handle = request.track(write_data);
        shared.held.insert(request);
        handle
    }

    #[rstest]
    #[tokio::test]
    async fn scsi_response_completes_held_request(shared: Shared) {
        let handle = hold(&shared, 3, None);
        dispatch(&shared, Pdu::new(target_pdu(Opcode::ScsiResponse, 3)));
        let completion = handle.await.expect("completed");
        assert_eq!(completion.response.opcode(), Ok(Opcode::ScsiResponse));
        assert!(shared.held.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn data_in_accumulates_until_final(shared: Shared) {
        let mut handle = hold(&shared, 5, None);
        let first = Pdu::new(target_pdu(Opcode::DataIn, 5))
            .with_data(Bytes::from_static(b"hello "))
            .expect("data");
        dispatch(&shared, first);
        assert!(shared.held.contains(5));
        assert!(futures::poll!(&mut handle).is_pending());

        let mut last = target_pdu(Opcode::DataIn, 5);
        last.set_final(true);
        last.set_status(true);
        let last = Pdu::new(last).with_data(Bytes::from_static(b"world")).expect("data");
        dispatch(&shared, last);
        let completion = handle.await.expect("completed");
        assert_eq!(completion.data.as_ref(), b"hello world");
    }

    #[rstest]
    #[tokio::test]
    async fn final_data_in_without_status_waits_for_response(shared: Shared) {
        let mut handle = hold(&shared, 6, None);
        let mut last = target_pdu(Opcode::DataIn, 6);
        last.set_final(true);
        let last = Pdu::new(last).with_data(Bytes::from_static(b"sense")).expect("data");
        dispatch(&shared, last);
        assert!(shared.held.contains(6));
        assert!(futures::poll!(&mut handle).is_pending());

        dispatch(&shared, Pdu::new(target_pdu(Opcode::ScsiResponse, 6)));
        let completion = handle.await.expect("completed");
        assert_eq!(completion.response.opcode(), Ok(Opcode::ScsiResponse));
        assert_eq!(completion.data.as_ref(), b"sense");
    }

    #[rstest]
    fn unmatched_response_changes_nothing(shared: Shared) {
        let _handle = hold(&shared, 1, None);
        dispatch(&shared, Pdu::new(target_pdu(Opcode::ScsiResponse, 99)));
        assert_eq!(shared.stats.snapshot().unmatched, 1);
        assert_eq!(shared.held.len(), 1);
        assert!(shared.queues.census().is_empty());
    }

    #[test]
    #[traced_test]
    fn unmatched_response_is_logged() {
        let shared = Shared::new(SessionId::next(), SessionConfig::default());
        dispatch(&shared, Pdu::new(target_pdu(Opcode::TaskManagementResponse, 42)));
        assert!(logs_contain("unmatched response"));
    }

    #[rstest]
    fn target_ping_is_answered_on_immediate_queue(shared: Shared) {
        let mut ping = target_pdu(Opcode::NopIn, RESERVED_TAG);
        ping.set_ttt(0x1234);
        dispatch(&shared, Pdu::new(ping));
        let reply = shared.queues.immediate.pop().expect("reply queued");
        assert_eq!(reply.opcode(), Ok(Opcode::NopOut));
        assert_eq!(reply.header().ttt(), 0x1234);
        assert_eq!(reply.itt(), RESERVED_TAG);
    }

    #[rstest]
    fn nop_in_without_tags_is_discarded(shared: Shared) {
        let mut nop = target_pdu(Opcode::NopIn, RESERVED_TAG);
        nop.set_ttt(RESERVED_TAG);
        dispatch(&shared, Pdu::new(nop));
        assert!(shared.queues.census().is_empty());
        assert_eq!(shared.stats.snapshot().unmatched, 0);
    }

    #[rstest]
    #[case::unknown(0x3c)]
    #[case::initiator_only(0x01)]
    fn dropped_opcodes_still_update_the_window(shared: Shared, #[case] first_byte: u8) {
        let mut raw = *target_pdu(Opcode::NopIn, 9).as_bytes();
        raw[0] = first_byte;
        let mut header = Bhs::from(raw);
        header.set_exp_cmd_sn(3);
        header.set_max_cmd_sn(40);
        header.set_stat_sn(7);
        dispatch(&shared, Pdu::new(header));

        let window = shared.tracker().snapshot();
        assert_eq!((window.exp_cmd, window.max_cmd), (3, 40));
        assert_eq!(window.stat, 0, "no StatSN without a known target opcode");
        assert!(shared.queues.census().is_empty());
    }

    #[rstest]
    fn regressive_window_drops_pdu(shared: Shared) {
        let handle = hold(&shared, 2, None);
        let mut bad = target_pdu(Opcode::ScsiResponse, 2);
        bad.set_exp_cmd_sn(10);
        bad.set_max_cmd_sn(5);
        dispatch(&shared, Pdu::new(bad));
        assert!(shared.held.contains(2));
        assert_eq!(shared.stats.snapshot().window_rejections, 1);
        drop(handle);
    }

    #[rstest]
    #[tokio::test]
    async fn reject_uses_embedded_itt(shared: Shared) {
        let handle = hold(&shared, 8, None);
        let mut reject = target_pdu(Opcode::Reject, RESERVED_TAG);
        reject.as_bytes_mut()[REJECT_REASON_OFFSET] = 0x09;
        let rejected = target_pdu(Opcode::ScsiCommand, 8);
        let pdu = Pdu::new(reject)
            .with_data(Bytes::copy_from_slice(rejected.as_bytes()))
            .expect("data");
        dispatch(&shared, pdu);
        assert_eq!(handle.await.err(), Some(RequestError::Rejected { reason: 0x09 }));
    }

    #[rstest]
    #[tokio::test]
    async fn async_message_aborts_matching_request(shared: Shared) {
        let handle = hold(&shared, 4, None);
        let mut msg = target_pdu(Opcode::AsyncMessage, 4);
        msg.as_bytes_mut()[ASYNC_EVENT_OFFSET] = 3;
        dispatch(&shared, Pdu::new(msg));
        assert_eq!(handle.await.err(), Some(RequestError::Aborted { event: 3 }));
    }

    #[rstest]
    #[tokio::test]
    async fn session_async_message_is_broadcast(shared: Shared) {
        let mut events = shared.subscribe();
        let mut msg = target_pdu(Opcode::AsyncMessage, RESERVED_TAG);
        msg.as_bytes_mut()[ASYNC_EVENT_OFFSET] = 1;
        dispatch(&shared, Pdu::new(msg));
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::AsyncMessage {
                event: 1,
                data: Bytes::new()
            }
        );
    }

    #[rstest]
    fn login_response_goes_to_response_queue(shared: Shared) {
        dispatch(&shared, Pdu::new(target_pdu(Opcode::LoginResponse, 0)));
        assert_eq!(shared.queues.census()[0].1, crate::pdu::Location::Queued(QueueKind::Response));
    }

    #[rstest]
    fn initiator_opcode_is_dropped(shared: Shared) {
        dispatch(&shared, Pdu::new(target_pdu(Opcode::ScsiCommand, 1)));
        assert!(shared.queues.census().is_empty());
    }

    #[rstest]
    #[case::single(1000, 0, 1000, 8192, vec![(0, 1000)])]
    #[case::split(20_000, 0, 20_000, 8192, vec![(0, 8192), (8192, 8192), (16_384, 3616)])]
    #[case::offset_burst(20_000, 4096, 6000, 4096, vec![(4096, 4096), (8192, 1904)])]
    #[case::clipped(1000, 600, 4096, 8192, vec![(600, 400)])]
    fn r2t_is_split_into_data_out(
        #[case] payload_len: usize,
        #[case] offset: u32,
        #[case] burst: u32,
        #[case] max_segment: u32,
        #[case] expected: Vec<(u32, usize)>,
    ) {
        let payload = Bytes::from(vec![7u8; payload_len]);
        let mut r2t = target_pdu(Opcode::ReadyToTransfer, 11);
        r2t.set_ttt(0xabc);
        r2t.set_buffer_offset(offset);
        let pdus = data_out_sequence(&payload, &r2t, burst, max_segment);
        let got: Vec<(u32, usize)> = pdus
            .iter()
            .map(|p| (p.header().buffer_offset(), p.data().len()))
            .collect();
        assert_eq!(got, expected);
        for (sn, pdu) in pdus.iter().enumerate() {
            let h = pdu.header();
            assert_eq!(h.data_sn() as usize, sn);
            assert_eq!(h.ttt(), 0xabc);
            assert_eq!(h.itt(), 11);
            assert_eq!(h.is_final(), sn == pdus.len() - 1);
        }
    }

    #[rstest]
    fn r2t_queues_write_data(shared: Shared) {
        let _handle = hold(&shared, 6, Some(Bytes::from(vec![1u8; 10_000])));
        let mut r2t = target_pdu(Opcode::ReadyToTransfer, 6);
        r2t.set_desired_length(10_000);
        dispatch(&shared, Pdu::new(r2t));
        assert_eq!(shared.queues.write_data.len(), 2);
        assert!(shared.held.contains(6));
    }

    #[rstest]
    #[tokio::test]
    async fn every_dispatch_path_returns_its_slot(shared: Shared) {
        let pool = PduPool::new(4);
        let _handle = hold(&shared, 1, None);
        let paths = [
            target_pdu(Opcode::ScsiResponse, 1),
            target_pdu(Opcode::ScsiResponse, 77),
            target_pdu(Opcode::DataIn, 42),
            target_pdu(Opcode::Reject, 5),
            target_pdu(Opcode::AsyncMessage, RESERVED_TAG),
            target_pdu(Opcode::ScsiCommand, 3),
        ];
        for header in paths {
            let mut pdu = Pdu::new(header);
            pdu.attach_slot(pool.acquire().await.expect("slot"));
            dispatch(&shared, pdu);
            assert_eq!(pool.available(), 4);
        }
    }
}
