//! Write payloads served in response to R2T.

use std::time::Duration;

use bytes::Bytes;
use iscsi_initiator::{Opcode, Session, pdu::Pdu};
use iscsi_testing::{
    TargetHandle,
    TestResult,
    complete_expect,
    pdus::{self, Window},
    sent_expect,
};
use rstest::rstest;

mod common;

fn payload(len: usize) -> Bytes {
    (0..len)
        .map(|n| u8::try_from(n % 251).unwrap_or_default())
        .collect::<Vec<u8>>()
        .into()
}

async fn data_out(target: &TargetHandle, count: usize) -> Vec<Pdu> {
    let mut pdus = Vec::with_capacity(count);
    for _ in 0..count {
        pdus.push(sent_expect!(target, "data-out"));
    }
    pdus
}

#[tokio::test]
async fn r2t_is_answered_with_split_data_out() -> TestResult {
    let builder = Session::builder()
        .max_send_data_segment_length(4096)
        .max_burst_length(8192);
    let (session, target) = common::start_with(builder)?;
    common::login(&session, &target, Window::new(1, 16)).await?;

    let body = payload(10_000);
    let handle = session.submit_write(pdus::scsi_command(), body.clone())?;
    let command = sent_expect!(target);
    let itt = command.itt();
    assert!(command.data().is_empty());

    target.push(&pdus::r2t(itt, 0x51, 0, 10_000, Window::new(2, 16).stat(2)));
    let burst = data_out(&target, 2).await;
    let lens: Vec<usize> = burst.iter().map(|pdu| pdu.data().len()).collect();
    assert_eq!(lens, vec![4096, 4096]);
    for (n, pdu) in burst.iter().enumerate() {
        let header = pdu.header();
        let sn = u32::try_from(n)?;
        assert_eq!(pdu.opcode(), Ok(Opcode::DataOut));
        assert_eq!(pdu.itt(), itt);
        assert_eq!(header.ttt(), 0x51);
        assert_eq!(header.data_sn(), sn);
        assert_eq!(header.buffer_offset(), sn * 4096);
        assert_eq!(header.is_final(), n == 1);
        assert_eq!(header.exp_stat_sn(), 3);
    }
    assert_eq!(burst[0].data(), &body.slice(..4096));

    target.push(&pdus::r2t(itt, 0x52, 8192, 10_000 - 8192, Window::new(2, 16).stat(3)));
    let tail = data_out(&target, 1).await;
    assert_eq!(tail[0].header().buffer_offset(), 8192);
    assert_eq!(tail[0].header().data_sn(), 0);
    assert!(tail[0].header().is_final());
    assert_eq!(tail[0].data(), &body.slice(8192..));

    target.push(&pdus::scsi_response(itt, Window::new(2, 16).stat(4)));
    complete_expect!(handle)?;
    Ok(())
}

#[rstest]
#[case::offset_past_payload(20_000, 512)]
#[case::zero_length(0, 0)]
#[tokio::test]
async fn r2t_outside_payload_sends_nothing(#[case] offset: u32, #[case] length: u32) -> TestResult {
    let (session, target) = common::running(Window::new(1, 16)).await?;
    let _handle = session.submit_write(pdus::scsi_command(), payload(1024))?;
    let itt = sent_expect!(target).itt();

    target.push(&pdus::r2t(itt, 0x60, offset, length, Window::new(2, 16).stat(2)));
    common::eventually(|| session.stats().pdus_received == 2).await?;
    assert!(target.next_sent_within(Duration::from_millis(50)).await.is_none());
    assert_eq!(session.in_flight(), 1);
    Ok(())
}

#[tokio::test]
async fn r2t_for_unknown_task_is_unmatched() -> TestResult {
    let (session, target) = common::running(Window::new(1, 16)).await?;
    target.push(&pdus::r2t(0x4242, 0x61, 0, 512, Window::new(1, 16).stat(2)));
    common::eventually(|| session.stats().unmatched == 1).await?;
    assert!(target.next_sent_within(Duration::from_millis(50)).await.is_none());
    Ok(())
}
