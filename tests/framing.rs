//! Digests and malformed frames on a live session.

use std::time::Duration;

use bytes::Bytes;
use iscsi_initiator::{
    Opcode,
    Session,
    SessionEvent,
    SessionState,
    digest::Digests,
    pdu::{Bhs, codec},
};
use iscsi_testing::{
    TestResult,
    complete_expect,
    pdus::{self, Window},
    sent_expect,
};
use tokio::sync::broadcast;

mod common;

fn fold_digest(bytes: &[u8], seed: u32) -> u32 {
    bytes.iter().fold(seed, |acc, b| acc.rotate_left(5) ^ u32::from(*b))
}

fn zero_digest(_: &[u8], _: u32) -> u32 { 0 }

fn digests(f: fn(&[u8], u32) -> u32) -> Digests {
    Digests {
        header: Some(f),
        data: Some(f),
    }
}

async fn link_down_reason(events: &mut broadcast::Receiver<SessionEvent>) -> TestResult<String> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::LinkDown { reason }) => return Some(reason),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    };
    Ok(tokio::time::timeout(Duration::from_secs(1), wait)
        .await?
        .ok_or("event channel closed")?)
}

#[tokio::test]
async fn digested_session_exchanges_pdus() -> TestResult {
    let (session, target) = common::start_with(Session::builder().digests(digests(fold_digest)))?;
    let target = target.with_digests(digests(fold_digest));
    common::login(&session, &target, Window::new(1, 16)).await?;

    let handle = session.submit(pdus::scsi_command())?;
    let itt = sent_expect!(target).itt();
    target.push(&pdus::data_in(itt, 0, 0, b"digested", true, Window::new(2, 16).stat(2)));
    let completion = complete_expect!(handle)?;
    assert_eq!(completion.data, Bytes::from_static(b"digested"));
    assert_eq!(session.state(), SessionState::Running);
    Ok(())
}

#[tokio::test]
async fn header_digest_mismatch_drops_the_link() -> TestResult {
    let (session, target) = common::start_with(Session::builder().digests(digests(fold_digest)))?;
    let target = target.with_digests(digests(fold_digest));
    common::login(&session, &target, Window::new(1, 16)).await?;
    let mut events = session.events();

    let frame = codec::encode(&pdus::nop_in_update(Window::new(1, 16).stat(2)), &digests(zero_digest));
    target.push_raw(frame.to_bytes());

    let reason = link_down_reason(&mut events).await?;
    assert!(reason.contains("header digest mismatch"), "unexpected reason: {reason}");
    common::wait_for_state(&session, SessionState::Draining).await?;
    Ok(())
}

#[tokio::test]
async fn oversized_segment_drops_the_link() -> TestResult {
    let (session, target) = common::running(Window::new(1, 16)).await?;
    let mut events = session.events();

    let mut header = Bhs::new(Opcode::ScsiResponse);
    header.set_data_segment_length(session.config().max_recv_data_segment_length + 4);
    target.push_raw(Bytes::copy_from_slice(header.as_bytes()));

    let reason = link_down_reason(&mut events).await?;
    assert!(reason.contains("exceeds max length"), "unexpected reason: {reason}");
    assert_eq!(session.stats().pdus_received, 1);
    Ok(())
}
