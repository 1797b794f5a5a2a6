//! Shared helpers for session integration tests.
//!
//! Provides a fixture starting a session against a scripted target and a
//! helper performing the login exchange so tests begin in full-feature
//! phase.

#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::time::Duration;

use iscsi_initiator::{Session, SessionBuilder, SessionState, pdu::Pdu};
use iscsi_testing::{
    ScriptedTransport,
    TargetHandle,
    TestResult,
    pair,
    pdus::{self, Window},
    sent_expect,
};

/// Start a session built by `builder` on a fresh scripted connection.
pub fn start_with(builder: SessionBuilder) -> TestResult<(Session, TargetHandle)> {
    let (transport, target) = pair();
    let session = builder.start(transport)?;
    Ok((session, target))
}

/// Start a session with default settings.
pub fn start() -> TestResult<(Session, TargetHandle)> { start_with(Session::builder()) }

/// Exchange a login request and response advertising `window`, then enter
/// full-feature phase.
pub async fn login(session: &Session, target: &TargetHandle, window: Window) -> TestResult<Pdu> {
    let itt = session.send_control(pdus::login_request())?;
    let request = sent_expect!(target, "login request");
    assert_eq!(request.itt(), itt);
    target.push(&pdus::login_response(itt, window));
    let response = session.recv_response().await?;
    session.enter_full_feature().await?;
    assert_eq!(session.state(), SessionState::Running);
    Ok(response)
}

/// Start a default session and log in with `window`.
pub async fn running(window: Window) -> TestResult<(Session, TargetHandle)> {
    let (session, target) = start()?;
    login(&session, &target, window).await?;
    Ok((session, target))
}

/// A fresh scripted connection for restarts.
pub fn reconnect() -> (ScriptedTransport, TargetHandle) { pair() }

/// Poll `condition` until it holds, failing after one second.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> TestResult {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err("condition not met within one second".into());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Wait for the session to reach `state`.
pub async fn wait_for_state(session: &Session, state: SessionState) -> TestResult {
    let mut watch = session.watch_state();
    tokio::time::timeout(Duration::from_secs(1), watch.wait_for(|s| *s == state)).await??;
    Ok(())
}
