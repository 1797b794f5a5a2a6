//! Tests for the `SessionRegistry`.

use std::sync::Arc;

use iscsi_initiator::{Session, SessionId, SessionRegistry, SessionState};
use iscsi_testing::{TargetHandle, TestResult, pair};
use rstest::{fixture, rstest};

mod common;

#[expect(
    unused_braces,
    reason = "rustc false positive for single-line rstest fixtures"
)]
#[allow(unfulfilled_lint_expectations)]
#[fixture]
fn registry() -> Arc<SessionRegistry> { Arc::new(SessionRegistry::default()) }

fn register(registry: &Arc<SessionRegistry>) -> TestResult<(Session, TargetHandle)> {
    let (transport, target) = pair();
    let session = Session::builder().registry(Arc::clone(registry)).start(transport)?;
    Ok((session, target))
}

/// Sessions can be looked up while a handle is alive.
#[rstest]
#[tokio::test]
async fn session_retrieved_while_alive(registry: Arc<SessionRegistry>) -> TestResult {
    let (session, _target) = register(&registry)?;
    let found = registry.get(&session.id()).ok_or("session should be registered")?;
    assert_eq!(found.id(), session.id());
    assert_eq!(registry.active_ids(), vec![session.id()]);
    Ok(())
}

/// Shutdown removes the entry.
#[rstest]
#[tokio::test]
async fn shutdown_deregisters(registry: Arc<SessionRegistry>) -> TestResult {
    let (session, _target) = register(&registry)?;
    session.shutdown().await?;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(registry.get(&session.id()).is_none());
    assert!(registry.is_empty());
    Ok(())
}

/// Entries for dropped sessions disappear once the session stops.
#[rstest]
#[tokio::test]
async fn dropped_sessions_are_pruned(registry: Arc<SessionRegistry>) -> TestResult {
    let (kept, _kept_target) = register(&registry)?;
    let (dropped, _dropped_target) = register(&registry)?;
    let dropped_id = dropped.id();
    drop(dropped);

    assert!(registry.get(&dropped_id).is_none());
    common::eventually(|| registry.len() == 1).await?;
    assert_eq!(registry.active_ids(), vec![kept.id()]);
    Ok(())
}

#[rstest]
fn unknown_id_is_absent(registry: Arc<SessionRegistry>) {
    assert!(registry.get(&SessionId::from(u64::MAX)).is_none());
    registry.prune();
    assert!(registry.is_empty());
}
