//! Session configuration accepted and rejected at start.

use std::time::Duration;

use iscsi_initiator::{ConfigError, Session, SessionBuilder, SessionConfig, SessionError, SessionState};
use iscsi_testing::{TestResult, pair};
use rstest::rstest;

fn start(builder: SessionBuilder) -> Result<Session, SessionError> {
    let (transport, _target) = pair();
    builder.start(transport)
}

#[rstest]
#[case::tiny_recv_segment(
    Session::builder().max_recv_data_segment_length(128),
    ConfigError::InvalidSegmentLength { field: "max_recv_data_segment_length", value: 128 }
)]
#[case::oversized_send_segment(
    Session::builder().max_send_data_segment_length(1 << 24),
    ConfigError::InvalidSegmentLength { field: "max_send_data_segment_length", value: 1 << 24 }
)]
#[case::zero_burst(Session::builder().max_burst_length(0), ConfigError::InvalidBurstLength)]
#[case::single_slot_pool(Session::builder().pool_capacity(1), ConfigError::InvalidPoolCapacity(1))]
#[case::zero_idle(Session::builder().idle_interval(Duration::ZERO), ConfigError::ZeroDuration("idle_interval"))]
#[tokio::test]
async fn invalid_settings_are_rejected(#[case] builder: SessionBuilder, #[case] expected: ConfigError) {
    match start(builder) {
        Err(SessionError::Config(err)) => assert_eq!(err, expected),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[tokio::test]
async fn whole_config_can_be_supplied() -> TestResult {
    let config = SessionConfig {
        target_name: "iqn.2003-01.org.example:disk1".to_owned(),
        max_burst_length: 65_536,
        ..SessionConfig::default()
    };
    let session = start(Session::builder().config(config))?;
    assert_eq!(session.state(), SessionState::Starting);
    assert_eq!(session.config().target_name, "iqn.2003-01.org.example:disk1");
    assert_eq!(session.config().max_burst_length, 65_536);
    Ok(())
}

#[tokio::test]
async fn initial_cmd_sn_seeds_the_window() -> TestResult {
    let session = start(Session::builder().initial_cmd_sn(0xffff_fffe))?;
    let window = session.window();
    assert_eq!(window.cmd, 0xffff_fffe);
    assert_eq!(window.exp_cmd, 0xffff_fffe);
    assert_eq!(window.window, 1);
    Ok(())
}
