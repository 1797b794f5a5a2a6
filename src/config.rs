//! Session configuration.
//!
//! [`SessionConfig`] holds the negotiated limits and local policy for one
//! session. Values arrive from login negotiation or a configuration file, so
//! the struct is plain data with serde support; [`SessionConfig::validated`]
//! rejects values the engines cannot operate with.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::{backoff::BackoffConfig, byte_order::MAX_U24, digest::Digests, error::ConfigError};

/// Smallest data-segment limit a peer may negotiate.
pub const MIN_DATA_SEGMENT_LENGTH: u32 = 512;
/// Default `MaxRecvDataSegmentLength` and `MaxSendDataSegmentLength`.
pub const DEFAULT_DATA_SEGMENT_LENGTH: u32 = 8192;
/// Default `MaxBurstLength`.
pub const DEFAULT_MAX_BURST_LENGTH: u32 = 262_144;
/// Default PDU pool capacity.
pub const DEFAULT_POOL_CAPACITY: usize = 64;
/// Default idle interval before the transmit engine sends a window-reopening NOP-Out.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);
/// Default bound on waiting for an engine to stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const_assert!(MIN_DATA_SEGMENT_LENGTH <= DEFAULT_DATA_SEGMENT_LENGTH);
const_assert!(DEFAULT_DATA_SEGMENT_LENGTH <= MAX_U24);
const_assert!(DEFAULT_POOL_CAPACITY >= 2);

/// How CmdSN numbering continues after a connection is restarted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdSnPolicy {
    /// Keep counting; requeued commands receive fresh CmdSNs.
    #[default]
    Continue,
    /// Rewind to the target's last `ExpCmdSN` before resending.
    ResyncToTarget,
}

/// Configuration for one session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// iSCSI qualified name of the target.
    pub target_name: String,
    /// `host:port` of the target portal.
    pub target_address: String,
    pub max_burst_length: u32,
    pub max_recv_data_segment_length: u32,
    pub max_send_data_segment_length: u32,
    pub pool_capacity: usize,
    pub idle_interval: Duration,
    pub stop_timeout: Duration,
    pub initial_cmd_sn: u32,
    pub cmd_sn_policy: CmdSnPolicy,
    pub reconnect: BackoffConfig,
    /// Digest hooks; set in code, never serialized.
    #[serde(skip)]
    pub digests: Digests,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_name: String::new(),
            target_address: "127.0.0.1:3260".to_owned(),
            max_burst_length: DEFAULT_MAX_BURST_LENGTH,
            max_recv_data_segment_length: DEFAULT_DATA_SEGMENT_LENGTH,
            max_send_data_segment_length: DEFAULT_DATA_SEGMENT_LENGTH,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            initial_cmd_sn: 1,
            cmd_sn_policy: CmdSnPolicy::default(),
            reconnect: BackoffConfig::default(),
            digests: Digests::none(),
        }
    }
}

impl SessionConfig {
    /// Check every limit, returning the configuration unchanged when valid.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    ///
    /// # Examples
    ///
    /// ```
    /// use iscsi_initiator::config::SessionConfig;
    ///
    /// let cfg = SessionConfig {
    ///     pool_capacity: 1,
    ///     ..SessionConfig::default()
    /// };
    /// assert!(cfg.validated().is_err());
    /// ```
    pub fn validated(self) -> Result<Self, ConfigError> {
        check_segment("max_recv_data_segment_length", self.max_recv_data_segment_length)?;
        check_segment("max_send_data_segment_length", self.max_send_data_segment_length)?;
        if self.max_burst_length == 0 {
            return Err(ConfigError::InvalidBurstLength);
        }
        if self.pool_capacity < 2 {
            return Err(ConfigError::InvalidPoolCapacity(self.pool_capacity));
        }
        if self.idle_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("idle_interval"));
        }
        if self.stop_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("stop_timeout"));
        }
        Ok(Self {
            reconnect: self.reconnect.normalized(),
            ..self
        })
    }
}

fn check_segment(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if (MIN_DATA_SEGMENT_LENGTH..=MAX_U24).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidSegmentLength { field, value })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde::de::{IntoDeserializer, value::StrDeserializer};

    use super::*;

    #[test]
    fn defaults_are_valid() { assert!(SessionConfig::default().validated().is_ok()); }

    #[rstest]
    #[case::tiny_recv(
        SessionConfig { max_recv_data_segment_length: 100, ..SessionConfig::default() },
        ConfigError::InvalidSegmentLength { field: "max_recv_data_segment_length", value: 100 }
    )]
    #[case::huge_send(
        SessionConfig { max_send_data_segment_length: MAX_U24 + 1, ..SessionConfig::default() },
        ConfigError::InvalidSegmentLength { field: "max_send_data_segment_length", value: MAX_U24 + 1 }
    )]
    #[case::zero_burst(
        SessionConfig { max_burst_length: 0, ..SessionConfig::default() },
        ConfigError::InvalidBurstLength
    )]
    #[case::small_pool(
        SessionConfig { pool_capacity: 1, ..SessionConfig::default() },
        ConfigError::InvalidPoolCapacity(1)
    )]
    #[case::zero_idle(
        SessionConfig { idle_interval: Duration::ZERO, ..SessionConfig::default() },
        ConfigError::ZeroDuration("idle_interval")
    )]
    fn invalid_values_are_rejected(#[case] cfg: SessionConfig, #[case] expected: ConfigError) {
        assert_eq!(cfg.validated().expect_err("invalid"), expected);
    }

    #[test]
    fn policy_uses_snake_case_names() {
        let de: StrDeserializer<'_, serde::de::value::Error> =
            "resync_to_target".into_deserializer();
        let policy = CmdSnPolicy::deserialize(de).expect("known variant");
        assert_eq!(policy, CmdSnPolicy::ResyncToTarget);
    }
}
